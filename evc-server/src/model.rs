//! Persistent entities and their API views

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use evc_core::{CarId, ChargerId, ReservationId, StationId};

/// A registered car
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: CarId,
}

/// A charging station grouping chargers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
}

/// A charger as the controller sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charger {
    pub id: ChargerId,
    pub station_id: StationId,
    pub is_reservable: bool,
    /// False while a session is active or pending
    pub is_available: bool,
}

/// A booked 30-minute slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub car_id: CarId,
    pub charger_id: ChargerId,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

impl Reservation {
    /// True if `now` falls inside `[start_time, end_time)`
    pub fn covers(&self, now: NaiveDateTime) -> bool {
        self.start_time <= now && now < self.end_time
    }
}

/// Body of a car registration
#[derive(Debug, Clone, Deserialize)]
pub struct NewCar {
    pub id: CarId,
}

/// Body of a charger registration
#[derive(Debug, Clone, Deserialize)]
pub struct NewCharger {
    #[serde(default)]
    pub is_reservable: bool,
    pub station_id: StationId,
}

/// Partial charger update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargerUpdate {
    #[serde(default)]
    pub is_reservable: Option<bool>,
    #[serde(default)]
    pub is_available: Option<bool>,
}

/// Validated reservation ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub car_id: CarId,
    pub charger_id: ChargerId,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
}

/// Car together with its reservations
#[derive(Debug, Clone, Serialize)]
pub struct CarView {
    pub id: CarId,
    pub reservations: Vec<Reservation>,
}

/// Charger together with its reservations
#[derive(Debug, Clone, Serialize)]
pub struct ChargerView {
    pub id: ChargerId,
    pub station_id: StationId,
    pub is_reservable: bool,
    pub is_available: bool,
    pub reservations: Vec<Reservation>,
}

/// Station together with its chargers
#[derive(Debug, Clone, Serialize)]
pub struct StationView {
    pub id: StationId,
    pub chargers: Vec<ChargerView>,
}
