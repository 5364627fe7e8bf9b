//! Persistence collaborator for cars, stations, chargers and reservations
//!
//! The controller only relies on the [`Store`] contract: reads by id, lists by
//! relation, and two atomic writes: a compare-and-set on `is_available` and a
//! reservation insert that refuses an already-booked slot. Any backend that
//! provides per-row conditional updates can stand behind it; [`MemoryStore`]
//! does so with a single lock.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use evc_core::{CarId, ChargerId, ErrorKind, ReservationId, StationId};

use crate::model::*;

/// Errors raised by a store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Car {0} already exists")]
    DuplicateCar(CarId),

    #[error("Car {0} not found")]
    CarNotFound(CarId),

    #[error("Charger {0} not found")]
    ChargerNotFound(ChargerId),

    #[error("Station {0} not found")]
    StationNotFound(StationId),

    #[error("Reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("Charger {charger_id} is already booked from {start} to {end}")]
    SlotTaken {
        charger_id: ChargerId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::DuplicateCar(_) | StoreError::SlotTaken { .. } => ErrorKind::Conflict,
            StoreError::CarNotFound(_)
            | StoreError::ChargerNotFound(_)
            | StoreError::StationNotFound(_)
            | StoreError::ReservationNotFound(_) => ErrorKind::NotFound,
        }
    }
}

/// Storage contract used by the controller and the scheduler
pub trait Store: Send + Sync {
    fn insert_car(&self, car: NewCar) -> Result<Car, StoreError>;
    fn car(&self, id: &CarId) -> Option<Car>;

    fn insert_station(&self) -> Station;
    fn station(&self, id: StationId) -> Option<Station>;
    fn chargers_at(&self, station_id: StationId) -> Vec<Charger>;

    /// Fails if the station does not exist
    fn insert_charger(&self, charger: NewCharger) -> Result<Charger, StoreError>;
    fn charger(&self, id: ChargerId) -> Option<Charger>;
    fn update_charger(&self, id: ChargerId, update: ChargerUpdate) -> Result<Charger, StoreError>;

    /// Atomically set `is_available` to `new` if it currently equals
    /// `expected`. Returns whether the write happened.
    fn compare_and_set_available(
        &self,
        id: ChargerId,
        expected: bool,
        new: bool,
    ) -> Result<bool, StoreError>;

    /// Insert unless the same charger already holds an identical
    /// (start, end) pair
    fn insert_reservation(&self, reservation: NewReservation) -> Result<Reservation, StoreError>;
    fn reservation(&self, id: ReservationId) -> Option<Reservation>;
    fn reservations_for_car(&self, car_id: &CarId) -> Vec<Reservation>;
    fn reservations_for_charger(&self, charger_id: ChargerId) -> Vec<Reservation>;
}

#[derive(Default)]
struct Tables {
    cars: BTreeMap<CarId, Car>,
    stations: BTreeMap<StationId, Station>,
    chargers: BTreeMap<ChargerId, Charger>,
    reservations: BTreeMap<ReservationId, Reservation>,
    next_station: u32,
    next_charger: u32,
    next_reservation: u64,
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_car(&self, car: NewCar) -> Result<Car, StoreError> {
        let mut tables = self.tables.write();
        if tables.cars.contains_key(&car.id) {
            return Err(StoreError::DuplicateCar(car.id));
        }
        let car = Car { id: car.id };
        tables.cars.insert(car.id.clone(), car.clone());
        debug!("Store: Inserted car {}", car.id);
        Ok(car)
    }

    fn car(&self, id: &CarId) -> Option<Car> {
        self.tables.read().cars.get(id).cloned()
    }

    fn insert_station(&self) -> Station {
        let mut tables = self.tables.write();
        tables.next_station += 1;
        let station = Station {
            id: StationId(tables.next_station),
        };
        tables.stations.insert(station.id, station.clone());
        debug!("Store: Inserted station {}", station.id);
        station
    }

    fn station(&self, id: StationId) -> Option<Station> {
        self.tables.read().stations.get(&id).cloned()
    }

    fn chargers_at(&self, station_id: StationId) -> Vec<Charger> {
        self.tables
            .read()
            .chargers
            .values()
            .filter(|c| c.station_id == station_id)
            .cloned()
            .collect()
    }

    fn insert_charger(&self, charger: NewCharger) -> Result<Charger, StoreError> {
        let mut tables = self.tables.write();
        if !tables.stations.contains_key(&charger.station_id) {
            return Err(StoreError::StationNotFound(charger.station_id));
        }
        tables.next_charger += 1;
        let charger = Charger {
            id: ChargerId(tables.next_charger),
            station_id: charger.station_id,
            is_reservable: charger.is_reservable,
            is_available: true,
        };
        tables.chargers.insert(charger.id, charger.clone());
        debug!(
            "Store: Inserted charger {} at station {} (reservable={})",
            charger.id, charger.station_id, charger.is_reservable
        );
        Ok(charger)
    }

    fn charger(&self, id: ChargerId) -> Option<Charger> {
        self.tables.read().chargers.get(&id).cloned()
    }

    fn update_charger(&self, id: ChargerId, update: ChargerUpdate) -> Result<Charger, StoreError> {
        let mut tables = self.tables.write();
        let charger = tables
            .chargers
            .get_mut(&id)
            .ok_or(StoreError::ChargerNotFound(id))?;
        if let Some(reservable) = update.is_reservable {
            charger.is_reservable = reservable;
        }
        if let Some(available) = update.is_available {
            charger.is_available = available;
        }
        Ok(charger.clone())
    }

    fn compare_and_set_available(
        &self,
        id: ChargerId,
        expected: bool,
        new: bool,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let charger = tables
            .chargers
            .get_mut(&id)
            .ok_or(StoreError::ChargerNotFound(id))?;
        if charger.is_available != expected {
            return Ok(false);
        }
        charger.is_available = new;
        Ok(true)
    }

    fn insert_reservation(&self, reservation: NewReservation) -> Result<Reservation, StoreError> {
        let mut tables = self.tables.write();

        let taken = tables.reservations.values().any(|r| {
            r.charger_id == reservation.charger_id
                && r.start_time == reservation.start_time
                && r.end_time == reservation.end_time
        });
        if taken {
            return Err(StoreError::SlotTaken {
                charger_id: reservation.charger_id,
                start: reservation.start_time,
                end: reservation.end_time,
            });
        }

        tables.next_reservation += 1;
        let reservation = Reservation {
            id: ReservationId(tables.next_reservation),
            car_id: reservation.car_id,
            charger_id: reservation.charger_id,
            start_time: reservation.start_time,
            end_time: reservation.end_time,
        };
        tables.reservations.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.tables.read().reservations.get(&id).cloned()
    }

    fn reservations_for_car(&self, car_id: &CarId) -> Vec<Reservation> {
        self.tables
            .read()
            .reservations
            .values()
            .filter(|r| &r.car_id == car_id)
            .cloned()
            .collect()
    }

    fn reservations_for_charger(&self, charger_id: ChargerId) -> Vec<Reservation> {
        self.tables
            .read()
            .reservations
            .values()
            .filter(|r| r.charger_id == charger_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_duplicate_car_rejected() {
        let store = MemoryStore::new();
        store.insert_car(NewCar { id: "car-A".into() }).unwrap();
        let err = store.insert_car(NewCar { id: "car-A".into() }).unwrap_err();
        assert_eq!(err, StoreError::DuplicateCar("car-A".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_charger_requires_station() {
        let store = MemoryStore::new();
        let err = store
            .insert_charger(NewCharger { is_reservable: false, station_id: StationId(9) })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let station = store.insert_station();
        let charger = store
            .insert_charger(NewCharger { is_reservable: true, station_id: station.id })
            .unwrap();
        assert!(charger.is_available);
        assert_eq!(store.chargers_at(station.id), vec![charger]);
    }

    #[test]
    fn test_compare_and_set_available() {
        let store = MemoryStore::new();
        let station = store.insert_station();
        let charger = store
            .insert_charger(NewCharger { is_reservable: false, station_id: station.id })
            .unwrap();

        assert!(store.compare_and_set_available(charger.id, true, false).unwrap());
        assert!(!store.compare_and_set_available(charger.id, true, false).unwrap());
        assert!(!store.charger(charger.id).unwrap().is_available);
        assert!(store.compare_and_set_available(charger.id, false, true).unwrap());

        assert!(store.compare_and_set_available(ChargerId(99), true, false).is_err());
    }

    #[test]
    fn test_update_charger_partial() {
        let store = MemoryStore::new();
        let station = store.insert_station();
        let charger = store
            .insert_charger(NewCharger { is_reservable: false, station_id: station.id })
            .unwrap();

        let updated = store
            .update_charger(charger.id, ChargerUpdate { is_reservable: Some(true), is_available: None })
            .unwrap();
        assert!(updated.is_reservable);
        assert!(updated.is_available);
    }

    #[test]
    fn test_identical_slot_rejected_overlap_accepted() {
        let store = MemoryStore::new();
        let slot = NewReservation {
            car_id: "car-A".into(),
            charger_id: ChargerId(1),
            start_time: at(14, 0),
            end_time: at(14, 30),
        };

        let first = store.insert_reservation(slot.clone()).unwrap();
        assert_eq!(store.reservation(first.id), Some(first.clone()));

        let err = store
            .insert_reservation(NewReservation { car_id: "car-B".into(), ..slot.clone() })
            .unwrap_err();
        assert!(matches!(err, StoreError::SlotTaken { .. }));

        // Same slot on another charger is fine
        store
            .insert_reservation(NewReservation { charger_id: ChargerId(2), ..slot.clone() })
            .unwrap();

        // Partial overlap is not detected
        store
            .insert_reservation(NewReservation {
                start_time: at(14, 15),
                end_time: at(14, 45),
                ..slot
            })
            .unwrap();

        assert_eq!(store.reservations_for_charger(ChargerId(1)).len(), 2);
        assert_eq!(store.reservations_for_car(&"car-A".into()).len(), 2);
    }
}
