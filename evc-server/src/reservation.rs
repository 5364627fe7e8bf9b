//! Reservation scheduler
//!
//! Validates requested slots and books them. Checks run in a fixed order and
//! the first failing rule is reported:
//!
//! 1. car exists, charger exists, charger is reservable
//! 2. both times are timezone-naive
//! 3. both times are strictly in the future
//! 4. both times sit on :00 or :30 with zero seconds
//! 5. the slot is exactly 30 minutes
//! 6. the charger is not already booked for the identical (start, end)
//!
//! Only identical slots collide; a reservation shifted by 15 minutes is
//! accepted even though it overlaps.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use evc_core::{CarId, ChargerId, ErrorKind, ReservationId};

use crate::clock::Clock;
use crate::model::{NewReservation, Reservation};
use crate::slot::{self, RequestedTime};
use crate::store::{Store, StoreError};

/// Reservation request as received from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub car_id: CarId,
    pub charger_id: ChargerId,
    pub start_time: RequestedTime,
    pub end_time: RequestedTime,
}

/// Reasons a reservation is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("Car {0} does not exist")]
    CarNotFound(CarId),

    #[error("Charger {0} does not exist")]
    ChargerNotFound(ChargerId),

    #[error("Charger {0} is not reservable")]
    NotReservable(ChargerId),

    #[error("One of the datetimes carries a timezone; reservation times must be naive")]
    TimezoneAware,

    #[error("One of the datetimes has already passed")]
    InThePast,

    #[error("The start time or end time is not HH:00 or HH:30")]
    Misaligned,

    #[error("Time slot is not exactly 30 minutes long")]
    WrongLength,

    #[error("Charger {0} is already booked for the specified time slot")]
    SlotTaken(ChargerId),

    #[error(transparent)]
    Store(StoreError),
}

impl ReservationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReservationError::CarNotFound(_) | ReservationError::ChargerNotFound(_) => {
                ErrorKind::NotFound
            }
            ReservationError::NotReservable(_)
            | ReservationError::TimezoneAware
            | ReservationError::InThePast
            | ReservationError::Misaligned
            | ReservationError::WrongLength => ErrorKind::Validation,
            ReservationError::SlotTaken(_) => ErrorKind::Conflict,
            ReservationError::Store(e) => e.kind(),
        }
    }
}

impl From<StoreError> for ReservationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotTaken { charger_id, .. } => ReservationError::SlotTaken(charger_id),
            other => ReservationError::Store(other),
        }
    }
}

/// Books 30-minute charging slots
pub struct ReservationScheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ReservationScheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate and book a slot, evaluated against the scheduler's clock
    pub fn create(&self, request: ReservationRequest) -> Result<Reservation, ReservationError> {
        let now = self.clock.now();
        self.create_at(request, now)
    }

    /// Validate and book a slot as of `now`
    pub fn create_at(
        &self,
        request: ReservationRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, ReservationError> {
        let result = self.validate(&request, now).and_then(|slot| {
            self.store.insert_reservation(slot).map_err(ReservationError::from)
        });

        match &result {
            Ok(r) => info!(
                "Scheduler: Reserved charger {} for car {} from {} to {} (id={})",
                r.charger_id, r.car_id, r.start_time, r.end_time, r.id
            ),
            Err(e) => warn!(
                "Scheduler: Rejected reservation of charger {} for car {}: {}",
                request.charger_id, request.car_id, e
            ),
        }

        result
    }

    fn validate(
        &self,
        request: &ReservationRequest,
        now: NaiveDateTime,
    ) -> Result<NewReservation, ReservationError> {
        if self.store.car(&request.car_id).is_none() {
            return Err(ReservationError::CarNotFound(request.car_id.clone()));
        }

        let charger = self
            .store
            .charger(request.charger_id)
            .ok_or(ReservationError::ChargerNotFound(request.charger_id))?;
        if !charger.is_reservable {
            return Err(ReservationError::NotReservable(charger.id));
        }

        let (Some(start), Some(end)) = (request.start_time.naive(), request.end_time.naive()) else {
            return Err(ReservationError::TimezoneAware);
        };

        if start <= now || end <= now {
            return Err(ReservationError::InThePast);
        }

        if !(slot::is_slot_boundary(&start) && slot::is_slot_boundary(&end)) {
            return Err(ReservationError::Misaligned);
        }

        if !slot::is_single_slot(&start, &end) {
            return Err(ReservationError::WrongLength);
        }

        Ok(NewReservation {
            car_id: request.car_id.clone(),
            charger_id: charger.id,
            start_time: start,
            end_time: end,
        })
    }

    pub fn get(&self, id: ReservationId) -> Result<Reservation, ReservationError> {
        self.store
            .reservation(id)
            .ok_or(ReservationError::Store(StoreError::ReservationNotFound(id)))
    }
}
