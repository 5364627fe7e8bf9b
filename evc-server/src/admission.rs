//! Admission controller
//!
//! Gatekeeper between clients and chargers. `activate` grants a session and
//! tells the charger to start; `deactivate` is called by the charger once the
//! session is over and only flips availability back.
//!
//! The availability check is enforced by the store's compare-and-set, so two
//! concurrent activations of one charger can never both succeed.

use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use evc_core::{
    BusError, CarId, ChargerCommand, ChargerId, ControllerLink, ErrorKind, LinkError, MessageBus,
    MAX_SESSION_SECS, MAX_TARGET_PERCENTAGE,
};

use crate::clock::Clock;
use crate::model::Reservation;
use crate::slot;
use crate::store::{Store, StoreError};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Upper bound for any granted session, in seconds
    pub max_session_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_session_secs: MAX_SESSION_SECS,
        }
    }
}

/// Activation request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateRequest {
    pub car_id: CarId,
    pub target_percentage: i32,
    /// Evaluation instant override; wall clock when absent
    #[serde(default, alias = "date_now")]
    pub now: Option<NaiveDateTime>,
}

impl ActivateRequest {
    pub fn new(car_id: impl Into<String>, target_percentage: i32) -> Self {
        Self {
            car_id: CarId::new(car_id),
            target_percentage,
            now: None,
        }
    }

    pub fn at(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }
}

/// Activation result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateResponse {
    /// Longest the session may run, in seconds
    pub max_charging_time: u64,
}

/// Reasons an activation or deactivation is refused
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Charger {0} not found")]
    ChargerNotFound(ChargerId),

    #[error("Car {0} not found")]
    CarNotFound(CarId),

    #[error("Charger {0} is currently unavailable")]
    ChargerUnavailable(ChargerId),

    #[error("Charger {0} is currently available")]
    ChargerAlreadyAvailable(ChargerId),

    #[error("Target percentage {0} is not between 1 and 100")]
    InvalidTarget(i32),

    #[error("Car {car_id} has no reservation for charger {charger_id} at this time")]
    NoReservation { car_id: CarId, charger_id: ChargerId },

    #[error("Failed to notify charger: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionError::ChargerNotFound(_) | AdmissionError::CarNotFound(_) => {
                ErrorKind::NotFound
            }
            AdmissionError::ChargerUnavailable(_) | AdmissionError::ChargerAlreadyAvailable(_) => {
                ErrorKind::Conflict
            }
            AdmissionError::InvalidTarget(_) | AdmissionError::NoReservation { .. } => {
                ErrorKind::Validation
            }
            AdmissionError::Bus(e) => e.kind(),
            AdmissionError::Store(e) => e.kind(),
        }
    }
}

/// Server-side gate for charger activation
pub struct AdmissionController {
    store: Arc<dyn Store>,
    bus: MessageBus,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn Store>, bus: MessageBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            config: AdmissionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AdmissionConfig) -> Self {
        self.config = config;
        self
    }

    /// Authorize a session on `charger_id` and tell the charger to start
    pub fn activate(
        &self,
        charger_id: ChargerId,
        request: ActivateRequest,
    ) -> Result<ActivateResponse, AdmissionError> {
        let result = self.try_activate(charger_id, &request);
        if let Err(e) = &result {
            warn!("Admission: Refused activation of charger {}: {}", charger_id, e);
        }
        result
    }

    fn try_activate(
        &self,
        charger_id: ChargerId,
        request: &ActivateRequest,
    ) -> Result<ActivateResponse, AdmissionError> {
        let charger = self
            .store
            .charger(charger_id)
            .ok_or(AdmissionError::ChargerNotFound(charger_id))?;

        if self.store.car(&request.car_id).is_none() {
            return Err(AdmissionError::CarNotFound(request.car_id.clone()));
        }

        if !charger.is_available {
            return Err(AdmissionError::ChargerUnavailable(charger_id));
        }

        let target = request.target_percentage;
        if target <= 0 || target > i32::from(MAX_TARGET_PERCENTAGE) {
            return Err(AdmissionError::InvalidTarget(target));
        }

        let now = request.now.unwrap_or_else(|| self.clock.now());
        let max_charging_time = if charger.is_reservable {
            let reservation = self
                .covering_reservation(&request.car_id, charger_id, now)
                .ok_or_else(|| AdmissionError::NoReservation {
                    car_id: request.car_id.clone(),
                    charger_id,
                })?;
            let remaining = slot::seconds_until(&reservation.end_time, &now).max(0) as u64;
            remaining.min(self.config.max_session_secs)
        } else {
            self.config.max_session_secs
        };

        // Lost race: someone else flipped it since the read above
        if !self.store.compare_and_set_available(charger_id, true, false)? {
            return Err(AdmissionError::ChargerUnavailable(charger_id));
        }

        let command = ChargerCommand::StartCharging {
            car_id: request.car_id.clone(),
            battery_target: target as u8,
            max_charging_time,
        };
        if let Err(e) = self.bus.publish_to_charger(charger_id, &command) {
            error!(
                "Admission: Could not reach charger {}, restoring availability: {}",
                charger_id, e
            );
            self.store.compare_and_set_available(charger_id, false, true)?;
            return Err(e.into());
        }

        info!(
            "Admission: Activated charger {} for car {} (target={}%, max={}s)",
            charger_id, request.car_id, target, max_charging_time
        );

        Ok(ActivateResponse { max_charging_time })
    }

    fn covering_reservation(
        &self,
        car_id: &CarId,
        charger_id: ChargerId,
        now: NaiveDateTime,
    ) -> Option<Reservation> {
        self.store
            .reservations_for_car(car_id)
            .into_iter()
            .find(|r| r.charger_id == charger_id && r.covers(now))
    }

    /// Make a charger available again after its session ended
    pub fn deactivate(&self, charger_id: ChargerId) -> Result<(), AdmissionError> {
        if self.store.charger(charger_id).is_none() {
            warn!("Admission: Deactivate for unknown charger {}", charger_id);
            return Err(AdmissionError::ChargerNotFound(charger_id));
        }

        if !self.store.compare_and_set_available(charger_id, false, true)? {
            warn!("Admission: Charger {} is already available", charger_id);
            return Err(AdmissionError::ChargerAlreadyAvailable(charger_id));
        }

        info!("Admission: Deactivated charger {}", charger_id);
        Ok(())
    }
}

impl ControllerLink for AdmissionController {
    async fn deactivate(&self, charger_id: ChargerId) -> Result<(), LinkError> {
        AdmissionController::deactivate(self, charger_id).map_err(|e| LinkError::Rejected {
            kind: e.kind(),
            reason: e.to_string(),
        })
    }

    async fn ping(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{NewCar, NewCharger, NewReservation};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use evc_core::{Delivery, Topic};
    use parking_lot::Mutex;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 5, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: MessageBus,
        clock: Arc<ManualClock>,
        controller: AdmissionController,
        reservable: ChargerId,
        plain: ChargerId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_car(NewCar { id: "car-A".into() }).unwrap();
        let station = store.insert_station();
        let reservable = store
            .insert_charger(NewCharger { is_reservable: true, station_id: station.id })
            .unwrap()
            .id;
        let plain = store
            .insert_charger(NewCharger { is_reservable: false, station_id: station.id })
            .unwrap()
            .id;
        store
            .insert_reservation(NewReservation {
                car_id: "car-A".into(),
                charger_id: reservable,
                start_time: at(14, 0),
                end_time: at(14, 30),
            })
            .unwrap();

        let bus = MessageBus::default();
        let clock = Arc::new(ManualClock::new(at(14, 10)));
        let controller = AdmissionController::new(store.clone(), bus.clone(), clock.clone());
        Fixture { store, bus, clock, controller, reservable, plain }
    }

    fn capture(bus: &MessageBus, charger: ChargerId) -> (Arc<Mutex<Vec<Delivery>>>, evc_core::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(Topic::Charger(charger), move |d| sink.lock().push(d));
        (seen, sub)
    }

    #[test]
    fn test_activate_within_reservation() {
        let f = fixture();
        let (seen, _sub) = capture(&f.bus, f.reservable);

        let resp = f
            .controller
            .activate(f.reservable, ActivateRequest::new("car-A", 80).at(at(14, 10)))
            .unwrap();
        assert_eq!(resp.max_charging_time, 1200);
        assert!(!f.store.charger(f.reservable).unwrap().is_available);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            ChargerCommand::from_bytes(&seen[0].payload).unwrap(),
            ChargerCommand::StartCharging {
                car_id: "car-A".into(),
                battery_target: 80,
                max_charging_time: 1200,
            }
        );
    }

    #[test]
    fn test_activate_after_reservation_ended() {
        let f = fixture();
        let err = f
            .controller
            .activate(f.reservable, ActivateRequest::new("car-A", 80).at(at(14, 35)))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::NoReservation { .. }));
        assert!(err.to_string().contains("no reservation"));
        assert!(f.store.charger(f.reservable).unwrap().is_available);
    }

    #[test]
    fn test_activate_uses_clock_without_override() {
        let f = fixture();
        f.clock.set(at(14, 25));
        let resp = f
            .controller
            .activate(f.reservable, ActivateRequest::new("car-A", 50))
            .unwrap();
        assert_eq!(resp.max_charging_time, 300);
    }

    #[test]
    fn test_reservation_end_is_exclusive() {
        let f = fixture();
        let err = f
            .controller
            .activate(f.reservable, ActivateRequest::new("car-A", 80).at(at(14, 30)))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::NoReservation { .. }));
    }

    #[test]
    fn test_non_reservable_defaults_to_max_session() {
        let f = fixture();
        let resp = f
            .controller
            .activate(f.plain, ActivateRequest::new("car-A", 100))
            .unwrap();
        assert_eq!(resp.max_charging_time, MAX_SESSION_SECS);
    }

    #[test]
    fn test_activate_rejections() {
        let f = fixture();

        let err = f.controller.activate(ChargerId(99), ActivateRequest::new("car-A", 80)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = f.controller.activate(f.plain, ActivateRequest::new("car-Z", 80)).unwrap_err();
        assert!(matches!(err, AdmissionError::CarNotFound(_)));

        for target in [0, -5, 101] {
            let err = f.controller.activate(f.plain, ActivateRequest::new("car-A", target)).unwrap_err();
            assert!(matches!(err, AdmissionError::InvalidTarget(t) if t == target));
        }

        f.controller.activate(f.plain, ActivateRequest::new("car-A", 80)).unwrap();
        let err = f.controller.activate(f.plain, ActivateRequest::new("car-A", 80)).unwrap_err();
        assert!(matches!(err, AdmissionError::ChargerUnavailable(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_failed_publish_restores_availability() {
        let f = fixture();
        f.bus.partition();

        let err = f.controller.activate(f.plain, ActivateRequest::new("car-A", 80)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert!(f.store.charger(f.plain).unwrap().is_available);
    }

    #[test]
    fn test_deactivate() {
        let f = fixture();
        let (seen, _sub) = capture(&f.bus, f.plain);

        let err = f.controller.deactivate(f.plain).unwrap_err();
        assert!(matches!(err, AdmissionError::ChargerAlreadyAvailable(_)));

        f.controller.activate(f.plain, ActivateRequest::new("car-A", 80)).unwrap();
        f.controller.deactivate(f.plain).unwrap();
        assert!(f.store.charger(f.plain).unwrap().is_available);

        // Only the start command went out
        assert_eq!(seen.lock().len(), 1);

        let err = f.controller.deactivate(ChargerId(99)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_concurrent_activations_single_winner() {
        let f = fixture();
        let barrier = std::sync::Barrier::new(8);

        let wins = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        f.controller.activate(f.plain, ActivateRequest::new("car-A", 80))
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| r.is_ok())
                .count()
        });

        assert_eq!(wins, 1);
        assert!(!f.store.charger(f.plain).unwrap().is_available);
    }

    #[tokio::test]
    async fn test_link_maps_rejection() {
        let f = fixture();
        let err = ControllerLink::deactivate(&f.controller, f.plain).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!err.is_connectivity());
        assert!(f.controller.ping().await.is_ok());
    }
}
