//! Configuration for the car and charger agents

use std::time::Duration;

use evc_core::{CarId, ChargerId};

use crate::retry::RetryPolicy;

/// Highest battery level a car reports while charging
pub const BATTERY_CAP: u8 = 98;

/// Car agent configuration
#[derive(Debug, Clone)]
pub struct CarConfig {
    pub car_id: CarId,

    /// Battery level at start-up, in percent
    pub initial_battery: u8,

    /// Interval between battery updates while charging
    pub update_interval: Duration,

    /// Percentage points gained per update
    pub step: u8,
}

impl CarConfig {
    pub fn new(car_id: impl Into<String>) -> Self {
        Self {
            car_id: CarId::new(car_id),
            initial_battery: 10,
            update_interval: Duration::from_millis(500),
            step: 2,
        }
    }

    pub fn with_initial_battery(mut self, percentage: u8) -> Self {
        self.initial_battery = percentage;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_step(mut self, step: u8) -> Self {
        self.step = step;
        self
    }
}

/// Charger agent configuration
#[derive(Debug, Clone)]
pub struct ChargerConfig {
    pub charger_id: ChargerId,

    /// Health-check period while idle
    pub idle_health_interval: Duration,

    /// Health-check period while a nozzle is connected
    pub connected_health_interval: Duration,

    /// Wait before leaving the error state for non-connectivity faults
    pub error_pause: Duration,

    /// Deactivate retries after a connectivity fault
    pub retry: RetryPolicy,
}

impl ChargerConfig {
    pub fn new(charger_id: ChargerId) -> Self {
        Self {
            charger_id,
            idle_health_interval: Duration::from_secs(5),
            connected_health_interval: Duration::from_secs(1),
            error_pause: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }

    /// Set both health-check periods
    pub fn with_health_intervals(mut self, idle: Duration, connected: Duration) -> Self {
        self.idle_health_interval = idle;
        self.connected_health_interval = connected;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
