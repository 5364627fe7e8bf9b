//! EVC Agents
//!
//! Car and charger agents. Each agent is a tokio task that owns one state
//! machine and drains a single queue fed by bus deliveries, timer expiries and
//! local triggers, one event at a time. Agents never share memory; they only
//! talk over the [`evc_core::MessageBus`] and, for chargers, through a
//! [`evc_core::ControllerLink`], either in-process or over HTTP with
//! [`HttpControllerLink`].

pub mod config;
pub mod retry;
pub mod runtime;
pub mod car;
pub mod charger;
pub mod http_link;

pub use config::{CarConfig, ChargerConfig, BATTERY_CAP};
pub use retry::RetryPolicy;
pub use runtime::{TimerFired, Timers};
pub use car::{next_battery, CarAgent, CarHandle, CarSnapshot, CarState};
pub use http_link::HttpControllerLink;
pub use charger::{ChargerAgent, ChargerHandle, ChargerSnapshot, ChargerState, ChargingSession, Fault};
