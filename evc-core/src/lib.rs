//! EVC Core Library
//!
//! Wire types and transport shared by the car agent, the charger agent and the
//! admission controller. Agents never call each other directly: every command
//! travels as a JSON object over the [`MessageBus`], addressed to a per-car or
//! per-charger topic.

pub mod types;
pub mod bus;
pub mod link;

pub use types::*;
pub use bus::{BusConfig, BusError, Delivery, MessageBus, Subscription, Topic};
pub use link::{ControllerLink, LinkError};
