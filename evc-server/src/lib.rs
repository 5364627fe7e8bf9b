//! EVC Server
//!
//! Admission controller, reservation scheduler and entity registry behind an
//! HTTP API. The controller is the only component that publishes
//! `start_charging` to a charger; chargers report back through
//! [`AdmissionController::deactivate`], either in-process via the
//! [`evc_core::ControllerLink`] implementation or over HTTP.

pub mod admission;
pub mod api;
pub mod clock;
pub mod model;
pub mod registry;
pub mod reservation;
pub mod slot;
pub mod store;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

pub use admission::{ActivateRequest, ActivateResponse, AdmissionConfig, AdmissionController, AdmissionError};
pub use api::{router, ApiError, AppState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::Registry;
pub use reservation::{ReservationError, ReservationRequest, ReservationScheduler};
pub use store::{MemoryStore, Store, StoreError};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP API listens on
    pub bind_addr: SocketAddr,
    pub admission: AdmissionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            admission: AdmissionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_max_session_secs(mut self, secs: u64) -> Self {
        self.admission.max_session_secs = secs;
        self
    }
}

/// Serve the API until the task is cancelled
pub async fn serve(config: &ServerConfig, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    serve_listener(listener, state).await
}

/// Serve the API on an already bound listener
pub async fn serve_listener(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    info!("Server: Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}
