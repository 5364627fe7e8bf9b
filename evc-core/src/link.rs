//! Charger → admission controller link
//!
//! The charger agent talks to the controller through this trait only, so the
//! same agent runs against an in-process controller, a remote one, or a test
//! double that fails on demand.

use std::future::Future;

use thiserror::Error;

use crate::types::{ChargerId, ErrorKind};

/// Errors returned by a controller link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The controller could not be reached at all
    #[error("Controller unreachable: {0}")]
    Unreachable(String),

    /// The controller answered and refused the request
    #[error("Controller rejected request ({kind}): {reason}")]
    Rejected { kind: ErrorKind, reason: String },
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Unreachable(_) => ErrorKind::Connectivity,
            LinkError::Rejected { kind, .. } => *kind,
        }
    }

    /// True when the controller never saw the request
    pub fn is_connectivity(&self) -> bool {
        matches!(self, LinkError::Unreachable(_))
    }
}

/// Calls a charger makes to the admission controller
pub trait ControllerLink: Send + Sync + 'static {
    /// Mark the charger available again
    fn deactivate(&self, charger_id: ChargerId) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Liveness check
    fn ping(&self) -> impl Future<Output = Result<(), LinkError>> + Send;
}
