use serde::Serialize;
use thiserror::Error;

use crate::domain::LifecycleState;

/// Rejected control request. Nothing was changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("battery '{0}' already exists")]
    DuplicateId(String),

    #[error("battery '{0}' not found")]
    NotFound(String),

    #[error("cannot {operation} battery '{id}' while {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("simulation manager is shutting down")]
    ShuttingDown,
}

/// Why a loop stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("persistent fault after {failures} consecutive failed ticks: {last_error}")]
pub struct PersistentFault {
    pub failures: u32,
    pub last_error: String,
}
