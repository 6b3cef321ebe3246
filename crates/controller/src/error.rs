use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the pump controller, the scheduler and the fertilizer
/// monitor. Local state is never mutated when one of these is returned.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("state store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("controller conflict: {0}")]
    ControllerConflict(&'static str),

    #[error("unknown fertilizer channel '{0}'")]
    UnknownFertilizer(String),
}
