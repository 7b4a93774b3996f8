//! Error kinds emitted by the scheduler core (spec §7).

use thiserror::Error;

/// Errors the scheduler core can return from a fallible public operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Malformed affinity mask, invalid shares, unparseable command.
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// World or group id does not exist.
    #[error("not found")]
    NotFound,

    /// Admission refused, or heap exhausted.
    #[error("no memory available")]
    NoMemory,

    /// Action allocation failed.
    #[error("no resources available")]
    NoResources,

    /// Guest memory request above configured maximum.
    #[error("requested limit exceeds configured maximum")]
    LimitExceeded,

    /// Snapshot was invalidated before commit; caller retries.
    #[error("operation snapshot invalidated, retry")]
    Busy,

    /// Current world is being torn down.
    #[error("world is being torn down")]
    DeathPending,

    /// Memory-wait or cross-cpu operation exceeded its budget.
    #[error("operation timed out")]
    Timeout,

    /// Group-tree admission check failed.
    #[error("group-tree admission check failed")]
    AdmitFailed,
}

pub type Result<T> = core::result::Result<T, ScheduleError>;
