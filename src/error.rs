//! Error taxonomy shared by every simulator operation.

use thiserror::Error;

/// Errors returned by the simulator, its channels and the fiber API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SimError {
    /// Allocation failed. Retrying later is always valid.
    #[error("allocation failed")]
    Alloc,
    /// Precondition violation: unknown group, malformed run config, bad registration order.
    #[error("invalid argument")]
    Invalid,
    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,
    /// A non-blocking call found no runnable work.
    #[error("nothing to do")]
    NothingToDo,
    /// The channel or task facility has been blocked for shutdown.
    #[error("channel is locked")]
    Locked,
    /// The simulator lifecycle is in an incompatible state.
    #[error("operation not allowed in the current state")]
    NotAllowed,
    /// A bounded queue is full.
    #[error("queue is full")]
    WouldBlock,
    /// Unspecified failure.
    #[error("generic error")]
    Generic,
    /// Simulation-defined error code.
    #[error("simulation error {0}")]
    Simulation(u32),
}

pub type Result<T> = std::result::Result<T, SimError>;
