//! Structured error types for the injector
//!
//! The taxonomy mirrors how a failure must be contained: a `Transient` or
//! `ProtocolMismatch` error abandons one injection attempt, an `ImageFormat`
//! error aborts one load, and `ResourceExhausted` halts injection entirely
//! until an explicit start request. None of them terminate the supervisor.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InjectorError {
    /// The target exited or changed state under us before an operation
    /// completed. Logged, attempt abandoned, supervisor unaffected.
    #[error("target raced away: {0}")]
    Transient(String),

    /// An observed stop/signal/event does not match the expected transition.
    /// The current injection is aborted and the target detached defensively.
    #[error("unexpected tracee state: {0}")]
    ProtocolMismatch(String),

    /// Bad magic, missing mandatory dynamic entries, out-of-bounds table
    /// offsets, unresolved mandatory symbols, unsupported relocation types.
    #[error("bad module image: {0}")]
    ImageFormat(String),

    /// Crash-loop threshold exceeded; injection halts until a start request.
    #[error("injection halted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Os(#[from] nix::errno::Errno),
}

impl InjectorError {
    /// Classify an errno from an operation on a traced process: a vanished
    /// tracee is a race loss, everything else is an OS failure.
    pub fn from_tracee_errno(err: nix::errno::Errno, what: &str) -> Self {
        if err == nix::errno::Errno::ESRCH {
            InjectorError::Transient(format!("{what}: process is gone"))
        } else {
            InjectorError::Os(err)
        }
    }
}
