//! Core state-machine types

/// Lifecycle of the supervisor's trace of the root process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingState {
    /// Root process seized, fork events flowing.
    Tracing,
    /// Stop requested; waiting for the root's group-stop to detach cleanly.
    Stopping,
    /// Detached; injection suppressed until a start request.
    Stopped,
    /// Exit requested; the event loop is winding down.
    Exiting,
}

impl TracingState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TracingState::Tracing => "tracing",
            TracingState::Stopping => "stopping",
            TracingState::Stopped => "stopped",
            TracingState::Exiting => "exiting",
        }
    }
}

/// Lifecycle of one tracked descendant of the root process.
///
/// Created on a fork event under trace, destroyed on detach or exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Attached via fork-tracing; has not exec'd yet.
    New,
    /// Observed an exec event; program path known.
    Execd,
    /// Currently being driven by the injection controller.
    Injecting,
    /// Injected (or skipped) and released.
    Running,
}
