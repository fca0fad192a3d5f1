//! Domain model for the injector
//!
//! Core types and the structured error taxonomy shared by every component.

pub mod errors;
pub mod types;

pub use errors::InjectorError;
pub use types::{ProcessState, TracingState};

pub use injector_common::AbiWidth;
