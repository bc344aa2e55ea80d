//! Error types for the speculation engine
//!
//! The engine itself has no recoverable failures: missing feedback is
//! cached and degrades hints, and broken bytecode aborts. The only errors
//! a host can observe are misuses of the top-level entry point.

use thiserror::Error;

/// Why a top-level analysis could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpeculationError {
    /// The subject handle does not name a closure
    #[error("subject is not a function")]
    NotAFunction,
    /// The closure never ran, so it has no profile data to speculate on
    #[error("function has no feedback vector")]
    MissingFeedbackVector,
    /// The function has no bytecode to walk
    #[error("function has no bytecode")]
    MissingBytecode,
}

/// Result type for engine entry points
pub type Result<T> = std::result::Result<T, SpeculationError>;
