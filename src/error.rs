//! Error handling for facelive-rs
//!
//! This module defines the crate-level error type and a Result alias.
//! Subsystems keep their own narrower enums (`PipelineError`, `ControlError`,
//! `LifecycleError`, `StageError`) which convert into [`FaceliveError`].

use crate::backend::{LifecycleError, StageError};
use crate::control::ControlError;
use crate::pipeline::PipelineError;
use thiserror::Error;

/// Main error type for facelive-rs operations
#[derive(Error, Debug)]
pub enum FaceliveError {
    /// Errors related to pipeline wiring, connections and the frame heap
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to control sheet fields
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Stage start/stop misuse
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Errors raised inside a stage worker
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to the persisted state database
    #[error("State database error: {0}")]
    State(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<FaceliveError>,
    },
}

impl FaceliveError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        FaceliveError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for FaceliveError {
    fn from(err: serde_json::Error) -> Self {
        FaceliveError::Serialization(err.to_string())
    }
}

/// Result type alias for facelive-rs operations
pub type Result<T> = std::result::Result<T, FaceliveError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<FaceliveError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FaceliveError::Config("missing heap section".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing heap section");
    }

    #[test]
    fn test_error_with_context() {
        let err = FaceliveError::State("disk full".to_string());
        let with_ctx = err.with_context("Failed to save detector state");
        assert!(with_ctx.to_string().contains("Failed to save detector state"));
        assert!(with_ctx.to_string().contains("disk full"));
    }

    #[test]
    fn test_result_ext_wraps_subsystem_errors() {
        let res: std::result::Result<(), PipelineError> = Err(PipelineError::CycleDetected);
        let err = res.context("Building default graph").unwrap_err();
        assert!(matches!(err, FaceliveError::WithContext { .. }));
        assert!(err.to_string().starts_with("Building default graph"));
    }
}
