//! Error handling for pipfil
//!
//! `PipelineError` (in [`crate::pipeline::error`]) covers graph wiring and usage.
//! This module wraps it together with configuration and I/O failures for callers
//! that deal with both.

use crate::pipeline::error::PipelineError;
use thiserror::Error;

/// Main error type for pipfil operations
#[derive(Error, Debug)]
pub enum PipfilError {
    /// Errors from building, auditing or driving a pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Errors related to configuration values or persistence
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PipfilError>,
    },
}

impl PipfilError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PipfilError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers
    pub fn root(&self) -> &PipfilError {
        match self {
            PipfilError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for pipfil operations
pub type Result<T> = std::result::Result<T, PipfilError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, PipelineError> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| PipfilError::from(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| PipfilError::from(e).with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipfilError::Config("parallel must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: parallel must be at least 1"
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = PipfilError::Config("test".to_string());
        let with_ctx = err.with_context("Failed to load");
        assert!(with_ctx.to_string().contains("Failed to load"));
        assert!(matches!(with_ctx.root(), PipfilError::Config(_)));
    }

    #[test]
    fn test_pipeline_error_context() {
        let result: std::result::Result<(), PipelineError> = Err(PipelineError::AlreadyRunning);
        let err = result.context("starting model").unwrap_err();
        assert_eq!(err.to_string(), "starting model: Pipeline error: model is already running");
        assert!(matches!(
            err.root(),
            PipfilError::Pipeline(PipelineError::AlreadyRunning)
        ));
    }
}
