//! Shared data structures and utilities for the webhook dispatch service
//!
//! This crate contains the domain model, configuration structures, the cron
//! engine, and utilities used by the dispatcher service.

pub mod config;
pub mod cron;
pub mod defaults;
pub mod model;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::ServiceConfig;
pub use model::{Endpoint, Execution, ExecutionStatus, Monitor, MonitorStatus, Task, Tenant};
pub use utils::{current_timestamp_millis, sign_payload, slugify};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Business errors returned by the command surface.
///
/// These are the caller-visible error kinds; infrastructure failures
/// (database, network) are wrapped so callers can distinguish "your request
/// is wrong" from "the service hiccuped".
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Queue '{0}' is paused")]
    QueuePaused(String),

    #[error("Batch too large: {size} items (maximum {max})")]
    BatchTooLarge { size: usize, max: usize },

    #[error("All tasks recorded on this event have been deleted")]
    TaskDeleted,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl DispatchError {
    /// Shorthand for a field-level validation error.
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        DispatchError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests;
