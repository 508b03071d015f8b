//! Actor Runtime Error Types
//!
//! Every failure is attributed to the narrowest scope that produced it: one
//! message, one actor, or one journal. Only load failures and shutdown reach
//! beyond a single message.

use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum ActorError {
    /// Async load/init failed; every parked message fails with this cause
    #[error("Load failed for {address}: {message}")]
    Load { address: String, message: String },

    /// A method raised an error while executing one message
    #[error("Dispatch error: {address}::{method}: {message}")]
    Dispatch {
        address: String,
        method: String,
        message: String,
    },

    /// No method with this name in the actor's dispatch table
    #[error("Method '{method}' not found on {address}")]
    MethodNotFound { address: String, method: String },

    /// Wrong argument count or call shape for a method
    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    /// Actor is deleted; messages are never queued
    #[error("Actor {address} is deleted")]
    Deleted { address: String },

    /// Mailbox is shut down
    #[error("Mailbox {address} is closed")]
    Closed { address: String },

    /// Mailbox at capacity and the overflow policy refused the message
    #[error("Queue full: {address} (capacity {capacity})")]
    QueueFull { address: String, capacity: usize },

    /// Journal append, flush or replay failure
    #[error("Journal error: {message}")]
    Journal {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Synthesized by the query registry when a deadline expires
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Stream cancelled by the caller
    #[error("Call {id} cancelled")]
    Cancelled { id: u64 },

    /// No actor bound at this address
    #[error("No actor bound at {address}")]
    NotFound { address: String },

    /// Address already bound in this registry
    #[error("Address {address} is already bound")]
    AlreadyBound { address: String },

    /// Operation not allowed in the current lifecycle state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, ActorError>;

impl ActorError {
    /// Create a load error
    pub fn load(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a dispatch error
    pub fn dispatch(
        address: impl Into<String>,
        method: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Dispatch {
            address: address.into(),
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn method_not_found(address: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            address: address.into(),
            method: method.into(),
        }
    }

    pub fn invalid_arguments(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            method: method.into(),
            message: message.into(),
        }
    }

    pub fn deleted(address: impl Into<String>) -> Self {
        Self::Deleted {
            address: address.into(),
        }
    }

    pub fn closed(address: impl Into<String>) -> Self {
        Self::Closed {
            address: address.into(),
        }
    }

    pub fn queue_full(address: impl Into<String>, capacity: usize) -> Self {
        Self::QueueFull {
            address: address.into(),
            capacity,
        }
    }

    /// Create a journal error
    pub fn journal(message: impl Into<String>) -> Self {
        Self::Journal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a journal error with source
    pub fn journal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Journal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(id: u64) -> Self {
        Self::Cancelled { id }
    }

    pub fn not_found(address: impl Into<String>) -> Self {
        Self::NotFound {
            address: address.into(),
        }
    }

    pub fn already_bound(address: impl Into<String>) -> Self {
        Self::AlreadyBound {
            address: address.into(),
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// True for the synthesized query deadline failure
    pub fn is_timeout(&self) -> bool {
        matches!(self, ActorError::Timeout { .. })
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        match self {
            ActorError::QueueFull { .. } => true,
            ActorError::Timeout { .. } => true,
            ActorError::Journal { .. } => true,
            ActorError::Io { .. } => true,
            ActorError::Load { .. } => false,
            ActorError::Dispatch { .. } => false,
            ActorError::MethodNotFound { .. } => false,
            ActorError::InvalidArguments { .. } => false,
            ActorError::Deleted { .. } => false,
            ActorError::Closed { .. } => false,
            ActorError::Cancelled { .. } => false,
            ActorError::NotFound { .. } => false,
            ActorError::AlreadyBound { .. } => false,
            ActorError::IllegalState { .. } => false,
            ActorError::Configuration { .. } => false,
        }
    }

    /// Get error category for log fields and metrics
    pub fn category(&self) -> &'static str {
        match self {
            ActorError::Load { .. } => "load",
            ActorError::Dispatch { .. } => "dispatch",
            ActorError::MethodNotFound { .. } => "method_not_found",
            ActorError::InvalidArguments { .. } => "invalid_arguments",
            ActorError::Deleted { .. } => "deleted",
            ActorError::Closed { .. } => "closed",
            ActorError::QueueFull { .. } => "queue_full",
            ActorError::Journal { .. } => "journal",
            ActorError::Timeout { .. } => "timeout",
            ActorError::Cancelled { .. } => "cancelled",
            ActorError::NotFound { .. } => "not_found",
            ActorError::AlreadyBound { .. } => "already_bound",
            ActorError::IllegalState { .. } => "illegal_state",
            ActorError::Configuration { .. } => "configuration",
            ActorError::Io { .. } => "io",
        }
    }
}

// Boxed sources are not Clone; clones keep the message and drop the source.
impl Clone for ActorError {
    fn clone(&self) -> Self {
        match self {
            ActorError::Load { address, message } => ActorError::Load {
                address: address.clone(),
                message: message.clone(),
            },
            ActorError::Dispatch {
                address,
                method,
                message,
            } => ActorError::Dispatch {
                address: address.clone(),
                method: method.clone(),
                message: message.clone(),
            },
            ActorError::MethodNotFound { address, method } => ActorError::MethodNotFound {
                address: address.clone(),
                method: method.clone(),
            },
            ActorError::InvalidArguments { method, message } => ActorError::InvalidArguments {
                method: method.clone(),
                message: message.clone(),
            },
            ActorError::Deleted { address } => ActorError::Deleted {
                address: address.clone(),
            },
            ActorError::Closed { address } => ActorError::Closed {
                address: address.clone(),
            },
            ActorError::QueueFull { address, capacity } => ActorError::QueueFull {
                address: address.clone(),
                capacity: *capacity,
            },
            ActorError::Journal { message, .. } => ActorError::Journal {
                message: message.clone(),
                source: None,
            },
            ActorError::Timeout {
                operation,
                timeout_ms,
            } => ActorError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            ActorError::Cancelled { id } => ActorError::Cancelled { id: *id },
            ActorError::NotFound { address } => ActorError::NotFound {
                address: address.clone(),
            },
            ActorError::AlreadyBound { address } => ActorError::AlreadyBound {
                address: address.clone(),
            },
            ActorError::IllegalState { message } => ActorError::IllegalState {
                message: message.clone(),
            },
            ActorError::Configuration { message, field } => ActorError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            ActorError::Io { message, source } => ActorError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
        }
    }
}

impl From<serde_json::Error> for ActorError {
    fn from(err: serde_json::Error) -> Self {
        ActorError::journal_with_source("record encoding failed", err)
    }
}
