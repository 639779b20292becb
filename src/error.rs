//! Error types and result handling for message-relay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into two families. Domain errors ([`Error::Validation`],
//! [`Error::AlreadyExists`], [`Error::NotCreated`], [`Error::NotFound`]) carry
//! a meaning the HTTP boundary turns into a status code. Everything else is
//! infrastructure and is logged, wrapped with context, or both.
//!
//! # Example
//!
//! ```rust
//! use message_relay::{Error, Result};
//!
//! fn lookup(id: i32) -> Result<()> {
//!     Err(Error::NotFound { id })
//! }
//!
//! match lookup(7) {
//!     Ok(()) => println!("found"),
//!     Err(e) if e.is_not_found() => eprintln!("missing: {}", e),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// The main error type for message-relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input from a caller.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store rejected a create because the record already exists.
    #[error("already exists")]
    AlreadyExists,

    /// The store accepted the insert but returned no identifier.
    #[error("not created")]
    NotCreated,

    /// No message with the given id.
    #[error("message with id {id}: not found")]
    NotFound {
        /// Identifier that was looked up
        id: i32,
    },

    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// A connection could not be taken from the pool.
    #[error("PostgreSQL pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An envelope whose eager encoding failed.
    #[error("Encode error: {0}")]
    Encode(String),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A background task could not be joined.
    #[error("Task error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// I/O error, typically from binding the HTTP listener.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An infrastructure error annotated with the operation that failed.
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted
        context: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Close was called on a component that is already closed or was
    /// never opened.
    #[error("{component}: already closed")]
    Closed {
        /// Name of the component
        component: &'static str,
    },

    /// Teardown did not finish before the shutdown deadline.
    #[error("shutdown cancelled: deadline of {timeout:?} exceeded")]
    ShutdownTimeout {
        /// The deadline that was exceeded
        timeout: Duration,
    },

    /// A teardown action panicked instead of returning.
    #[error("teardown action {name} panicked")]
    TeardownPanicked {
        /// Name the action was registered under
        name: String,
    },

    /// One or more teardown actions failed.
    #[error("shutdown finished with errors: {}", join_messages(.errors))]
    Shutdown {
        /// Every error reported by a teardown action
        errors: Vec<Error>,
    },
}

impl Error {
    /// Wraps an infrastructure error with context. Domain errors are
    /// returned unchanged so callers can still match on their kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        if self.is_domain() {
            return self;
        }
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns `true` for errors that describe the request rather than
    /// the infrastructure.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::AlreadyExists | Error::NotCreated | Error::NotFound { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::ShutdownTimeout { .. })
    }

    /// Follows [`Error::Context`] wrappers down to the original error.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A convenient Result type alias for message-relay operations.
///
/// This is equivalent to `std::result::Result<T, message_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
