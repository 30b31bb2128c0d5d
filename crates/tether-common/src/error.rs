//! Error types for tether
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context needed to tell which step of the management
//! channel failed (bootstrap, reconciliation, transport).

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for tether operations
#[derive(Debug, Error)]
pub enum Error {
    /// Persistent store error
    #[error("store error: {source}")]
    Store {
        /// The underlying store error
        #[from]
        source: StoreError,
    },

    /// Control service or local HTTP endpoint error
    #[error("http error [{context}]: {message}")]
    Http {
        /// Which call failed (e.g., "register", "confirm", "stats")
        context: String,
        /// Description of what failed
        message: String,
        /// HTTP status, when a response was received
        status: Option<u16>,
    },

    /// Credential issuance or loading error
    #[error("credentials error: {message}")]
    Credentials {
        /// Description of what failed
        message: String,
    },

    /// Key generation, encoding or decryption error
    #[error("crypto error: {message}")]
    Crypto {
        /// Description of what failed
        message: String,
    },

    /// Overlay could not be applied
    #[error("overlay error{}: {message}", version_suffix(.version))]
    Overlay {
        /// Description of what failed
        message: String,
        /// Version of the rejected overlay, when known
        version: Option<u64>,
    },

    /// A location entry of an overlay is invalid
    #[error("location error for {location}: {message}")]
    Location {
        /// Name of the offending location
        location: String,
        /// Description of what is wrong
        message: String,
    },

    /// Push session or local tunnel error
    #[error("transport error: {message}")]
    Transport {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is wrong
        message: String,
    },
}

fn version_suffix(version: &Option<u64>) -> String {
    match version {
        Some(v) => format!(" (version {})", v),
        None => String::new(),
    }
}

impl Error {
    /// Create an HTTP error for a failed call without a response
    pub fn http(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create an HTTP error for an unexpected response status
    pub fn http_status(context: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a credentials error with the given message
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials {
            message: msg.into(),
        }
    }

    /// Create a crypto error with the given message
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto {
            message: msg.into(),
        }
    }

    /// Create an overlay error for the given version
    pub fn overlay(version: Option<u64>, msg: impl Into<String>) -> Self {
        Self::Overlay {
            message: msg.into(),
            version,
        }
    }

    /// Create a location error with location context
    pub fn location(location: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Location {
            location: location.into(),
            message: msg.into(),
        }
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error means the store has no value for the requested key
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Store {
                source: StoreError::NotFound { .. }
            }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
