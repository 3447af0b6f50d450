//! Error types for the compensation webhook

use thiserror::Error;

/// Main error type for admission decisions
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The admission payload could not be decoded into a pod
    #[error("decode error: {0}")]
    Decode(String),

    /// An object in the owner chain has no controller owner reference
    #[error("{kind} {name} has no controller owner reference")]
    MissingControllerOwner { kind: String, name: String },

    /// An object in the owner chain does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The lock could not be acquired before the deadline
    #[error("timed out acquiring lock {scope} after {attempts} attempts")]
    LockCancelled { scope: String, attempts: u32 },

    /// The caller went away while the lock was being acquired
    #[error("admission request abandoned while waiting for lock {scope}")]
    RequestAbandoned { scope: String },

    /// Serialization/deserialization error after the request was decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid startup configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error, e.g. the server failed while running
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a decode error with the given message
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP-style status code reported back in the admission response.
    ///
    /// Only malformed requests are the client's fault; every infrastructure
    /// failure fails closed with a server error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Decode(_) => 400,
            _ => 500,
        }
    }
}

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
