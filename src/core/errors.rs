// src/core/errors.rs

//! Defines the primary error type for the entire daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// A spooler RPC did not complete within its configured deadline. The
    /// reconciler translates this into a retry with backoff.
    #[error("Spooler RPC timed out")]
    SpoolerTimeout,

    /// The spooler answered the request with a non-success status code.
    #[error("Spooler status 0x{code:04x}: {message}")]
    SpoolerStatus { code: u16, message: String },

    #[error("HTTP transport error: {0}")]
    HttpTransport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Incomplete data in stream")]
    IncompleteData,

    /// Fetching the capability document from a remote endpoint failed. The
    /// entry is marked disappeared and retried on the next appearance.
    #[error("Capability fetch from '{0}' failed: {1}")]
    CapabilityFetch(String, String),

    /// The external descriptor generator could not produce a driver
    /// descriptor for the merged capability set.
    #[error("Descriptor generation for '{0}' failed: {1}")]
    DescriptorGeneration(String, String),

    /// No acceptable local queue name exists for a discovered printer.
    #[error("No usable local queue name for '{0}': {1}")]
    NameResolution(String, String),

    #[error("Invalid queue URI: {0}")]
    InvalidUri(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Persisted state error: {0}")]
    StateFile(String),

    #[error("Discovery source error: {0}")]
    Discovery(String),

    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether the spooler reported the addressed object as missing.
    /// Deleting an already-deleted queue counts as success for the caller.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BridgeError::SpoolerStatus { code, .. } if *code == 0x0406)
    }

    /// Whether the failure should be retried by the reconciler rather than
    /// treated as permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::SpoolerTimeout | BridgeError::HttpTransport(_) | BridgeError::Io(_)
        )
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for BridgeError {
    fn clone(&self) -> Self {
        match self {
            BridgeError::Io(e) => BridgeError::Io(Arc::clone(e)),
            BridgeError::SpoolerTimeout => BridgeError::SpoolerTimeout,
            BridgeError::SpoolerStatus { code, message } => BridgeError::SpoolerStatus {
                code: *code,
                message: message.clone(),
            },
            BridgeError::HttpTransport(s) => BridgeError::HttpTransport(s.clone()),
            BridgeError::Protocol(s) => BridgeError::Protocol(s.clone()),
            BridgeError::IncompleteData => BridgeError::IncompleteData,
            BridgeError::CapabilityFetch(a, b) => {
                BridgeError::CapabilityFetch(a.clone(), b.clone())
            }
            BridgeError::DescriptorGeneration(a, b) => {
                BridgeError::DescriptorGeneration(a.clone(), b.clone())
            }
            BridgeError::NameResolution(a, b) => BridgeError::NameResolution(a.clone(), b.clone()),
            BridgeError::InvalidUri(s) => BridgeError::InvalidUri(s.clone()),
            BridgeError::InvalidState(s) => BridgeError::InvalidState(s.clone()),
            BridgeError::StateFile(s) => BridgeError::StateFile(s.clone()),
            BridgeError::Discovery(s) => BridgeError::Discovery(s.clone()),
            BridgeError::ShuttingDown => BridgeError::ShuttingDown,
            BridgeError::Internal(s) => BridgeError::Internal(s.clone()),
        }
    }
}

impl PartialEq for BridgeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BridgeError::Io(e1), BridgeError::Io(e2)) => e1.to_string() == e2.to_string(),
            (
                BridgeError::SpoolerStatus {
                    code: c1,
                    message: m1,
                },
                BridgeError::SpoolerStatus {
                    code: c2,
                    message: m2,
                },
            ) => c1 == c2 && m1 == m2,
            (BridgeError::HttpTransport(s1), BridgeError::HttpTransport(s2)) => s1 == s2,
            (BridgeError::Protocol(s1), BridgeError::Protocol(s2)) => s1 == s2,
            (BridgeError::CapabilityFetch(a1, b1), BridgeError::CapabilityFetch(a2, b2)) => {
                a1 == a2 && b1 == b2
            }
            (
                BridgeError::DescriptorGeneration(a1, b1),
                BridgeError::DescriptorGeneration(a2, b2),
            ) => a1 == a2 && b1 == b2,
            (BridgeError::NameResolution(a1, b1), BridgeError::NameResolution(a2, b2)) => {
                a1 == a2 && b1 == b2
            }
            (BridgeError::InvalidUri(s1), BridgeError::InvalidUri(s2)) => s1 == s2,
            (BridgeError::InvalidState(s1), BridgeError::InvalidState(s2)) => s1 == s2,
            (BridgeError::StateFile(s1), BridgeError::StateFile(s2)) => s1 == s2,
            (BridgeError::Discovery(s1), BridgeError::Discovery(s2)) => s1 == s2,
            (BridgeError::Internal(s1), BridgeError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BridgeError::SpoolerTimeout
        } else {
            BridgeError::HttpTransport(e.to_string())
        }
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(e: url::ParseError) -> Self {
        BridgeError::InvalidUri(e.to_string())
    }
}

impl From<std::str::Utf8Error> for BridgeError {
    fn from(e: std::str::Utf8Error) -> Self {
        BridgeError::Protocol(format!("invalid UTF-8 in attribute: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for BridgeError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        BridgeError::Protocol(format!("invalid UTF-8 in attribute: {e}"))
    }
}
