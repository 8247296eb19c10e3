//! Error types for the e2e harness
//!
//! Errors are split along the line the wait engine cares about: "not found"
//! is an ordinary state while a controller converges, everything coming from
//! the transport, auth or decode layers is fatal to the current wait.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// The addressed object does not exist (yet)
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Namespace, empty for cluster-scoped kinds
        namespace: String,
        /// Object name
        name: String,
    },

    /// Create collided with an existing object
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Namespace, empty for cluster-scoped kinds
        namespace: String,
        /// Object name
        name: String,
    },

    /// The API server rejected our credentials
    #[error("unauthorized: {message}")]
    Auth {
        /// Message returned by the API server
        message: String,
    },

    /// Any other failure talking to the cluster API, reported unmodified
    #[error(transparent)]
    Transport(kube::Error),

    /// The kind was never registered in the scheme
    #[error("kind {kind} is not registered in the scheme")]
    UnknownKind {
        /// group/version/kind of the unregistered type
        kind: String,
    },

    /// A fetched or supplied object could not be decoded
    #[error("failed to decode {kind}: {message}")]
    Decode {
        /// Kind being decoded
        kind: String,
        /// Underlying decode failure
        message: String,
    },

    /// A wait ran out of time before its predicate held
    #[error(
        "timed out after {timeout:?} waiting for {target} to satisfy {expected}; last observed: {last_observed}"
    )]
    Timeout {
        /// Object or selector being waited on
        target: String,
        /// Description of the predicate
        expected: String,
        /// The timeout that elapsed
        timeout: Duration,
        /// Last observed object state, or `<absent>`
        last_observed: String,
    },

    /// Content or state did not match after a successful wait
    #[error("assertion failed [{context}]: expected {expected:?}, got {actual:?}")]
    Assertion {
        /// What was being checked
        context: String,
        /// Expected value
        expected: String,
        /// Actual value
        actual: String,
    },

    /// Misuse of a lifecycle handle (double stop, dead tunnel)
    #[error("lifecycle error [{context}]: {message}")]
    Lifecycle {
        /// Handle or phase involved
        context: String,
        /// Description of what failed
        message: String,
    },

    /// An HTTP API (git server, OCI registry) returned an unexpected response
    #[error("http error [{context}]{}: {message}", status.map(|s| format!(" status {}", s)).unwrap_or_default())]
    Http {
        /// Operation being performed
        context: String,
        /// Response status, if a response was received
        status: Option<u16>,
        /// Response body or transport message
        message: String,
    },

    /// External command (kind) failed
    #[error("command failed: {message}")]
    CommandFailed {
        /// Description of what failed
        message: String,
    },

    /// File name pattern that does not parse as a glob
    #[error("invalid file pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The rejected pattern
        pattern: String,
        /// Why it was rejected
        message: String,
    },

    /// Local I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object reference
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an assertion failure with expected vs. actual values
    pub fn assertion(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Assertion {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Lifecycle {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an HTTP error for a received response
    pub fn http(context: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            status: Some(status),
            message: body.into(),
        }
    }

    /// Create an HTTP error for a request that never got a response
    pub fn http_transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            context: context.into(),
            status: None,
            message: msg.into(),
        }
    }

    /// Create a command failure
    pub fn command_failed(msg: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: msg.into(),
        }
    }

    /// Create an invalid pattern error from a glob parse failure
    pub fn invalid_pattern(pattern: impl Into<String>, err: glob::PatternError) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: err.to_string(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a decode error for a kind
    pub fn decode(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error for a specific object.
    ///
    /// 404 and 409 become the application-level `NotFound`/`AlreadyExists`,
    /// 401/403 become `Auth`, everything else stays a transport error.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Self::not_found(kind, namespace, name),
            kube::Error::Api(ref resp) if resp.code == 409 => Self::AlreadyExists {
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ref resp) if resp.code == 401 || resp.code == 403 => Self::Auth {
                message: resp.message.clone(),
            },
            other => Self::Transport(other),
        }
    }

    /// True for the application-level "object does not exist" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for errors that must abort a wait immediately.
    ///
    /// Everything except `NotFound` is fatal: transport, auth, decode and
    /// registration failures mean the environment or the test is broken.
    pub fn is_fatal(&self) -> bool {
        !self.is_not_found()
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::from_kube(err, UNKNOWN_CONTEXT, "", UNKNOWN_CONTEXT)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}
