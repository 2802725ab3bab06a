//! Error types for strata
//!
//! Errors are structured with fields to aid debugging of a failed install.
//! Each variant carries enough context (platform, resource, operation) for an
//! operator to map the failure back to the offending cloud resource without
//! re-running the install.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provisioning operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from the local reconciler
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Install configuration is invalid or unsupported for this flow
    #[error("invalid install config: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "platform.gcp.projectID")
        field: Option<String>,
    },

    /// Platform provider hook failure
    #[error("provider error [{platform}]: {message}")]
    Provider {
        /// Platform the hook belongs to (aws, azure, gcp, openstack)
        platform: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Cloud API call failed
    #[error("failed to {operation} {resource}: {message}")]
    Cloud {
        /// Action that was attempted (e.g., "create", "get")
        operation: String,
        /// Resource the action targeted (e.g., "storage account foo")
        resource: String,
        /// Underlying SDK error text
        message: String,
        /// HTTP-style status code reported by the cloud API, if any
        code: Option<u16>,
    },

    /// An object that was expected to exist does not (yet)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of object looked up
        kind: String,
        /// Name (or namespace/name) of the object
        name: String,
    },

    /// An object that was created already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind of object created
        kind: String,
        /// Name (or namespace/name) of the object
        name: String,
    },

    /// A bounded wait ran out of steps
    #[error("timed out waiting for {operation} after {attempts} attempts")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Number of polls performed
        attempts: u32,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Ignition document could not be read or rewritten
    #[error("ignition error [{path}]: {message}")]
    Ignition {
        /// Ignition file path (or "config" for document-level failures)
        path: String,
        /// Description of what failed
        message: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped error with an action-describing prefix
    #[error("{context}: {source}")]
    Context {
        /// Action that failed (e.g., "failed to create DNS records")
        context: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "orchestrator", "upload")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error for a platform
    pub fn provider_for(platform: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            platform: platform.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., missing required address)
    pub fn provider_permanent(platform: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            platform: platform.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a cloud API error
    pub fn cloud(
        operation: impl Into<String>,
        resource: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            resource: resource.into(),
            message: msg.into(),
            code: None,
        }
    }

    /// Create a cloud API error carrying the status code the API returned
    pub fn cloud_with_code(
        operation: impl Into<String>,
        resource: impl Into<String>,
        code: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self::Cloud {
            operation: operation.into(),
            resource: resource.into(),
            message: msg.into(),
            code: Some(code),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an ignition error for a file path
    pub fn ignition(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ignition {
            path: path.into(),
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

    /// Wrap this error with an action-describing prefix
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error in a chain of [`Error::Context`] wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error means "the object does not exist (yet)"
    ///
    /// Covers our own `NotFound`, kube 404s and cloud 404s, looking through
    /// context wrappers.
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Cloud { code: Some(404), .. } => true,
            _ => false,
        }
    }

    /// Check if this error means "the object already exists"
    pub fn is_already_exists(&self) -> bool {
        match self.root() {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::Cloud { code: Some(409), .. } => true,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors are not retryable (require config fix).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Cloud { code, .. } => !matches!(code, Some(c) if (400..500).contains(c)),
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => false,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Ignition { .. } => false,
            Error::Io(_) => true,
            Error::Context { source, .. } => source.is_retryable(),
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

/// Extension trait to prefix errors with the action that failed.
///
/// Reduces boilerplate for `.map_err(|e| e.context("failed to create X"))`.
pub trait ResultExt<T> {
    /// Wrap the error with a fixed context string
    fn context(self, context: impl Into<String>) -> crate::Result<T>;

    /// Wrap the error with a lazily built context string
    fn with_context<F, S>(self, f: F) -> crate::Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> crate::Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(context))
    }

    fn with_context<F, S>(self, f: F) -> crate::Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Into::<Error>::into(e).context(f()))
    }
}
