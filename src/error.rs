//! Error types for the NSX operator
//!
//! Backend errors carry their retry classification from the point where the
//! transport produced them. The controller never inspects error text to decide
//! whether to retry; it asks [`Error::retry_policy`].

use thiserror::Error;

use crate::retry::RetryPolicy;

/// Retry classification for Kubernetes API failures.
///
/// No backoff interval is configured, so these fall through to the work
/// queue's default rate-limited requeue.
pub const KUBE_RETRY: RetryPolicy = RetryPolicy::unbounded_default();

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Backend API call failed
    #[error("backend error [{operation}]: {message}")]
    Backend {
        /// Operation that failed (e.g. "patch /infra/domains/default/groups/g1")
        operation: String,
        /// Description of what failed
        message: String,
        /// HTTP status, if the backend answered
        status: Option<u16>,
        /// Retry classification attached by the transport
        retry: Option<RetryPolicy>,
    },

    /// Backend license does not permit the requested feature
    #[error("license restriction: {reason}")]
    LicenseRestricted {
        /// Reason reported by the backend
        reason: String,
    },

    /// Backend license is invalid or expired
    #[error("invalid backend license: {message}")]
    InvalidLicense {
        /// Message reported by the backend
        message: String,
    },

    /// Resource lives in a protected namespace
    #[error("namespace {namespace} is a protected system namespace; security policies are not allowed there")]
    ProtectedNamespace {
        /// Namespace of the rejected resource
        namespace: String,
    },

    /// Spec cannot be translated into backend objects
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource key (namespace/name) or "unknown"
        resource: String,
        /// Description of what is invalid
        message: String,
    },

    /// Backend object path could not be parsed
    #[error("invalid backend path {path:?}: {message}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Why it could not be parsed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Several independent operations failed
    #[error("{} error(s): {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    /// A named kind failed during a multi-kind pass
    #[error("{kind}: {source}")]
    Kind {
        /// Resource kind name
        kind: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a backend error with an explicit retry classification
    pub fn backend(
        operation: impl Into<String>,
        msg: impl Into<String>,
        retry: Option<RetryPolicy>,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: msg.into(),
            status: None,
            retry,
        }
    }

    /// Create a backend error for an HTTP response
    pub fn backend_status(
        operation: impl Into<String>,
        status: u16,
        msg: impl Into<String>,
        retry: Option<RetryPolicy>,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: msg.into(),
            status: Some(status),
            retry,
        }
    }

    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: "unknown".to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a protected-namespace error
    pub fn protected_namespace(namespace: impl Into<String>) -> Self {
        Self::ProtectedNamespace {
            namespace: namespace.into(),
        }
    }

    /// Create a path parse error
    pub fn invalid_path(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wrap an error with the name of the kind it came from
    pub fn for_kind(kind: impl Into<String>, source: Error) -> Self {
        Self::Kind {
            kind: kind.into(),
            source: Box::new(source),
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the aggregate otherwise
    pub fn aggregate(errors: Vec<Error>) -> Result<(), Error> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate(errors))
        }
    }

    /// Retry classification carried by this error, if any
    ///
    /// `None` means the error must not be retried.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 => None,
                _ => Some(&KUBE_RETRY),
            },
            Error::Backend { retry, .. } => retry.as_ref(),
            Error::Kind { source, .. } => source.retry_policy(),
            Error::LicenseRestricted { .. }
            | Error::InvalidLicense { .. }
            | Error::ProtectedNamespace { .. }
            | Error::Validation { .. }
            | Error::InvalidPath { .. }
            | Error::Serialization(_)
            | Error::Aggregate(_) => None,
        }
    }

    /// Whether the operator process must stop after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::InvalidLicense { .. } => true,
            Error::Kind { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Whether this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Backend { status, .. } => *status == Some(404),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    /// Story: errors built by the transport keep their retry classification
    #[test]
    fn story_backend_errors_carry_their_classification() {
        let policy = RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(8), 3);
        let err = Error::backend_status("patch /infra/x", 409, "conflict", Some(policy.clone()));
        assert_eq!(err.retry_policy(), Some(&policy));
        assert!(err.to_string().contains("patch /infra/x"));

        let err = Error::backend_status("patch /infra/x", 400, "bad request", None);
        assert!(err.retry_policy().is_none());
    }

    /// Story: user-facing policy violations are never retried
    #[test]
    fn story_policy_violations_are_not_retryable() {
        assert!(Error::protected_namespace("kube-system")
            .retry_policy()
            .is_none());
        assert!(Error::validation("bad selector").retry_policy().is_none());
        assert!(Error::LicenseRestricted {
            reason: "DFW not licensed".into()
        }
        .retry_policy()
        .is_none());
    }

    #[test]
    fn test_kube_client_errors_are_not_retryable_but_server_errors_are() {
        assert!(api_error(422).retry_policy().is_none());
        assert!(api_error(409).retry_policy().is_some());
        assert!(api_error(500).retry_policy().is_some());
        assert!(api_error(404).is_not_found());
    }

    #[test]
    fn test_only_invalid_license_is_fatal() {
        assert!(Error::InvalidLicense {
            message: "expired".into()
        }
        .is_fatal());
        assert!(Error::for_kind(
            "SecurityPolicy",
            Error::InvalidLicense {
                message: "expired".into()
            }
        )
        .is_fatal());
        assert!(!Error::validation("x").is_fatal());
    }

    /// Story: aggregate errors name every failure so operators can act on them
    #[test]
    fn story_aggregate_lists_every_failure() {
        assert!(Error::aggregate(vec![]).is_ok());

        let err = Error::aggregate(vec![
            Error::validation("first"),
            Error::invalid_path("/bad", "missing id"),
        ])
        .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("2 error(s)"));
        assert!(text.contains("first"));
        assert!(text.contains("/bad"));
    }

    #[test]
    fn test_kind_wrapper_names_the_kind() {
        let err = Error::for_kind("SecurityPolicy", Error::validation("oops"));
        assert!(err.to_string().starts_with("SecurityPolicy: "));
    }
}
