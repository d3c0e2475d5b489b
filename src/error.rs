//! Error types for route53-registrator.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// How the caller should react to a failed registry call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Authentication, authorization or malformed requests. Retrying won't help.
    Fatal,
    /// Throttling, timeouts, 5xx and transport failures.
    Retryable,
    /// The target resource does not exist.
    NotFound,
    /// The resource exists but is in a state that forbids the operation
    /// (e.g. a health check still referenced by a record set).
    Conflict,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Fatal => "fatal",
            ErrorClass::Retryable => "retryable",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Error returned by a [`DnsRegistry`](crate::registry::DnsRegistry) call.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered with a structured service error.
    #[error("{operation} failed ({class}): {code}: {message}")]
    Service {
        /// Registry operation name, e.g. `ChangeResourceRecordSets`.
        operation: &'static str,
        /// Service error code.
        code: String,
        /// Human readable message from the service.
        message: String,
        /// Classification of the code.
        class: ErrorClass,
    },

    /// The request never produced a service response.
    #[error("{operation} transport error: {message}")]
    Transport {
        /// Registry operation name.
        operation: &'static str,
        /// Transport failure description.
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Registry operation name.
        operation: &'static str,
        /// Deadline that was exceeded.
        elapsed: Duration,
    },

    /// The request could not be built from the supplied values.
    #[error("invalid {operation} request: {message}")]
    InvalidRequest {
        /// Registry operation name.
        operation: &'static str,
        /// What was wrong with the input.
        message: String,
    },
}

impl RegistryError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RegistryError::Service { class, .. } => *class,
            RegistryError::Transport { .. } | RegistryError::Timeout { .. } => {
                ErrorClass::Retryable
            }
            RegistryError::InvalidRequest { .. } => ErrorClass::Fatal,
        }
    }

    /// Build a service error, classifying it from its code.
    pub fn service(
        operation: &'static str,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let message = message.into();
        let class = classify_code(&code, &message);
        RegistryError::Service {
            operation,
            code,
            message,
            class,
        }
    }

    /// Registry operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            RegistryError::Service { operation, .. }
            | RegistryError::Transport { operation, .. }
            | RegistryError::Timeout { operation, .. }
            | RegistryError::InvalidRequest { operation, .. } => operation,
        }
    }

    /// True when retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// True when the target resource is already gone.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

/// Map a registry error code (and message, for codes Route53 overloads) to a class.
pub fn classify_code(code: &str, message: &str) -> ErrorClass {
    match code {
        "Throttling"
        | "ThrottlingException"
        | "RequestLimitExceeded"
        | "PriorRequestNotComplete"
        | "ServiceUnavailable"
        | "InternalFailure"
        | "InternalError"
        | "RequestTimeout" => ErrorClass::Retryable,
        "NoSuchHealthCheck" | "NoSuchHostedZone" => ErrorClass::NotFound,
        // Route53 rejects a DELETE of a vanished record as an invalid batch.
        "InvalidChangeBatch" if message.contains("not found") => ErrorClass::NotFound,
        "InvalidChangeBatch" if message.contains("already exists") => ErrorClass::Conflict,
        "HealthCheckInUse" | "HealthCheckAlreadyExists" | "ConcurrentModification" => {
            ErrorClass::Conflict
        }
        _ => ErrorClass::Fatal,
    }
}

/// Top-level errors for the registrator.
#[derive(Debug, Error)]
pub enum RegistratorError {
    /// IO error (socket bind, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry call failed.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Container runtime error.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// Host metadata lookup failed.
    #[error("Host identity error: {0}")]
    HostIdentity(#[from] reqwest::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RegistratorError {
    /// True when the process should stop instead of moving on to the next event.
    pub fn is_fatal(&self) -> bool {
        match self {
            RegistratorError::Registry(e) => e.class() == ErrorClass::Fatal,
            RegistratorError::Config(_) => true,
            _ => false,
        }
    }
}
