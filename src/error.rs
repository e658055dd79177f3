//! Crate-wide error type for the discovery/dispatch subsystem.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored failures inside `AllEndpointsFailed` to avoid unbounded growth.
pub const MAX_DISPATCH_FAILURES: usize = 10;

/// Unified error type returned by the registry client, resolver, poller, and dispatcher.
#[derive(Debug)]
pub enum ClientError {
    /// A required configuration field was missing or out of range.
    ConfigInvalid(String),
    /// The registry could not be reached over the network.
    RegistryUnavailable(String),
    /// The registry responded with a non-zero application code.
    RegistryError { code: i64, message: String },
    /// The registry's response body could not be parsed.
    ProtocolError(String),
    /// The resolver currently has no addresses for this service.
    NoEndpoints { service: String },
    /// Every endpoint failed within this call's attempt budget.
    AllEndpointsFailed { service: String, failures: Vec<ClientError> },
    /// An endpoint returned an HTTP status >= 400.
    HttpError { status: u16, body: String },
    /// The caller's context/deadline was cancelled or exceeded.
    DeadlineExceeded,
    /// The caller's context was cancelled.
    Cancelled,
    /// An internal panic was recovered; the call did not complete.
    InternalPanic(String),
}

impl Clone for ClientError {
    fn clone(&self) -> Self {
        match self {
            Self::ConfigInvalid(s) => Self::ConfigInvalid(s.clone()),
            Self::RegistryUnavailable(s) => Self::RegistryUnavailable(s.clone()),
            Self::RegistryError { code, message } => {
                Self::RegistryError { code: *code, message: message.clone() }
            }
            Self::ProtocolError(s) => Self::ProtocolError(s.clone()),
            Self::NoEndpoints { service } => Self::NoEndpoints { service: service.clone() },
            Self::AllEndpointsFailed { service, failures } => {
                Self::AllEndpointsFailed { service: service.clone(), failures: failures.clone() }
            }
            Self::HttpError { status, body } => Self::HttpError { status: *status, body: body.clone() },
            Self::DeadlineExceeded => Self::DeadlineExceeded,
            Self::Cancelled => Self::Cancelled,
            Self::InternalPanic(s) => Self::InternalPanic(s.clone()),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(msg) => write!(f, "invalid configuration: {}", msg),
            Self::RegistryUnavailable(msg) => write!(f, "registry unavailable: {}", msg),
            Self::RegistryError { code, message } => {
                write!(f, "registry returned error code={} message={}", code, message)
            }
            Self::ProtocolError(msg) => write!(f, "malformed registry response: {}", msg),
            Self::NoEndpoints { service } => write!(f, "no endpoints available for {}", service),
            Self::AllEndpointsFailed { service, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "all endpoints failed for {} ({} failures), last error: {}",
                    service,
                    failures.len(),
                    last
                )
            }
            Self::HttpError { status, body } => write!(f, "HTTP error {}: {}", status, body),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::InternalPanic(msg) => write!(f, "recovered internal panic: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AllEndpointsFailed { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl ClientError {
    /// Whether this error is retryable within a single dispatcher call (§7).
    ///
    /// Retryable: request timeout, connection-pool exhaustion, and any non-HTTP
    /// transport error that is not itself a 4xx `HttpError`. Non-retryable: any
    /// `HttpError` whose status starts with `4`, deadline/cancellation errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpError { status, .. } => !(400..500).contains(status),
            Self::DeadlineExceeded | Self::Cancelled => false,
            Self::RegistryError { .. } | Self::ProtocolError(_) | Self::ConfigInvalid(_) => false,
            Self::RegistryUnavailable(_) | Self::InternalPanic(_) => true,
            Self::NoEndpoints { .. } | Self::AllEndpointsFailed { .. } => false,
        }
    }

    pub fn is_no_endpoints(&self) -> bool {
        matches!(self, Self::NoEndpoints { .. })
    }

    pub fn is_all_endpoints_failed(&self) -> bool {
        matches!(self, Self::AllEndpointsFailed { .. })
    }

    pub fn is_http_error(&self) -> bool {
        matches!(self, Self::HttpError { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    pub(crate) fn record_failure(failures: &mut Vec<ClientError>, err: ClientError) {
        failures.push(err);
        if failures.len() > MAX_DISPATCH_FAILURES {
            let excess = failures.len() - MAX_DISPATCH_FAILURES;
            failures.drain(0..excess);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryConfigError {
    #[error("registry ipAddr is empty")]
    EmptyIpAddr,
    #[error("registry port is invalid: {0}")]
    InvalidPort(u32),
    #[error("service name is empty")]
    EmptyServiceName,
}

#[derive(Debug)]
pub struct TimeoutExceeded {
    pub elapsed: Duration,
    pub timeout: Duration,
}

impl fmt::Display for TimeoutExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation timed out after {:?} (limit: {:?})", self.elapsed, self.timeout)
    }
}

impl std::error::Error for TimeoutExceeded {}
