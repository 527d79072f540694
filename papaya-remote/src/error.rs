use thiserror::Error;

use papaya_util::http::{ClientError, InvalidUriError, StatusCode};
use papaya_util::store::StoreError;

use super::provision::ProvisioningStep;

/// The remote could not be reached (DNS, connect, timeout).
///
/// Always worth retrying.
#[derive(Debug, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// Failure of a single management API call
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("remote returned error: ({0}) {1}")]
    Status(StatusCode, String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Classify a non-2xx reply
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
            StatusCode::NOT_FOUND => ApiError::NotFound,
            status => ApiError::Status(status, body),
        }
    }

    /// Transport failures and server side errors may go away on their own
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status(status, _) => status.is_server_error(),
            _ => false,
        }
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Request(msg) => ApiError::InvalidRequest(msg),
            ClientError::Response(status) => ApiError::from_status(status, String::new()),
            ClientError::Client(e) => ApiError::Transport(TransportError(e.to_string())),
            ClientError::Server(e) => ApiError::Decode(e.to_string()),
        }
    }
}

impl From<InvalidUriError> for ApiError {
    fn from(err: InvalidUriError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

/// The platform rejected the configured admin identity.
///
/// Retrying will not help until an operator fixes the credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials for '{0}'")]
    InvalidCredentials(String),
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to persist credentials: {0}")]
    Store(#[from] StoreError),
}

/// Why a provisioning step failed
#[derive(Debug, Error)]
pub enum FailureReason {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to persist credentials: {0}")]
    Store(#[from] StoreError),

    #[error("{kind} profile '{name}' not found")]
    ProfileNotFound { kind: &'static str, name: String },

    #[error("ambiguous match: found {count} {kind} entities named '{name}'")]
    AmbiguousMatch {
        kind: &'static str,
        name: String,
        count: usize,
    },

    #[error("device '{0}' has no credentials record")]
    MissingCredentials(String),

    #[error("device '{device}' uses unsupported credentials type '{kind}'")]
    UnsupportedCredentials { device: String, kind: String },

    #[error("handshake packet was not accepted by the telemetry queue")]
    HandshakeRejected,
}

impl From<TokenError> for FailureReason {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Auth(e) => FailureReason::Auth(e),
            TokenError::Api(e) => FailureReason::Api(e),
            TokenError::Store(e) => FailureReason::Store(e),
        }
    }
}

/// A provisioning run halted at `step`
#[derive(Debug, Error)]
#[error("provisioning failed while {step}: {reason}")]
pub struct ProvisioningError {
    pub step: ProvisioningStep,
    #[source]
    pub reason: FailureReason,
}

impl ProvisioningError {
    pub fn new(step: ProvisioningStep, reason: impl Into<FailureReason>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }

    /// Whether re-running the sequence may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(&self.reason, FailureReason::Api(e) if e.is_retryable())
    }
}

/// Tag errors with the provisioning step they happened in
pub(crate) trait AtStep<T> {
    fn at(self, step: ProvisioningStep) -> Result<T, ProvisioningError>;
}

impl<T, E: Into<FailureReason>> AtStep<T> for Result<T, E> {
    fn at(self, step: ProvisioningStep) -> Result<T, ProvisioningError> {
        self.map_err(|e| ProvisioningError::new(step, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_server_errors_are_retryable() {
        let transport = ProvisioningError::new(
            ProvisioningStep::Authenticating,
            ApiError::from(TransportError("connection refused".to_owned())),
        );
        assert!(transport.is_retryable());

        let unavailable = ProvisioningError::new(
            ProvisioningStep::EnsuringState,
            ApiError::Status(StatusCode::SERVICE_UNAVAILABLE, String::new()),
        );
        assert!(unavailable.is_retryable());

        let auth = ProvisioningError::new(
            ProvisioningStep::Authenticating,
            AuthError::InvalidCredentials("tenant@example.com".to_owned()),
        );
        assert!(!auth.is_retryable());

        let ambiguous = ProvisioningError::new(
            ProvisioningStep::EnsuringDevice,
            FailureReason::AmbiguousMatch {
                kind: "device",
                name: "gw-01".to_owned(),
                count: 2,
            },
        );
        assert!(!ambiguous.is_retryable());
    }

    #[test]
    fn it_names_the_failing_step() {
        let err = ProvisioningError::new(
            ProvisioningStep::EnsuringDevice,
            FailureReason::MissingCredentials("gw-01".to_owned()),
        );
        assert_eq!(
            err.to_string(),
            "provisioning failed while ensuring device: device 'gw-01' has no credentials record"
        );
    }
}
