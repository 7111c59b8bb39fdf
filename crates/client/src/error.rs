//! Client error types

use crate::token::{DecodeError, StorageError};
use thiserror::Error;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or request error
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Network failure reported by a non-reqwest transport
    #[error("Transport failed: {0}")]
    Transport(String),

    /// Server returned an error status
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Authentication failed and could not be recovered by renewing the session
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Login was refused by the server
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Registration payload was refused by the server
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The session could not be renewed; the user has to sign in again
    #[error("Session expired: {0}")]
    SessionExpired(RefreshFailure),

    /// The renewal this request waited on was cancelled; the session is intact
    #[error("Session renewal was cancelled before it completed")]
    RenewalAbandoned,

    /// The access token issued by the server could not be decoded
    #[error("Invalid access token: {0}")]
    InvalidToken(#[from] DecodeError),

    /// The server answered with a body this client does not understand
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable token storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl ClientError {
    /// Create error from HTTP status code
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            400 => Self::BadRequest(message),
            401 => Self::AuthenticationFailed(message),
            403 => Self::Forbidden(message),
            404 => Self::NotFound(message),
            _ => Self::ServerError {
                status: status.as_u16(),
                message,
            },
        }
    }

    /// HTTP status carried by this error, if it came from a server response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest(_) => Some(400),
            Self::AuthenticationFailed(_) => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the server rejected the request with a 4xx status
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|status| (400..500).contains(&status))
    }

    /// Whether the caller has to authenticate again
    pub fn is_auth_expired(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::SessionExpired(_)
        )
    }

    /// Whether this is a transport-level failure unrelated to authentication
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Transport(_))
    }

    /// Message of a server-side rejection, falling back to the display text
    pub(crate) fn into_message(self) -> String {
        match self {
            Self::BadRequest(message)
            | Self::AuthenticationFailed(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::ServerError { message, .. } => message,
            other => other.to_string(),
        }
    }
}

impl From<RefreshFailure> for ClientError {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::Abandoned => Self::RenewalAbandoned,
            failure => Self::SessionExpired(failure),
        }
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Why a session renewal did not produce a new access token.
///
/// Cloned into every request that was waiting on the same renewal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshFailure {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("refresh token rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("refresh response was not understood: {0}")]
    InvalidResponse(String),

    #[error("refresh token storage failed: {0}")]
    Storage(String),

    #[error("renewal was abandoned before it completed")]
    Abandoned,
}
