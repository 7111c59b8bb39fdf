//! Identity claims carried inside an access token

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Errors produced while decoding an access token
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("token must have three dot-separated parts, found {0}")]
    Malformed(usize),

    #[error("token payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("token payload is not a valid claims object: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("token expiry {0} is out of range")]
    InvalidExpiry(f64),
}

/// Decoded access token claims
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claims {
    /// Subject (user ID)
    pub subject: String,
    /// User's email address
    pub email: String,
    /// Expiration instant, converted from the `exp` seconds claim
    pub expires_at: DateTime<Utc>,
    /// Every other claim the server put in the token
    pub extra: Map<String, JsonValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(i64),
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::Text(text) => text,
            Subject::Number(number) => number.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RawClaims {
    sub: Subject,
    email: String,
    exp: f64,
    #[serde(flatten)]
    extra: Map<String, JsonValue>,
}

impl Claims {
    /// Whether the token has expired relative to the current time
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the token is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Decode the claims of a three-part access token without verifying its signature.
///
/// The signature belongs to the server; the client only reads the identity
/// and expiry it was issued for.
pub fn decode_claims(token: &str) -> Result<Claims, DecodeError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [_, payload, _] = parts.as_slice() else {
        return Err(DecodeError::Malformed(parts.len()));
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    let raw: RawClaims = serde_json::from_slice(&bytes)?;

    // Fractional NumericDate values are allowed by RFC 7519
    let millis = (raw.exp * 1000.0).round();
    let expires_at = if millis.is_finite() {
        DateTime::from_timestamp_millis(millis as i64)
    } else {
        None
    }
    .ok_or(DecodeError::InvalidExpiry(raw.exp))?;

    Ok(Claims {
        subject: raw.sub.into(),
        email: raw.email,
        expires_at,
        extra: raw.extra,
    })
}
