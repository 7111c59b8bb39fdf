//! Turnstile client
//!
//! Email/password sign-in for HTTP API clients: the access token is kept in
//! memory and attached to every call, the refresh token is persisted, and a
//! `401 Unauthorized` triggers exactly one renewal no matter how many calls
//! fail at once. Calls that failed meanwhile are replayed with the new token.

#[macro_use]
extern crate tracing;

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod interceptor;
pub mod token;
pub mod transport;
pub mod types;

pub use auth::{AuthClient, AuthClientBuilder};
pub use config::{ClientConfig, Endpoints, StorageConfig};
pub use coordinator::{RefreshCoordinator, Renewal, SessionEvent};
pub use error::{ClientError, RefreshFailure};
pub use interceptor::RequestInterceptor;
pub use token::{Claims, DecodeError, FileStorage, MemoryStorage, RefreshStorage, StorageError, TokenStore};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
pub use types::{LoginRequest, RegisterRequest, Session, TokenResponse};
