//! Authentication facade

use crate::config::{ClientConfig, Endpoints};
use crate::coordinator::{RefreshCoordinator, SessionEvent};
use crate::error::ClientError;
use crate::token::{Claims, FileStorage, RefreshStorage, TokenStore, decode_claims};
use crate::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
use crate::types::{LoginRequest, RegisterRequest, Session, TokenResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Signs users in and out and sends API calls with automatic session renewal.
///
/// Cheap to clone; clones share tokens and the renewal state.
#[derive(Clone, Debug)]
pub struct AuthClient {
    coordinator: Arc<RefreshCoordinator>,
}

impl AuthClient {
    /// Client for `config` over HTTP, with the refresh token kept on disk
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> AuthClientBuilder {
        AuthClientBuilder::default()
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.coordinator.tokens()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    fn endpoints(&self) -> &Endpoints {
        self.coordinator.endpoints()
    }

    /// Receive session lifecycle events, e.g. to send the user back to login
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    /// Create an account. Returns the new session when the server signs the
    /// user in right away.
    ///
    /// # Errors
    ///
    /// A 4xx answer is [`ClientError::Validation`].
    #[tracing::instrument(skip_all, fields(email = %request.email))]
    pub async fn register(&self, request: &RegisterRequest) -> Result<Option<Session>, ClientError> {
        let call = ApiRequest::post(&self.endpoints().register).json(request)?;
        let response = self.coordinator.execute(call).await.map_err(|e| {
            if e.is_client_error() {
                ClientError::Validation(e.into_message())
            } else {
                e
            }
        })?;

        let issued: TokenResponse = response.json()?;
        let Some(access) = issued.access_token else {
            info!("Registered, no session issued");
            return Ok(None);
        };

        let session = self.establish(&access, issued.refresh_token.as_deref())?;
        info!(user = %session.id, "Registered and signed in");
        Ok(Some(session))
    }

    /// Sign in with email and password
    ///
    /// # Errors
    ///
    /// A 4xx answer is [`ClientError::InvalidCredentials`]; a success without
    /// an access token is [`ClientError::UnexpectedResponse`].
    #[tracing::instrument(skip_all, fields(email = %credentials.email))]
    pub async fn login(&self, credentials: &LoginRequest) -> Result<Session, ClientError> {
        let call = ApiRequest::post(&self.endpoints().login).json(credentials)?;
        let response = self.coordinator.execute(call).await.map_err(|e| {
            if e.is_client_error() {
                ClientError::InvalidCredentials(e.into_message())
            } else {
                e
            }
        })?;

        let issued: TokenResponse = response.json()?;
        let access = issued.access_token.ok_or_else(|| {
            ClientError::UnexpectedResponse("login response has no accessToken".to_string())
        })?;

        let session = self.establish(&access, issued.refresh_token.as_deref())?;
        info!(user = %session.id, "Logged in");
        Ok(session)
    }

    fn establish(&self, access: &str, refresh: Option<&str>) -> Result<Session, ClientError> {
        let session = Session::from(decode_claims(access)?);
        self.tokens().store_issued(access, refresh)?;
        self.coordinator
            .emit(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Sign out. Tokens are always forgotten, whether or not the server could
    /// be told.
    pub async fn logout(&self) {
        if let Some(path) = &self.endpoints().logout {
            self.notify_logout(path).await;
        }

        self.tokens().clear();
        self.coordinator.emit(SessionEvent::LoggedOut);
        info!("Logged out");
    }

    async fn notify_logout(&self, path: &str) {
        let refresh = match self.tokens().refresh() {
            Ok(refresh) => refresh,
            Err(e) => {
                warn!(error = %e, "Failed to read refresh token for logout");
                None
            }
        };
        if refresh.is_none() && self.tokens().access().is_none() {
            return;
        }

        let mut request = ApiRequest::post(path);
        if let Some(refresh_token) = refresh {
            request = request.with_body(json!({ "refreshToken": refresh_token }));
        }
        self.coordinator.interceptor().apply(&mut request);

        match self.coordinator.transport().send(&request).await {
            Ok(response) if !response.status().is_success() => {
                debug!(status = %response.status(), "Server refused logout");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Logout request failed"),
        }
    }

    /// Claims of the signed-in user, renewing the session first if only a
    /// refresh token is left. `None` when nobody is signed in.
    pub async fn get_current_user(&self) -> Option<Claims> {
        if self.tokens().access().is_none() {
            match self.tokens().refresh() {
                Ok(Some(_)) => {}
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Failed to read refresh token");
                    return None;
                }
            }
        }

        let token = match self.coordinator.ensure_access().await {
            Ok(token) => token,
            Err(failure) => {
                debug!(%failure, "No session to restore");
                return None;
            }
        };

        match decode_claims(&token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!(error = %e, "Access token could not be decoded");
                None
            }
        }
    }

    /// Whether a user is signed in
    pub async fn check_auth(&self) -> bool {
        self.get_current_user().await.is_some()
    }

    /// Whether the access token is missing, unreadable or past its expiry
    pub fn is_token_expired(&self) -> bool {
        match self.tokens().claims() {
            Ok(Some(claims)) => claims.is_expired(),
            Ok(None) | Err(_) => true,
        }
    }

    /// `Bearer <token>` for the current access token
    pub fn auth_header(&self) -> Option<String> {
        self.tokens().auth_header()
    }

    /// Ask the server who is signed in
    pub async fn me(&self) -> Result<JsonValue, ClientError> {
        self.get(&self.endpoints().me).await
    }

    /// Send `request` through bearer attachment and session renewal
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        self.coordinator.execute(request).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(ApiRequest::post(path).json(body)?)
            .await?
            .json()
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.execute(ApiRequest::put(path).json(body)?)
            .await?
            .json()
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.execute(ApiRequest::delete(path)).await?.json()
    }
}

/// Builder for [`AuthClient`]
#[derive(Default)]
pub struct AuthClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn RefreshStorage>>,
}

impl AuthClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `transport` instead of a reqwest client built from the configuration
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keep the refresh token in `storage` instead of the configured directory
    pub fn storage(mut self, storage: Arc<dyn RefreshStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<AuthClient, ClientError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::from_config(&config)?),
        };
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(FileStorage::new(
                config.storage.resolved_dir(),
                &config.storage.key,
            ))
        });

        let tokens = Arc::new(TokenStore::new(storage));
        let coordinator = RefreshCoordinator::new(transport, tokens, config.endpoints);

        Ok(AuthClient {
            coordinator: Arc::new(coordinator),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryStorage;
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use reqwest::StatusCode;
    use reqwest::header::HeaderMap;
    use std::sync::Mutex;

    /// Answers every call with the next queued response
    #[derive(Default)]
    struct CannedTransport {
        replies: Mutex<Vec<Result<ApiResponse, ClientError>>>,
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl CannedTransport {
        fn replying(replies: Vec<Result<ApiResponse, ClientError>>) -> Arc<Self> {
            let mut replies = replies;
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::default(),
            })
        }

        fn seen(&self) -> Vec<ApiRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
            self.seen.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ClientError::Transport("no reply queued".into())))
        }
    }

    fn token(sub: &str, email: &str, exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(json!({"sub": sub, "email": email, "exp": exp}).to_string());
        format!("{header}.{payload}.signature")
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    fn client(transport: Arc<CannedTransport>, storage: MemoryStorage) -> AuthClient {
        AuthClient::builder()
            .transport(transport)
            .storage(Arc::new(storage))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_stores_tokens_and_announces_session() {
        let access = token("42", "a@b.com", in_an_hour());
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::json_body(
            StatusCode::OK,
            &json!({"accessToken": access, "refreshToken": "r1"}),
        ))]);
        let client = client(transport.clone(), MemoryStorage::new());
        let mut events = client.subscribe();

        let session = client.login(&LoginRequest::new("a@b.com", "pw")).await.unwrap();
        assert_eq!(session.id, "42");
        assert_eq!(session.email, "a@b.com");
        assert_eq!(client.tokens().refresh().unwrap().as_deref(), Some("r1"));
        assert!(!client.is_token_expired());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn(session));

        // Login never carries a bearer token
        assert_eq!(transport.seen()[0].bearer_token(), None);
    }

    #[tokio::test]
    async fn test_login_rejection_is_invalid_credentials() {
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::new(
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            "wrong password",
        ))]);
        let client = client(transport, MemoryStorage::new());

        let result = client.login(&LoginRequest::new("a@b.com", "nope")).await;
        assert!(matches!(
            result,
            Err(ClientError::InvalidCredentials(message)) if message == "wrong password"
        ));
        assert!(client.auth_header().is_none());
    }

    #[tokio::test]
    async fn test_login_without_access_token_is_unexpected() {
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::json_body(
            StatusCode::OK,
            &json!({"refreshToken": "r1"}),
        ))]);
        let client = client(transport, MemoryStorage::new());

        let result = client.login(&LoginRequest::new("a@b.com", "pw")).await;
        assert!(matches!(result, Err(ClientError::UnexpectedResponse(_))));
        assert_eq!(client.tokens().refresh().unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_without_session() {
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::json_body(
            StatusCode::CREATED,
            &json!({"message": "verify your email"}),
        ))]);
        let client = client(transport, MemoryStorage::new());

        let session = client
            .register(&RegisterRequest::new("a@b.com", "secret1"))
            .await
            .unwrap();
        assert!(session.is_none());
        assert!(client.tokens().access().is_none());
    }

    #[tokio::test]
    async fn test_register_rejection_is_validation_error() {
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::new(
            StatusCode::CONFLICT,
            HeaderMap::new(),
            "email taken",
        ))]);
        let client = client(transport, MemoryStorage::new());

        let result = client.register(&RegisterRequest::new("a@b.com", "secret1")).await;
        assert!(matches!(result, Err(ClientError::Validation(message)) if message == "email taken"));
    }

    #[tokio::test]
    async fn test_current_user_without_tokens_skips_network() {
        let transport = CannedTransport::replying(Vec::new());
        let client = client(transport.clone(), MemoryStorage::new());

        assert!(client.get_current_user().await.is_none());
        assert!(!client.check_auth().await);
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_current_user_restores_session_from_refresh_token() {
        let access = token("7", "c@d.com", in_an_hour());
        let transport = CannedTransport::replying(vec![Ok(ApiResponse::json_body(
            StatusCode::OK,
            &json!({"accessToken": access}),
        ))]);
        let client = client(transport.clone(), MemoryStorage::with_token("r1"));

        let claims = client.get_current_user().await.unwrap();
        assert_eq!(claims.subject, "7");
        assert_eq!(claims.email, "c@d.com");

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].path(), "/user/refresh-token");
        assert_eq!(seen[0].body(), Some(&json!({"refreshToken": "r1"})));
    }

    #[tokio::test]
    async fn test_current_user_with_undecodable_token() {
        let transport = CannedTransport::replying(Vec::new());
        let client = client(transport, MemoryStorage::new());
        client.tokens().set_access("not.a-token");

        assert!(client.get_current_user().await.is_none());
        assert!(client.is_token_expired());
    }

    #[tokio::test]
    async fn test_logout_clears_tokens_when_server_unreachable() {
        let transport = CannedTransport::replying(vec![Err(ClientError::Transport("down".into()))]);
        let client = client(transport.clone(), MemoryStorage::with_token("r1"));
        client.tokens().set_access("a1");
        let mut events = client.subscribe();

        client.logout().await;

        assert!(client.tokens().access().is_none());
        assert_eq!(client.tokens().refresh().unwrap(), None);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);

        let seen = transport.seen();
        assert_eq!(seen[0].path(), "/user/logout");
        assert_eq!(seen[0].bearer_token(), Some("a1"));
    }

    #[tokio::test]
    async fn test_logout_without_session_stays_local() {
        let transport = CannedTransport::replying(Vec::new());
        let client = client(transport.clone(), MemoryStorage::new());

        client.logout().await;
        assert!(transport.seen().is_empty());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = AuthClient::builder()
            .config(ClientConfig::new("localhost"))
            .storage(Arc::new(MemoryStorage::new()))
            .build();
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }
}
