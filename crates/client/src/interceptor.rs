//! Bearer token attachment for outbound requests

use crate::config::Endpoints;
use crate::token::TokenStore;
use crate::transport::ApiRequest;
use std::sync::Arc;

/// Adds `Authorization: Bearer <access token>` to every request except
/// login, register and refresh.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    tokens: Arc<TokenStore>,
    endpoints: Endpoints,
}

impl RequestInterceptor {
    pub fn new(tokens: Arc<TokenStore>, endpoints: Endpoints) -> Self {
        Self { tokens, endpoints }
    }

    /// Attach the current access token to `request`, if it needs one
    pub fn apply(&self, request: &mut ApiRequest) {
        if self.endpoints.is_bootstrap(request.path()) {
            return;
        }

        if let Some(token) = self.tokens.access() {
            request.set_bearer(&token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::MemoryStorage;

    fn interceptor_with_access(token: Option<&str>) -> RequestInterceptor {
        let tokens = Arc::new(TokenStore::new(Arc::new(MemoryStorage::new())));
        if let Some(token) = token {
            tokens.set_access(token);
        }
        RequestInterceptor::new(tokens, Endpoints::default())
    }

    #[test]
    fn test_attaches_bearer_to_api_calls() {
        let interceptor = interceptor_with_access(Some("access-1"));
        let mut request = ApiRequest::get("/user/me");
        interceptor.apply(&mut request);
        assert_eq!(request.bearer_token(), Some("access-1"));
    }

    #[test]
    fn test_skips_bootstrap_endpoints() {
        let interceptor = interceptor_with_access(Some("access-1"));
        for path in ["/user/login", "/user/register", "/user/refresh-token"] {
            let mut request = ApiRequest::post(path);
            interceptor.apply(&mut request);
            assert_eq!(request.bearer_token(), None, "{path} must not carry a token");
        }
    }

    #[test]
    fn test_no_header_without_access_token() {
        let interceptor = interceptor_with_access(None);
        let mut request = ApiRequest::get("/projects");
        interceptor.apply(&mut request);
        assert!(request.headers().is_empty());
    }
}
