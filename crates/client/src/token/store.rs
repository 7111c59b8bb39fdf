//! Owner of the access and refresh tokens

use super::claims::{Claims, DecodeError, decode_claims};
use super::storage::{RefreshStorage, StorageError};
use arc_swap::ArcSwapOption;
use std::sync::Arc;

/// Holds the access token in memory and the refresh token in durable storage.
///
/// This is the only writer of either token.
pub struct TokenStore {
    access: ArcSwapOption<String>,
    refresh: Arc<dyn RefreshStorage>,
}

impl TokenStore {
    /// Create a store with no access token, backed by `refresh` storage
    pub fn new(refresh: Arc<dyn RefreshStorage>) -> Self {
        Self {
            access: ArcSwapOption::empty(),
            refresh,
        }
    }

    pub fn set_access(&self, token: impl Into<String>) {
        self.access.store(Some(Arc::new(token.into())));
    }

    /// Current access token, if any
    pub fn access(&self) -> Option<String> {
        self.access.load_full().map(|token| token.as_ref().clone())
    }

    pub fn clear_access(&self) {
        self.access.store(None);
    }

    pub fn set_refresh(&self, token: &str) -> Result<(), StorageError> {
        self.refresh.store(token)
    }

    /// Stored refresh token, if any
    pub fn refresh(&self) -> Result<Option<String>, StorageError> {
        self.refresh.load()
    }

    pub fn clear_refresh(&self) -> Result<(), StorageError> {
        self.refresh.remove()
    }

    /// Forget both tokens. Storage failures are logged, not returned.
    pub fn clear(&self) {
        self.clear_access();
        if let Err(e) = self.clear_refresh() {
            warn!(error = %e, "Failed to remove stored refresh token");
        }
    }

    /// Store the tokens issued by login, register or renewal
    pub fn store_issued(&self, access: &str, refresh: Option<&str>) -> Result<(), StorageError> {
        self.set_access(access);
        match refresh {
            Some(refresh) => self.set_refresh(refresh),
            None => Ok(()),
        }
    }

    /// `Bearer <token>` for the current access token
    pub fn auth_header(&self) -> Option<String> {
        self.access
            .load()
            .as_deref()
            .map(|token| format!("Bearer {token}"))
    }

    /// Claims of the current access token; `Ok(None)` without one
    pub fn claims(&self) -> Result<Option<Claims>, DecodeError> {
        self.access
            .load()
            .as_deref()
            .map(|token| decode_claims(token))
            .transpose()
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_access", &self.access.load().is_some())
            .finish_non_exhaustive()
    }
}
