//! Single-flight access token renewal
//!
//! Requests that come back `401 Unauthorized` ask the coordinator for a new
//! access token. The first one starts a renewal against the refresh
//! endpoint; every request failing while that renewal is in flight parks a
//! oneshot sender in the waiter queue and is released, in arrival order, with
//! the same outcome once the renewal settles.
//!
//! All state lives behind a synchronous mutex that is never held across an
//! `.await`, so "is a renewal running?" and "enqueue me" are one step no
//! matter how requests interleave.

use crate::config::Endpoints;
use crate::error::{ClientError, RefreshFailure};
use crate::interceptor::RequestInterceptor;
use crate::token::TokenStore;
use crate::transport::{ApiRequest, ApiResponse, Transport};
use crate::types::{RefreshRequest, Session, TokenResponse};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot};

/// Outcome of a renewal: the new access token or the reason there is none
pub type Renewal = Result<String, RefreshFailure>;

type Waiter = oneshot::Sender<Renewal>;

const EVENT_CAPACITY: usize = 16;

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Login or registration stored a new session
    SignedIn(Session),
    /// The access token was renewed
    Renewed,
    /// The session could not be kept alive; the user has to sign in again
    Ended { reason: String },
    /// The user signed out
    LoggedOut,
}

#[derive(Debug)]
enum RefreshState {
    Idle,
    Refreshing(VecDeque<Waiter>),
}

#[derive(Debug)]
struct Coordination {
    state: RefreshState,
    /// Bumped every time a renewal settles
    epoch: u64,
    /// Failure of the latest settled renewal, if it failed
    last_failure: Option<RefreshFailure>,
}

enum Acquired {
    /// This caller performs the renewal
    Leader,
    /// A renewal is in flight; wait for its outcome
    Queued(oneshot::Receiver<Renewal>),
    /// Already settled since the request was sent
    Settled(Renewal),
}

/// Coordinates access token renewal for every request sent through it.
pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    interceptor: RequestInterceptor,
    endpoints: Endpoints,
    coordination: Mutex<Coordination>,
    events: broadcast::Sender<SessionEvent>,
}

impl RefreshCoordinator {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenStore>, endpoints: Endpoints) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            interceptor: RequestInterceptor::new(tokens.clone(), endpoints.clone()),
            tokens,
            endpoints,
            coordination: Mutex::new(Coordination {
                state: RefreshState::Idle,
                epoch: 0,
                last_failure: None,
            }),
            events,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn interceptor(&self) -> &RequestInterceptor {
        &self.interceptor
    }

    /// Receive session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        debug!(?event, "Session event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Whether a renewal is in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(self.lock().state, RefreshState::Refreshing(_))
    }

    /// Number of requests waiting on the in-flight renewal
    pub fn pending_waiters(&self) -> usize {
        match &self.lock().state {
            RefreshState::Idle => 0,
            RefreshState::Refreshing(waiters) => waiters.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Coordination> {
        self.coordination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `request` with the current access token, renewing the session and
    /// replaying the request once if the server answers 401.
    ///
    /// # Errors
    ///
    /// Transport failures are returned unchanged. A failed renewal is
    /// [`ClientError::SessionExpired`], or [`ClientError::RenewalAbandoned`]
    /// when the renewing request was cancelled twice in a row; a 401 that
    /// survives the replay, or a 401 from login/register/refresh, is
    /// [`ClientError::AuthenticationFailed`].
    #[tracing::instrument(skip_all, fields(method = %request.method(), path = request.path()))]
    pub async fn execute(&self, mut request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let epoch = self.lock().epoch;
        self.interceptor.apply(&mut request);

        let response = self.transport.send(&request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return response.error_for_status();
        }
        let message = unauthorized_message(&response);

        if self.endpoints.is_bootstrap(request.path()) {
            warn!("Credentials rejected by {}", request.path());
            self.tokens.clear();
            self.emit(SessionEvent::Ended {
                reason: format!("{} rejected the credentials: {message}", request.path()),
            });
            return Err(ClientError::AuthenticationFailed(message));
        }

        if !request.mark_retried() {
            return Err(ClientError::AuthenticationFailed(message));
        }

        debug!("Access token rejected, renewing session");
        let token = self.obtain(Some(epoch), request.bearer_token()).await?;
        self.replay(request, &token).await
    }

    /// Current access token, renewing the session when there is none.
    ///
    /// Joins a renewal that is already in flight instead of starting another.
    pub async fn ensure_access(&self) -> Renewal {
        match self.tokens.access() {
            Some(token) => Ok(token),
            None => self.obtain(None, None).await,
        }
    }

    async fn replay(&self, mut request: ApiRequest, token: &str) -> Result<ApiResponse, ClientError> {
        request.set_bearer(token);
        debug!("Replaying request with renewed access token");

        let response = self.transport.send(&request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Request rejected again after renewal");
            return Err(ClientError::AuthenticationFailed(unauthorized_message(
                &response,
            )));
        }
        response.error_for_status()
    }

    /// Get a token to replace the one a failed request carried.
    ///
    /// `epoch` and `sent_with` describe the coordinator and token as they were
    /// when that request was sent; both are `None` for callers that simply
    /// need a token. A waiter whose leader was dropped tries once more, so one
    /// of the waiters takes over the renewal.
    async fn obtain(&self, epoch: Option<u64>, sent_with: Option<&str>) -> Renewal {
        let mut rejoined = false;
        loop {
            match self.acquire(epoch, sent_with) {
                Acquired::Leader => return self.lead_renewal().await,
                Acquired::Queued(rx) => {
                    debug!("Renewal in flight, waiting for it");
                    let outcome = rx.await.unwrap_or(Err(RefreshFailure::Abandoned));
                    if outcome == Err(RefreshFailure::Abandoned) && !rejoined {
                        debug!("Renewal abandoned by its leader, trying again");
                        rejoined = true;
                        continue;
                    }
                    return outcome;
                }
                Acquired::Settled(outcome) => return outcome,
            }
        }
    }

    fn acquire(&self, epoch: Option<u64>, sent_with: Option<&str>) -> Acquired {
        let mut guard = self.lock();
        let coordination = &mut *guard;
        let current_epoch = coordination.epoch;
        match &mut coordination.state {
            RefreshState::Refreshing(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                Acquired::Queued(rx)
            }
            RefreshState::Idle => {
                let renewed_since = epoch.is_some_and(|epoch| epoch != current_epoch);
                // A token newer than the one sent wins over any earlier failure
                match (self.tokens.access(), &coordination.last_failure) {
                    (Some(current), _) if sent_with != Some(current.as_str()) => {
                        Acquired::Settled(Ok(current))
                    }
                    (_, Some(failure)) if renewed_since => Acquired::Settled(Err(failure.clone())),
                    _ => {
                        coordination.state = RefreshState::Refreshing(VecDeque::new());
                        Acquired::Leader
                    }
                }
            }
        }
    }

    async fn lead_renewal(&self) -> Renewal {
        let guard = RenewalGuard::arm(self);
        let outcome = self.request_renewal().await;
        guard.disarm();

        match &outcome {
            Ok(_) => {
                info!("Access token renewed");
                self.emit(SessionEvent::Renewed);
                self.settle(&outcome, true);
            }
            Err(failure) => {
                warn!(%failure, "Session renewal failed");
                self.tokens.clear();
                self.settle(&outcome, true);
                self.emit(SessionEvent::Ended {
                    reason: failure.to_string(),
                });
            }
        }

        outcome
    }

    /// Call the refresh endpoint directly through the transport: no bearer
    /// token and no 401 handling, so a renewal can never trigger another one.
    async fn request_renewal(&self) -> Renewal {
        let refresh_token = match self.tokens.refresh() {
            Ok(Some(token)) => token,
            Ok(None) => return Err(RefreshFailure::MissingRefreshToken),
            Err(e) => return Err(RefreshFailure::Storage(e.to_string())),
        };

        let request = ApiRequest::post(self.endpoints.refresh.as_str())
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RefreshFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshFailure::Rejected {
                status: status.as_u16(),
                message: response.text(),
            });
        }

        let issued: TokenResponse = response
            .json()
            .map_err(|e| RefreshFailure::InvalidResponse(e.to_string()))?;
        let access = issued
            .access_token
            .ok_or_else(|| RefreshFailure::InvalidResponse("missing accessToken".to_string()))?;

        if let Err(e) = self
            .tokens
            .store_issued(&access, issued.refresh_token.as_deref())
        {
            // The new access token is usable; the next renewal will report the storage problem
            warn!(error = %e, "Failed to persist rotated refresh token");
        }

        Ok(access)
    }

    /// Return to idle and hand `outcome` to every queued request, oldest first
    fn settle(&self, outcome: &Renewal, record: bool) {
        let waiters = {
            let mut coordination = self.lock();
            if record {
                coordination.epoch += 1;
                coordination.last_failure = outcome.as_ref().err().cloned();
            }
            match std::mem::replace(&mut coordination.state, RefreshState::Idle) {
                RefreshState::Refreshing(waiters) => waiters,
                RefreshState::Idle => VecDeque::new(),
            }
        };

        if !waiters.is_empty() {
            debug!(count = waiters.len(), "Releasing queued requests");
        }
        for waiter in waiters {
            // The waiting request may have been dropped meanwhile
            let _ = waiter.send(outcome.clone());
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("tokens", &self.tokens)
            .field("endpoints", &self.endpoints)
            .field("coordination", &*self.lock())
            .finish_non_exhaustive()
    }
}

/// Releases queued requests if the renewing future is dropped mid-flight
struct RenewalGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl<'a> RenewalGuard<'a> {
    fn arm(coordinator: &'a RefreshCoordinator) -> Self {
        Self {
            coordinator,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Renewal dropped before completion, releasing queued requests");
            self.coordinator
                .settle(&Err(RefreshFailure::Abandoned), false);
        }
    }
}

fn unauthorized_message(response: &ApiResponse) -> String {
    let text = response.text();
    if text.is_empty() {
        StatusCode::UNAUTHORIZED.to_string()
    } else {
        text
    }
}
