//! Single-flight session renewal.
//!
//! State machine: `Idle` -> `Refreshing` on the first 401, back to `Idle` once
//! the refresh succeeds and the queue is drained, or to `Terminated` when the
//! refresh fails. `Terminated` only goes back to `Idle` through `establish`,
//! which login calls with fresh credentials.
//!
//! Login and logout bump a session generation. A renewal that finishes after
//! the generation moved on belongs to a session that no longer exists: its
//! result is dropped and its queue is replayed against whatever the store
//! holds now.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiRequest, ApiResponse, RenewalError};
use crate::auth::{Credential, CredentialStore, TokenPair};

use super::events::{SessionEvent, SessionEvents};
use super::{RenewedTokens, SessionTransport};

/// Re-issues a request with an explicit access credential.
///
/// Implemented by the dispatcher. Replayed requests are marked retried, so a
/// second 401 propagates to the caller instead of coming back here.
#[async_trait]
pub trait Replay: Send + Sync + 'static {
    async fn replay(&self, request: ApiRequest, access: Credential)
        -> Result<ApiResponse, ApiError>;
}

type Outcome = Result<ApiResponse, ApiError>;

/// A caller suspended until the in-flight renewal resolves.
struct PendingRequest {
    request: ApiRequest,
    reply: oneshot::Sender<Outcome>,
}

enum RenewalState {
    Idle,
    Refreshing { queue: VecDeque<PendingRequest> },
    Terminated,
}

struct SessionState {
    /// Bumped by every login and logout
    generation: u64,
    renewal: RenewalState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPhase {
    Idle,
    Refreshing,
    Terminated,
}

/// What a 401 turns into once it has been admitted under the state lock.
enum Admission {
    /// This request owns the renewal, started in `generation`
    Renew {
        owner: PendingRequest,
        rx: oneshot::Receiver<Outcome>,
        generation: u64,
    },
    /// A renewal is already running; wait for it
    Wait(oneshot::Receiver<Outcome>),
    /// The store already holds a newer token than the one that was rejected
    Replay(ApiRequest, Credential),
    Terminated,
}

/// How a finished renewal is applied, decided under the state lock.
enum Settlement {
    Renewed(Credential, VecDeque<PendingRequest>),
    Failed(RenewalError, VecDeque<PendingRequest>),
    /// Login or logout happened while the refresh call was out
    Superseded(Option<Credential>, VecDeque<PendingRequest>),
}

pub struct RenewalCoordinator {
    store: Arc<dyn CredentialStore>,
    transport: Arc<dyn SessionTransport>,
    events: SessionEvents,
    state: Mutex<SessionState>,
}

impl RenewalCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, transport: Arc<dyn SessionTransport>) -> Self {
        Self {
            store,
            transport,
            events: SessionEvents::new(),
            state: Mutex::new(SessionState {
                generation: 0,
                renewal: RenewalState::Idle,
            }),
        }
    }

    pub fn phase(&self) -> RenewalPhase {
        match self.state.lock().renewal {
            RenewalState::Idle => RenewalPhase::Idle,
            RenewalState::Refreshing { .. } => RenewalPhase::Refreshing,
            RenewalState::Terminated => RenewalPhase::Terminated,
        }
    }

    /// Number of requests parked behind the in-flight renewal
    pub fn queued(&self) -> usize {
        match &self.state.lock().renewal {
            RenewalState::Refreshing { queue } => queue.len(),
            _ => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    /// Store the credentials of a new login and re-arm renewal after a
    /// terminated session. A renewal still in flight keeps its queue but can
    /// no longer touch the store.
    pub fn establish(&self, tokens: TokenPair, user: Option<Value>) {
        let mut state = self.state.lock();
        state.generation += 1;
        self.store.set_tokens(tokens);
        if let Some(user) = user {
            self.store.set_user(user);
        }
        if matches!(state.renewal, RenewalState::Terminated) {
            state.renewal = RenewalState::Idle;
        }
    }

    /// Discard all credentials. A renewal still in flight can no longer
    /// touch the store.
    pub fn end_session(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        self.store.clear_all();
    }

    /// Resolve a request that came back 401.
    ///
    /// Retried requests fail immediately with `Unauthorized`. Otherwise the
    /// caller is suspended until the session has been renewed and the request
    /// replayed, or until renewal fails, in which case it gets the renewal
    /// error rather than the original 401.
    pub async fn recover<R>(
        self: &Arc<Self>,
        replayer: R,
        request: ApiRequest,
    ) -> Result<ApiResponse, ApiError>
    where
        R: Replay + Clone,
    {
        if request.is_retried() {
            return Err(ApiError::Unauthorized);
        }

        match self.admit(request) {
            Admission::Renew {
                owner,
                rx,
                generation,
            } => {
                // The renewal runs on its own task so a dropped caller cannot
                // leave the queue stranded in `Refreshing`.
                tokio::spawn(Arc::clone(self).drive(replayer, owner, generation));
                Self::wait(rx).await
            }
            Admission::Wait(rx) => Self::wait(rx).await,
            Admission::Replay(request, access) => {
                debug!(path = request.target(), "Token already renewed, replaying");
                replayer.replay(request, access).await
            }
            Admission::Terminated => Err(RenewalError::SessionTerminated.into()),
        }
    }

    fn admit(&self, mut request: ApiRequest) -> Admission {
        let mut state = self.state.lock();
        let generation = state.generation;
        match &mut state.renewal {
            RenewalState::Refreshing { queue } => {
                let (reply, rx) = oneshot::channel();
                queue.push_back(PendingRequest { request, reply });
                debug!(queued = queue.len(), "Renewal in flight, request parked");
                Admission::Wait(rx)
            }
            RenewalState::Terminated => Admission::Terminated,
            RenewalState::Idle => {
                request.mark_retried();
                if let Some(current) = self.store.access() {
                    if request.sent_with() != Some(&current) {
                        return Admission::Replay(request, current);
                    }
                }
                state.renewal = RenewalState::Refreshing {
                    queue: VecDeque::new(),
                };
                let (reply, rx) = oneshot::channel();
                Admission::Renew {
                    owner: PendingRequest { request, reply },
                    rx,
                    generation,
                }
            }
        }
    }

    async fn wait(rx: oneshot::Receiver<Outcome>) -> Outcome {
        rx.await
            .unwrap_or_else(|_| Err(RenewalError::Abandoned.into()))
    }

    async fn drive<R>(self: Arc<Self>, replayer: R, owner: PendingRequest, generation: u64)
    where
        R: Replay + Clone,
    {
        info!("Access token rejected, renewing session");

        let outcome = self.renew().await;
        match self.settle(generation, outcome) {
            Settlement::Renewed(access, queue) => {
                info!(replays = queue.len() + 1, "Session renewed, replaying requests");
                self.events.emit(SessionEvent::Renewed { at: Utc::now() });
                Self::replay_all(replayer, owner, queue, access).await;
            }
            Settlement::Failed(e, queue) => {
                warn!(error = %e, "Session renewal failed, credentials cleared");
                Self::fail_all(owner, queue, &e);
                self.events.emit(SessionEvent::Terminated {
                    reason: e,
                    at: Utc::now(),
                });
            }
            Settlement::Superseded(Some(access), queue) => {
                info!("Session changed during renewal, replaying with current credentials");
                Self::replay_all(replayer, owner, queue, access).await;
            }
            Settlement::Superseded(None, queue) => {
                info!("Logged out during renewal, dropping queued requests");
                Self::fail_all(owner, queue, &RenewalError::SessionEnded);
            }
        }
    }

    /// The refresh call itself. Nothing is stored here; `settle` decides
    /// whether the result still applies.
    async fn renew(&self) -> Result<RenewedTokens, RenewalError> {
        let refresh = self
            .store
            .refresh()
            .ok_or(RenewalError::MissingRefreshToken)?;
        self.transport.renew(&refresh).await
    }

    /// Leave `Refreshing` and apply the renewal outcome to the store, unless
    /// login or logout moved the session on in the meantime.
    fn settle(
        &self,
        generation: u64,
        outcome: Result<RenewedTokens, RenewalError>,
    ) -> Settlement {
        let mut state = self.state.lock();

        if state.generation != generation {
            let queue = Self::take_queue(&mut state.renewal, RenewalState::Idle);
            return Settlement::Superseded(self.store.access(), queue);
        }

        match outcome {
            Ok(renewed) => {
                let access = renewed.access.clone();
                match renewed.refresh {
                    Some(refresh) => self.store.set_tokens(TokenPair {
                        access: renewed.access,
                        refresh,
                    }),
                    None => self.store.set_access(renewed.access),
                }
                let queue = Self::take_queue(&mut state.renewal, RenewalState::Idle);
                Settlement::Renewed(access, queue)
            }
            Err(e) => {
                self.store.clear_all();
                let queue = Self::take_queue(&mut state.renewal, RenewalState::Terminated);
                Settlement::Failed(e, queue)
            }
        }
    }

    fn take_queue(renewal: &mut RenewalState, next: RenewalState) -> VecDeque<PendingRequest> {
        match std::mem::replace(renewal, next) {
            RenewalState::Refreshing { queue } => queue,
            _ => VecDeque::new(),
        }
    }

    async fn replay_all<R>(
        replayer: R,
        owner: PendingRequest,
        queue: VecDeque<PendingRequest>,
        access: Credential,
    ) where
        R: Replay + Clone,
    {
        // join_all polls in order, so replays go out in arrival order
        let replays = std::iter::once(owner).chain(queue).map(|pending| {
            let replayer = replayer.clone();
            let access = access.clone();
            async move {
                let outcome = replayer.replay(pending.request, access).await;
                // The caller may have given up waiting
                let _ = pending.reply.send(outcome);
            }
        });
        join_all(replays).await;
    }

    fn fail_all(owner: PendingRequest, queue: VecDeque<PendingRequest>, error: &RenewalError) {
        for pending in std::iter::once(owner).chain(queue) {
            let _ = pending.reply.send(Err(ApiError::Renewal(error.clone())));
        }
    }
}
