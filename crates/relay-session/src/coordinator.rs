//! Session coordinator: the single writer for every live session.
//!
//! All mutations of a session's durable state go through the session's
//! barrier, so sequence numbers are allocated and committed in order and an
//! event reaches the feed only after the store has acknowledged it.

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use relay_core::{
    Coded, DispatchState, ErrorBody, ErrorCode, Event, EventBody, EventFeed, RelayConfig,
    ReportError, ReportSink, Request, RequestId, SessionDelta, SessionFilter, SessionId,
    SessionStatus, SessionStore, SessionSummary, StorageError, StorageStats, SweepReport,
    now_millis,
};
use relay_dispatch::{DispatchError, Invocation, Registry};
use serde_json::Value;
use tokio::{
    sync::{Mutex, MutexGuard, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Request id already used in this session: {0}")]
    DuplicateRequest(RequestId),
}

impl Coded for CoordinatorError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(e) => e.code(),
            Self::Report(e) => e.code(),
            Self::DuplicateRequest(_) => ErrorCode::DuplicateRequest,
        }
    }
}

/// Outcome delivered to everyone waiting on a request.
pub type Completion = Result<Event, ErrorBody>;

/// Connection handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake {
    /// Session to resume; `None` creates a new session.
    pub session_id: Option<SessionId>,
    /// Highest sequence number the client has already processed.
    pub last_seen: Option<u64>,
}

/// A connection attached to a session.
#[derive(Clone)]
pub struct Attachment {
    pub session_id: SessionId,
    pub resumed: bool,
    /// Replay starts after this sequence number.
    pub resume_from: u64,
    pub last_acked: u64,
    pub head: u64,
    pub feed: Arc<EventFeed>,
}

impl Attachment {
    /// Replay-then-live event stream bounded by `window` unacked events.
    #[must_use]
    pub fn events(&self, window: usize) -> futures::stream::BoxStream<'static, Event> {
        Arc::clone(&self.feed).replay_then_live(self.resume_from, window)
    }
}

/// Handle for a submitted request.
pub struct SubmitHandle {
    pub request_id: RequestId,
    /// True if this submission joined an in-flight dispatch.
    pub coalesced: bool,
    completion: Shared<BoxFuture<'static, Completion>>,
}

impl SubmitHandle {
    /// Wait for the request's event to be committed.
    pub async fn wait(self) -> Completion {
        self.completion.await
    }
}

type InFlight = Shared<BoxFuture<'static, Completion>>;

/// State kept for sessions this process is serving.
struct LiveSession {
    id: SessionId,
    barrier: Mutex<()>,
    feed: Arc<EventFeed>,
    inflight: std::sync::Mutex<HashMap<RequestId, InFlight>>,
    connections: AtomicUsize,
}

impl LiveSession {
    fn joined(&self, id: &RequestId) -> Option<InFlight> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn track(&self, id: RequestId, completion: InFlight) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, completion);
    }

    fn untrack(&self, id: &RequestId) {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Session coordinator.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionCoordinator {
    store: Arc<dyn SessionStore>,
    reports: Arc<dyn ReportSink>,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
    live: Arc<RwLock<HashMap<SessionId, Arc<LiveSession>>>>,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        reports: Arc<dyn ReportSink>,
        registry: Arc<Registry>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            reports,
            registry,
            config: Arc::new(config),
            live: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn reports(&self) -> &Arc<dyn ReportSink> {
        &self.reports
    }

    async fn live_session(&self, id: SessionId) -> Result<Arc<LiveSession>, CoordinatorError> {
        if let Some(live) = self.live.read().await.get(&id) {
            return Ok(Arc::clone(live));
        }

        let session = self.store.load(id).await?;
        let mut live = self.live.write().await;
        let entry = live.entry(id).or_insert_with(|| {
            Arc::new(LiveSession {
                id,
                barrier: Mutex::new(()),
                feed: Arc::new(EventFeed::new(&session)),
                inflight: std::sync::Mutex::new(HashMap::new()),
                connections: AtomicUsize::new(0),
            })
        });
        Ok(Arc::clone(entry))
    }

    async fn retire(&self, id: SessionId) {
        if let Some(live) = self.live.write().await.remove(&id) {
            live.feed.close();
        }
    }

    /// Attach a connection, creating or resuming a session.
    ///
    /// # Errors
    /// `NotFound` or `Expired` when resuming an unusable session,
    /// `StorageFailure` if the session cannot be recorded.
    pub async fn open(&self, handshake: Handshake) -> Result<Attachment, CoordinatorError> {
        let (id, resumed) = match handshake.session_id {
            Some(id) => (id, true),
            None => {
                let session = self.store.create().await?;
                info!(session_id = %session.id, "Session created");
                (session.id, false)
            }
        };

        let live = self.live_session(id).await?;
        let barrier = live.barrier.lock().await;
        let mut delta = SessionDelta::default().status(SessionStatus::Active);
        if let Some(seen) = handshake.last_seen {
            delta = delta.ack(seen);
        }
        let session = self.store.persist(id, delta).await?;
        live.feed.ack(session.last_acked);
        live.connections.fetch_add(1, Ordering::SeqCst);
        drop(barrier);

        let resume_from = handshake
            .last_seen
            .unwrap_or(session.last_acked)
            .min(session.head());
        if resumed {
            info!(session_id = %id, resume_from, head = session.head(), "Session resumed");
        }

        Ok(Attachment {
            session_id: id,
            resumed,
            resume_from,
            last_acked: session.last_acked,
            head: session.head(),
            feed: Arc::clone(&live.feed),
        })
    }

    /// Detach a connection; the session goes idle when none remain.
    pub async fn detach(&self, session_id: SessionId) {
        let Some(live) = self.live.read().await.get(&session_id).cloned() else {
            return;
        };
        let previous = live
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }

        let _barrier = live.barrier.lock().await;
        if live.connections.load(Ordering::SeqCst) > 0 {
            return;
        }
        match self
            .store
            .persist(session_id, SessionDelta::default().status(SessionStatus::Idle))
            .await
        {
            Ok(_) => debug!(%session_id, "Session idle"),
            Err(e) => debug!(%session_id, "Could not mark session idle: {e}"),
        }
    }

    /// Refresh the session's activity timestamp.
    ///
    /// # Errors
    /// `NotFound` or `Expired` if the session is unusable.
    pub async fn touch(&self, session_id: SessionId) -> Result<(), CoordinatorError> {
        self.store.touch(session_id).await?;
        Ok(())
    }

    /// Submit a request for dispatch.
    ///
    /// A request whose identifier is still in flight joins that dispatch. An
    /// unknown method is answered with an `unknown_method` error event
    /// without recording the identifier.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for unusable sessions, `DuplicateRequest` if the
    /// identifier already completed, `StorageFailure` if the dispatch record
    /// cannot be written.
    pub async fn submit(
        &self,
        session_id: SessionId,
        request: Request,
    ) -> Result<SubmitHandle, CoordinatorError> {
        let live = self.live_session(session_id).await?;
        self.store.touch(session_id).await?;

        let barrier = live.barrier.lock().await;
        let request_id = request.id.clone();

        if let Some(completion) = live.joined(&request_id) {
            debug!(%session_id, %request_id, "Coalesced duplicate request");
            return Ok(SubmitHandle {
                request_id,
                coalesced: true,
                completion,
            });
        }

        if let Err(e) = self.registry.resolve(&request.method) {
            let body = EventBody::Error(e.to_body());
            let event = self
                .commit(&barrier, &live, Some(request_id.clone()), body, false)
                .await?;
            warn!(%session_id, %request_id, method = %request.method, "Unknown method");
            return Ok(SubmitHandle {
                request_id,
                coalesced: false,
                completion: futures::future::ready(Ok(event)).boxed().shared(),
            });
        }

        let session = self.store.load(session_id).await?;
        match session.dispatch.get(&request_id) {
            Some(DispatchState::Completed { .. } | DispatchState::Failed { .. }) => {
                return Err(CoordinatorError::DuplicateRequest(request_id));
            }
            Some(DispatchState::InFlight { .. }) => {
                // Left over from a previous process; run it again.
                info!(%session_id, %request_id, "Re-dispatching interrupted request");
            }
            None => {}
        }

        self.store
            .persist(
                session_id,
                SessionDelta::default().dispatch(
                    request_id.clone(),
                    DispatchState::InFlight {
                        method: request.method.clone(),
                        received_at: request.received_at,
                    },
                ),
            )
            .await?;

        let task = tokio::spawn(self.clone().dispatch(Arc::clone(&live), request));
        let completion = async move {
            task.await.unwrap_or_else(|e| {
                Err(ErrorBody::new(
                    ErrorCode::HandlerError,
                    format!("dispatch task failed: {e}"),
                ))
            })
        }
        .boxed()
        .shared();
        live.track(request_id.clone(), completion.clone());
        drop(barrier);

        debug!(%session_id, %request_id, "Request dispatched");
        Ok(SubmitHandle {
            request_id,
            coalesced: false,
            completion,
        })
    }

    async fn dispatch(self, live: Arc<LiveSession>, request: Request) -> Completion {
        let request_id = request.id.clone();
        let method = request.method.clone();

        let outcome = match self.registry.resolve(&method) {
            Ok(capability) => {
                self.registry
                    .invoke(capability, Invocation::new(live.id, request))
                    .await
            }
            Err(e) => Err(e),
        };

        let body = match outcome {
            Ok(output) => match output.artifact {
                Some(bytes) => match self.reports.write(live.id, &request_id, &bytes).await {
                    Ok(report_id) => EventBody::Result {
                        value: output.value,
                        report_id: Some(report_id),
                    },
                    Err(e) => {
                        warn!(session_id = %live.id, %request_id, "Report write failed: {e}");
                        EventBody::Error(e.to_body())
                    }
                },
                None => EventBody::Result {
                    value: output.value,
                    report_id: None,
                },
            },
            Err(e) => {
                log_dispatch_error(live.id, &request_id, &e);
                EventBody::Error(e.to_body())
            }
        };

        let barrier = live.barrier.lock().await;
        let committed = self
            .commit(&barrier, &live, Some(request_id.clone()), body, true)
            .await;
        if let Err(e) = &committed {
            error!(session_id = %live.id, %request_id, "Failed to commit result: {e}");
            let failed = SessionDelta::default().dispatch(
                request_id.clone(),
                DispatchState::Failed {
                    code: ErrorCode::StorageFailure,
                },
            );
            if let Err(e) = self.store.persist(live.id, failed).await {
                debug!(session_id = %live.id, %request_id, "Could not record failure: {e}");
            }
        }
        live.untrack(&request_id);
        drop(barrier);

        committed.map_err(|e| e.to_body())
    }

    /// Allocate the next sequence number, persist the event and publish it.
    async fn commit(
        &self,
        _barrier: &MutexGuard<'_, ()>,
        live: &LiveSession,
        request_id: Option<RequestId>,
        body: EventBody,
        record: bool,
    ) -> Result<Event, CoordinatorError> {
        let seq = live.feed.cursor().head + 1;
        let outcome = match body.error_code() {
            Some(code) => DispatchState::Failed { code },
            None => DispatchState::Completed { seq },
        };
        let event = Event {
            seq,
            request_id,
            body,
            created_at: now_millis(),
        };

        let mut delta = SessionDelta::default().event(event.clone());
        if record {
            if let Some(id) = &event.request_id {
                delta = delta.dispatch(id.clone(), outcome);
            }
        }
        self.store.persist(live.id, delta).await?;
        live.feed.push(event.clone());

        debug!(session_id = %live.id, seq, "Event committed");
        Ok(event)
    }

    /// Acknowledge events through `through`.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for unusable sessions, `StorageFailure` on write
    /// failure.
    pub async fn ack(&self, session_id: SessionId, through: u64) -> Result<u64, CoordinatorError> {
        let live = self.live_session(session_id).await?;
        let _barrier = live.barrier.lock().await;
        let session = self
            .store
            .persist(session_id, SessionDelta::default().ack(through))
            .await?;
        live.feed.ack(session.last_acked);
        Ok(session.last_acked)
    }

    /// Push a server-initiated notification to the session.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for unusable sessions, `StorageFailure` on write
    /// failure.
    pub async fn notify(
        &self,
        session_id: SessionId,
        method: impl Into<String>,
        params: Value,
    ) -> Result<Event, CoordinatorError> {
        let live = self.live_session(session_id).await?;
        let barrier = live.barrier.lock().await;
        let body = EventBody::Notification {
            method: method.into(),
            params,
        };
        self.commit(&barrier, &live, None, body, false).await
    }

    /// Close a session and destroy its storage.
    ///
    /// # Errors
    /// `NotFound` if the session does not exist.
    pub async fn close(&self, session_id: SessionId) -> Result<(), CoordinatorError> {
        let live = self.live.read().await.get(&session_id).cloned();
        if let Some(live) = live {
            let _barrier = live.barrier.lock().await;
            if let Err(e) = self
                .store
                .persist(session_id, SessionDelta::default().status(SessionStatus::Closed))
                .await
            {
                debug!(%session_id, "Closing session without final status: {e}");
            }
        }
        self.retire(session_id).await;
        self.store.remove(session_id).await?;
        info!(%session_id, "Session closed");
        Ok(())
    }

    /// Summary of a usable session.
    ///
    /// # Errors
    /// `NotFound` or `Expired`.
    pub async fn status(&self, session_id: SessionId) -> Result<SessionSummary, CoordinatorError> {
        Ok(self.store.load(session_id).await?.summary())
    }

    /// List sessions.
    ///
    /// # Errors
    /// `StorageFailure` if the store cannot be read.
    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, CoordinatorError> {
        Ok(self.store.list(filter).await?)
    }

    /// Storage statistics.
    ///
    /// # Errors
    /// `StorageFailure` if the store cannot be read.
    pub async fn stats(&self) -> Result<StorageStats, CoordinatorError> {
        Ok(self.store.stats().await?)
    }

    /// Run one expiry pass and end the feeds of sessions it retired.
    ///
    /// # Errors
    /// `StorageFailure` if the store cannot be scanned.
    pub async fn sweep(&self, now: i64) -> Result<SweepReport, CoordinatorError> {
        let report = self.store.sweep(now).await?;
        for id in report.expired.iter().chain(&report.reclaimed) {
            self.retire(*id).await;
        }
        Ok(report)
    }

    /// End every live event stream so attached connections can finish.
    ///
    /// Session records are left as they are; clients resume them after the
    /// restart from their last acknowledged event.
    pub async fn shutdown(&self) {
        let live = self.live.read().await;
        for session in live.values() {
            session.feed.close();
        }
        info!(sessions = live.len(), "Closed live event streams");
    }

    /// Spawn the background sweeper.
    ///
    /// Passes run every `interval`; after a failed pass the next one is
    /// delayed by `backoff` instead.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration, backoff: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Session sweeper started");
            loop {
                let delay = match coordinator.sweep(now_millis()).await {
                    Ok(report) => {
                        if !report.errors.is_empty() {
                            warn!(errors = ?report.errors, "Sweep finished with errors");
                        }
                        interval
                    }
                    Err(e) => {
                        error!("Session sweep failed: {e}");
                        backoff
                    }
                };
                tokio::time::sleep(delay).await;
            }
        })
    }
}

fn log_dispatch_error(session_id: SessionId, request_id: &RequestId, error: &DispatchError) {
    match error {
        DispatchError::InvalidParams { .. } | DispatchError::UnknownMethod(_) => {
            debug!(%session_id, %request_id, "Request rejected: {error}");
        }
        DispatchError::Handler { .. } | DispatchError::Timeout { .. } => {
            warn!(%session_id, %request_id, "Request failed: {error}");
        }
    }
}
