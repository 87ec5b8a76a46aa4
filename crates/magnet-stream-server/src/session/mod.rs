//! Torrent session lifecycle.
//!
//! A session is the shared, time-bounded resource behind one info hash: it is
//! acquired once (with retries), streamed by any number of consumers, and evicted
//! once it has been idle for the cleanup delay.

pub(crate) mod acquisition;
pub(crate) mod cleanup;
pub(crate) mod refcount;
pub(crate) mod registry;

use std::sync::{Arc, Mutex, MutexGuard};

use magnet_stream_types::{FileEntry, SessionState, SessionSummary};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::engine::{EngineHandle, TransferEngine};
use crate::error::SessionError;
use crate::magnet::{InfoHash, MagnetLink};

use acquisition::AcquisitionStateMachine;
use cleanup::CleanupScheduler;
use refcount::StreamRefCounter;
use registry::SessionRegistry;

/// Published acquisition outcome observed by waiting `add` callers.
#[derive(Clone, Debug)]
pub(crate) enum SessionStatus {
    Pending { retry_count: u32 },
    Ready(Arc<Vec<FileEntry>>),
    Failed(String),
}

/// Mutable session fields, guarded by the per-session lock.
pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) files: Option<Arc<Vec<FileEntry>>>,
    pub(crate) retry_count: u32,
    pub(crate) ref_count: usize,
    /// Set whenever the session becomes idle; cleared by new streams.
    pub(crate) last_idle_at: Option<Instant>,
    /// Bumped on every idle transition and every new stream.
    pub(crate) idle_generation: u64,
    pub(crate) handle: Option<Arc<dyn EngineHandle>>,
    pub(crate) disposed: bool,
}

pub(crate) struct Session {
    info_hash: InfoHash,
    magnet: MagnetLink,
    created_at: Instant,
    inner: Mutex<SessionInner>,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    pub(crate) fn new(magnet: MagnetLink) -> Self {
        let (status, _) = watch::channel(SessionStatus::Pending { retry_count: 0 });
        Self {
            info_hash: magnet.info_hash.clone(),
            magnet,
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Pending,
                files: None,
                retry_count: 0,
                ref_count: 0,
                last_idle_at: None,
                idle_generation: 0,
                handle: None,
                disposed: false,
            }),
            status,
        }
    }

    pub(crate) fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub(crate) fn magnet(&self) -> &MagnetLink {
        &self.magnet
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn publish(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state
    }

    pub(crate) fn files(&self) -> Option<Arc<Vec<FileEntry>>> {
        self.lock().files.clone()
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn EngineHandle>> {
        self.lock().handle.clone()
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            info_hash: self.info_hash.to_string(),
            state: inner.state,
            retry_count: inner.retry_count,
            ref_count: inner.ref_count,
            files: inner
                .files
                .as_ref()
                .map(|files| files.to_vec())
                .unwrap_or_default(),
            idle_for_ms: inner
                .last_idle_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    pub(crate) fn age_ms(&self) -> u128 {
        self.created_at.elapsed().as_millis()
    }
}

/// Owns the registry and wires acquisition, ref counting, and cleanup together.
#[derive(Clone)]
pub(crate) struct SessionManager {
    registry: SessionRegistry,
    acquisition: AcquisitionStateMachine,
    refs: StreamRefCounter,
    cleanup: CleanupScheduler,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub(crate) fn new(engine: Arc<dyn TransferEngine>, config: SessionConfig) -> Self {
        let registry = SessionRegistry::new();
        let shutdown = CancellationToken::new();
        let cleanup = CleanupScheduler::new(
            registry.clone(),
            config.cleanup_delay,
            shutdown.child_token(),
        );
        let refs = StreamRefCounter::new(registry.clone(), cleanup.clone());
        let acquisition = AcquisitionStateMachine::new(
            engine,
            registry.clone(),
            cleanup.clone(),
            config.retry_policy(),
            shutdown.child_token(),
        );
        Self {
            registry,
            acquisition,
            refs,
            cleanup,
            shutdown,
        }
    }

    pub(crate) fn refs(&self) -> &StreamRefCounter {
        &self.refs
    }

    /// Add a magnet: join or start its acquisition and wait for the outcome.
    ///
    /// Dropping the returned future (client disconnect) only stops waiting; the
    /// acquisition keeps running for other joiners.
    pub(crate) async fn add(&self, magnet: MagnetLink) -> Result<Arc<Vec<FileEntry>>, SessionError> {
        let (session, is_new) = self.registry.get_or_create(&magnet);
        if is_new {
            tracing::info!(info_hash = %magnet.info_hash, "session created; starting acquisition");
            self.acquisition.spawn(session.clone());
        } else {
            let rearmed = self
                .registry
                .with_session(session.info_hash(), |_, inner| {
                    if inner.state == SessionState::Ready && inner.ref_count == 0 {
                        Some(self.cleanup.mark_idle(inner))
                    } else {
                        None
                    }
                })
                .flatten();
            if let Some(generation) = rearmed {
                self.cleanup.schedule(session.info_hash().clone(), generation);
            }
            tracing::debug!(
                info_hash = %magnet.info_hash,
                state = ?session.state(),
                age_ms = session.age_ms() as u64,
                "joined existing session"
            );
        }

        let mut status = session.subscribe();
        let outcome = status
            .wait_for(|status| !matches!(status, SessionStatus::Pending { .. }))
            .await
            .map(|status| status.clone());
        match outcome {
            Ok(SessionStatus::Ready(files)) => Ok(files),
            Ok(SessionStatus::Failed(reason)) => Err(SessionError::AcquisitionFailed(reason)),
            Ok(SessionStatus::Pending { .. }) | Err(_) => Err(SessionError::AcquisitionFailed(
                "acquisition abandoned".to_string(),
            )),
        }
    }

    /// Look up a live session for streaming.
    pub(crate) fn get(&self, info_hash: &InfoHash) -> Result<Arc<Session>, SessionError> {
        let session = self
            .registry
            .get(info_hash)
            .ok_or(SessionError::SessionNotFound)?;
        match session.state() {
            SessionState::Ready => Ok(session),
            SessionState::Pending => Err(SessionError::SessionNotReady),
            SessionState::Failed => Err(SessionError::SessionNotFound),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSummary> {
        self.registry.snapshot()
    }

    /// Cancel background work and dispose every session's engine handle.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let evicted = self.registry.drain();
        tracing::info!(count = evicted.len(), "disposing sessions");
        for entry in evicted {
            if let Some(handle) = entry.handle {
                handle.dispose().await;
            }
            entry.session.publish(SessionStatus::Failed("server shutting down".to_string()));
            tracing::debug!(info_hash = %entry.session.info_hash(), "session disposed");
        }
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}
