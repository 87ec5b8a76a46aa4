//! Acquisition state machine.
//!
//! Drives a fresh session from `Pending` to `Ready` or `Failed`. Every attempt
//! owns its own event receiver, and every event goes through [`transition`], so
//! nothing from an abandoned attempt can affect the next one.

use std::sync::Arc;
use std::time::Duration;

use magnet_stream_types::SessionState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cleanup::CleanupScheduler;
use super::registry::SessionRegistry;
use super::{Session, SessionStatus};
use crate::engine::{EngineEvent, TransferEngine};

/// Retry limits for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Treat an attempt with no terminal event after this long as failed.
    pub metadata_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Linear backoff, uncapped.
    pub(crate) fn delay_for(&self, retry_count: u32) -> Duration {
        self.base_delay.saturating_mul(retry_count)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Ready,
    Retry { retry_count: u32, delay: Duration },
    Fail,
    Ignore,
}

/// Transition table keyed by `(state, event)`.
pub(crate) fn transition(
    state: SessionState,
    retry_count: u32,
    event: &EngineEvent,
    policy: &RetryPolicy,
) -> Transition {
    match (state, event) {
        (SessionState::Pending, EngineEvent::MetadataReady) => Transition::Ready,
        (SessionState::Pending, EngineEvent::Error(_)) if retry_count < policy.max_retries => {
            let retry_count = retry_count + 1;
            Transition::Retry {
                retry_count,
                delay: policy.delay_for(retry_count),
            }
        }
        (SessionState::Pending, EngineEvent::Error(_)) => Transition::Fail,
        (_, EngineEvent::Warning(_)) => Transition::Ignore,
        (SessionState::Ready | SessionState::Failed, _) => Transition::Ignore,
    }
}

enum AttemptOutcome {
    Ready,
    Retry,
    Failed(String),
    Cancelled,
}

#[derive(Clone)]
pub(crate) struct AcquisitionStateMachine {
    engine: Arc<dyn TransferEngine>,
    registry: SessionRegistry,
    cleanup: CleanupScheduler,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl AcquisitionStateMachine {
    pub(crate) fn new(
        engine: Arc<dyn TransferEngine>,
        registry: SessionRegistry,
        cleanup: CleanupScheduler,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            registry,
            cleanup,
            policy,
            cancel,
        }
    }

    /// Run acquisition for a freshly created session in the background.
    pub(crate) fn spawn(&self, session: Arc<Session>) {
        let machine = self.clone();
        tokio::spawn(async move {
            let cancel = machine.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(info_hash = %session.info_hash(), "acquisition cancelled");
                }
                _ = machine.run(session.clone()) => {}
            }
        });
    }

    /// Bounded retry loop: at most `max_retries + 1` attempts.
    pub(crate) async fn run(&self, session: Arc<Session>) {
        loop {
            match self.attempt(&session).await {
                AttemptOutcome::Ready => {
                    self.mark_ready(&session);
                    return;
                }
                AttemptOutcome::Retry => {
                    let (retry_count, delay) = {
                        let inner = session.lock();
                        (inner.retry_count, self.policy.delay_for(inner.retry_count))
                    };
                    session.publish(SessionStatus::Pending { retry_count });
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    tracing::info!(
                        info_hash = %session.info_hash(),
                        retry_count,
                        "restarting acquisition"
                    );
                }
                AttemptOutcome::Failed(reason) => {
                    self.mark_failed(&session, reason);
                    return;
                }
                AttemptOutcome::Cancelled => return,
            }
        }
    }

    async fn attempt(&self, session: &Arc<Session>) -> AttemptOutcome {
        let mut events = match self.engine.acquire(session.magnet()).await {
            Ok(acquisition) => {
                let installed = {
                    let mut inner = session.lock();
                    if inner.disposed {
                        false
                    } else {
                        inner.handle = Some(acquisition.handle.clone());
                        true
                    }
                };
                if !installed {
                    acquisition.handle.dispose().await;
                    return AttemptOutcome::Cancelled;
                }
                Some(acquisition.events)
            }
            Err(err) => {
                tracing::warn!(info_hash = %session.info_hash(), error = %err, "engine refused acquisition");
                None
            }
        };

        let deadline = self
            .policy
            .metadata_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let event = match events.as_mut() {
                Some(events) => next_event(events, deadline).await,
                None => EngineEvent::Error("engine refused acquisition".to_string()),
            };
            let (state, retry_count) = {
                let inner = session.lock();
                (inner.state, inner.retry_count)
            };
            match transition(state, retry_count, &event, &self.policy) {
                Transition::Ignore => {
                    if let EngineEvent::Warning(message) = &event {
                        tracing::warn!(info_hash = %session.info_hash(), warning = %message, "engine warning");
                        continue;
                    }
                    return AttemptOutcome::Cancelled;
                }
                Transition::Ready => return AttemptOutcome::Ready,
                Transition::Retry { retry_count, delay } => {
                    tracing::warn!(
                        info_hash = %session.info_hash(),
                        error = %error_message(&event),
                        retry_count,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "acquisition failed; will retry"
                    );
                    self.release_handle(session).await;
                    session.lock().retry_count = retry_count;
                    return AttemptOutcome::Retry;
                }
                Transition::Fail => {
                    tracing::error!(
                        info_hash = %session.info_hash(),
                        error = %error_message(&event),
                        attempts = retry_count + 1,
                        "acquisition failed permanently"
                    );
                    self.release_handle(session).await;
                    return AttemptOutcome::Failed(error_message(&event));
                }
            }
        }
    }

    fn mark_ready(&self, session: &Arc<Session>) {
        let files = Arc::new(session.handle().map(|h| h.files()).unwrap_or_default());
        let generation = self.registry.with_session(session.info_hash(), |_, inner| {
            inner.state = SessionState::Ready;
            inner.files = Some(files.clone());
            inner.retry_count = 0;
            (inner.ref_count == 0).then(|| self.cleanup.mark_idle(inner))
        });
        let Some(generation) = generation else {
            // disposed while the last event was in flight
            return;
        };
        tracing::info!(
            info_hash = %session.info_hash(),
            files = files.len(),
            "metadata received"
        );
        session.publish(SessionStatus::Ready(files));
        if let Some(generation) = generation {
            self.cleanup.schedule(session.info_hash().clone(), generation);
        }
    }

    fn mark_failed(&self, session: &Arc<Session>, reason: String) {
        self.registry.remove(session);
        session.lock().state = SessionState::Failed;
        session.publish(SessionStatus::Failed(reason));
    }

    async fn release_handle(&self, session: &Arc<Session>) {
        let handle = session.lock().handle.take();
        if let Some(handle) = handle {
            handle.dispose().await;
        }
    }
}

async fn next_event(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Option<tokio::time::Instant>,
) -> EngineEvent {
    let received = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(received) => received,
            Err(_) => return EngineEvent::Error("timed out waiting for metadata".to_string()),
        },
        None => events.recv().await,
    };
    received.unwrap_or_else(|| EngineEvent::Error("engine closed event stream".to_string()))
}

fn error_message(event: &EngineEvent) -> String {
    match event {
        EngineEvent::Error(message) | EngineEvent::Warning(message) => message.clone(),
        EngineEvent::MetadataReady => "metadata ready".to_string(),
    }
}
