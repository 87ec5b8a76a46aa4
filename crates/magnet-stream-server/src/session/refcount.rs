//! Per-session consumer stream counting.

use magnet_stream_types::SessionState;

use super::cleanup::CleanupScheduler;
use super::registry::SessionRegistry;
use crate::error::SessionError;
use crate::magnet::InfoHash;

#[derive(Clone)]
pub(crate) struct StreamRefCounter {
    registry: SessionRegistry,
    cleanup: CleanupScheduler,
}

impl StreamRefCounter {
    pub(crate) fn new(registry: SessionRegistry, cleanup: CleanupScheduler) -> Self {
        Self { registry, cleanup }
    }

    /// Register one more open stream on a ready session.
    ///
    /// The returned lease performs the matching decrement when released or dropped.
    pub(crate) fn increment(&self, info_hash: &InfoHash) -> Result<StreamLease, SessionError> {
        self.registry
            .with_session(info_hash, |_, inner| {
                if inner.state != SessionState::Ready {
                    return Err(SessionError::SessionNotReady);
                }
                inner.ref_count += 1;
                inner.idle_generation += 1;
                inner.last_idle_at = None;
                Ok(inner.ref_count)
            })
            .unwrap_or(Err(SessionError::SessionNotFound))
            .map(|ref_count| {
                tracing::debug!(info_hash = %info_hash, ref_count, "stream opened");
                StreamLease {
                    counter: self.clone(),
                    info_hash: info_hash.clone(),
                    released: false,
                }
            })
    }

    /// Drop one open stream; reaching zero arms the cleanup check.
    pub(crate) fn decrement(&self, info_hash: &InfoHash) {
        let idle_generation = self
            .registry
            .with_session(info_hash, |_, inner| {
                if inner.ref_count == 0 {
                    tracing::warn!(info_hash = %info_hash, "decrement at zero ignored");
                    return None;
                }
                inner.ref_count -= 1;
                tracing::debug!(info_hash = %info_hash, ref_count = inner.ref_count, "stream closed");
                (inner.ref_count == 0).then(|| self.cleanup.mark_idle(inner))
            })
            .flatten();
        if let Some(generation) = idle_generation {
            self.cleanup.schedule(info_hash.clone(), generation);
        }
    }
}

/// One open stream's claim on a session.
pub(crate) struct StreamLease {
    counter: StreamRefCounter,
    info_hash: InfoHash,
    released: bool,
}

impl StreamLease {
    pub(crate) fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    /// Release now instead of on drop. Idempotent.
    pub(crate) fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.counter.decrement(&self.info_hash);
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::mock::{Attempt, MockEngine, MockFile};
    use crate::magnet::MagnetLink;
    use crate::session::SessionManager;

    fn magnet() -> MagnetLink {
        MagnetLink::parse("magnet:?xt=urn:btih:1111222233334444555566667777888899990000").unwrap()
    }

    fn ref_count(sessions: &SessionManager) -> usize {
        sessions
            .registry()
            .with_session(&magnet().info_hash, |_, inner| inner.ref_count)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn leases_balance_increments() {
        let engine = Arc::new(MockEngine::new(vec![], vec![MockFile::new("a.mp4", 100)]));
        let sessions = SessionManager::new(engine, SessionConfig::default());
        sessions.add(magnet()).await.unwrap();
        let hash = magnet().info_hash;

        let mut first = sessions.refs().increment(&hash).unwrap();
        let second = sessions.refs().increment(&hash).unwrap();
        assert_eq!(ref_count(&sessions), 2);

        first.release();
        first.release();
        assert_eq!(ref_count(&sessions), 1);
        drop(first);
        assert_eq!(ref_count(&sessions), 1);
        drop(second);
        assert_eq!(ref_count(&sessions), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn decrement_at_zero_is_guarded() {
        let engine = Arc::new(MockEngine::new(vec![], vec![MockFile::new("a.mp4", 100)]));
        let sessions = SessionManager::new(engine, SessionConfig::default());
        sessions.add(magnet()).await.unwrap();
        sessions.refs().decrement(&magnet().info_hash);
        assert_eq!(ref_count(&sessions), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn increment_requires_ready_session() {
        let engine = Arc::new(
            MockEngine::new(vec![Attempt::Silent], vec![MockFile::new("a.mp4", 100)])
                .with_event_delay(Duration::from_millis(1)),
        );
        let sessions = SessionManager::new(engine, SessionConfig::default());
        let hash = magnet().info_hash;
        assert!(matches!(
            sessions.refs().increment(&hash),
            Err(SessionError::SessionNotFound)
        ));

        let pending = tokio::spawn({
            let sessions = sessions.clone();
            async move { sessions.add(magnet()).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            sessions.refs().increment(&hash),
            Err(SessionError::SessionNotReady)
        ));
        pending.abort();
    }
}
