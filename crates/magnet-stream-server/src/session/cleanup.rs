//! Deferred eviction of idle sessions.
//!
//! Timers are never cancelled individually. Each arm bumps the session's idle
//! generation, and a check only evicts when the generation it captured is still
//! current and nobody is streaming.

use std::time::Duration;

use magnet_stream_types::SessionState;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;
use super::SessionInner;
use crate::magnet::InfoHash;

#[derive(Clone)]
pub(crate) struct CleanupScheduler {
    registry: SessionRegistry,
    delay: Duration,
    cancel: CancellationToken,
}

impl CleanupScheduler {
    pub(crate) fn new(registry: SessionRegistry, delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            registry,
            delay,
            cancel,
        }
    }

    /// Record an idle transition on a locked session; returns the generation to check.
    pub(crate) fn mark_idle(&self, inner: &mut SessionInner) -> u64 {
        inner.idle_generation += 1;
        inner.last_idle_at = Some(Instant::now());
        inner.idle_generation
    }

    /// Schedule the check for an already recorded idle generation.
    pub(crate) fn schedule(&self, info_hash: InfoHash, generation: u64) {
        // lease drops can happen after the runtime is gone during process exit
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scheduler.cancel.cancelled() => {}
                _ = tokio::time::sleep(scheduler.delay) => {
                    scheduler.check(&info_hash, generation).await;
                }
            }
        });
    }

    /// Evict the session if it stayed idle since `generation` was recorded.
    pub(crate) async fn check(&self, info_hash: &InfoHash, generation: u64) -> bool {
        let evicted = self.registry.evict_if(info_hash, |_, inner| {
            inner.state != SessionState::Pending
                && inner.ref_count == 0
                && inner.idle_generation == generation
        });
        let Some(evicted) = evicted else {
            tracing::debug!(info_hash = %info_hash, generation, "cleanup check superseded");
            return false;
        };
        tracing::info!(
            info_hash = %info_hash,
            idle_ms = self.delay.as_millis() as u64,
            "removing inactive torrent"
        );
        if let Some(handle) = evicted.handle {
            handle.dispose().await;
        }
        true
    }
}
