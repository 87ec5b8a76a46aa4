//! Shared application state.
//!
//! Holds the session manager and the range streamer built on top of it.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::engine::TransferEngine;
use crate::range_stream::RangeStreamServer;
use crate::session::SessionManager;

pub(crate) struct AppState {
    pub(crate) sessions: SessionManager,
    pub(crate) streamer: RangeStreamServer,
}

impl AppState {
    pub(crate) fn new(engine: Arc<dyn TransferEngine>, config: SessionConfig) -> Self {
        let sessions = SessionManager::new(engine, config);
        let streamer = RangeStreamServer::new(sessions.refs().clone());
        Self { sessions, streamer }
    }
}
