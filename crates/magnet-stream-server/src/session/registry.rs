//! Identifier → session map.
//!
//! The registry is the only owner of the map. Lock order is always
//! registry map first, then the per-session lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use magnet_stream_types::SessionSummary;

use super::{Session, SessionInner};
use crate::engine::EngineHandle;
use crate::magnet::{InfoHash, MagnetLink};

/// A session removed from the registry together with the handle it still owned.
pub(crate) struct Evicted {
    pub session: Arc<Session>,
    pub handle: Option<Arc<dyn EngineHandle>>,
}

#[derive(Clone, Default)]
pub(crate) struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<InfoHash, Arc<Session>>>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<InfoHash, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Join the live session for this magnet or create a fresh `Pending` one.
    ///
    /// Returns `(session, is_new)`; only the caller that sees `is_new` starts acquisition.
    pub(crate) fn get_or_create(&self, magnet: &MagnetLink) -> (Arc<Session>, bool) {
        let mut map = self.map();
        if let Some(existing) = map.get(&magnet.info_hash) {
            if !existing.lock().disposed {
                return (existing.clone(), false);
            }
        }
        let session = Arc::new(Session::new(magnet.clone()));
        map.insert(magnet.info_hash.clone(), session.clone());
        (session, true)
    }

    pub(crate) fn get(&self, info_hash: &InfoHash) -> Option<Arc<Session>> {
        self.map()
            .get(info_hash)
            .filter(|session| !session.lock().disposed)
            .cloned()
    }

    /// Run `f` with the session locked while the map lock is held.
    ///
    /// Anything done here is atomic with respect to eviction.
    pub(crate) fn with_session<R>(
        &self,
        info_hash: &InfoHash,
        f: impl FnOnce(&Arc<Session>, &mut SessionInner) -> R,
    ) -> Option<R> {
        let map = self.map();
        let session = map.get(info_hash)?;
        let mut inner = session.lock();
        if inner.disposed {
            return None;
        }
        Some(f(session, &mut inner))
    }

    /// Remove `session` if it is still the registered entry for its hash.
    pub(crate) fn remove(&self, session: &Arc<Session>) -> Option<Evicted> {
        self.evict_if(session.info_hash(), |candidate, _| Arc::ptr_eq(candidate, session))
    }

    /// Remove the session for `info_hash` when `predicate` holds, marking it disposed.
    pub(crate) fn evict_if(
        &self,
        info_hash: &InfoHash,
        predicate: impl FnOnce(&Arc<Session>, &SessionInner) -> bool,
    ) -> Option<Evicted> {
        let mut map = self.map();
        let session = map.get(info_hash)?.clone();
        let handle = {
            let mut inner = session.lock();
            if inner.disposed || !predicate(&session, &inner) {
                return None;
            }
            inner.disposed = true;
            inner.handle.take()
        };
        map.remove(info_hash);
        Some(Evicted { session, handle })
    }

    /// Remove every session (shutdown).
    pub(crate) fn drain(&self) -> Vec<Evicted> {
        let mut map = self.map();
        map.drain()
            .map(|(_, session)| {
                let handle = {
                    let mut inner = session.lock();
                    inner.disposed = true;
                    inner.handle.take()
                };
                Evicted { session, handle }
            })
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> =
            self.map().values().map(|session| session.summary()).collect();
        sessions.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        sessions
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use magnet_stream_types::SessionState;

    fn magnet(hash: &str) -> MagnetLink {
        MagnetLink::parse(&format!("magnet:?xt=urn:btih:{hash}")).unwrap()
    }

    #[test]
    fn get_or_create_joins_existing_session() {
        let registry = SessionRegistry::new();
        let (first, first_new) = registry.get_or_create(&magnet("aa11"));
        let (second, second_new) = registry.get_or_create(&magnet("AA11"));
        assert!(first_new);
        assert!(!second_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_session_is_replaced_on_next_create() {
        let registry = SessionRegistry::new();
        let (first, _) = registry.get_or_create(&magnet("bb22"));
        assert!(registry.remove(&first).is_some());
        assert!(first.lock().disposed);
        assert!(registry.get(first.info_hash()).is_none());

        let (second, is_new) = registry.get_or_create(&magnet("bb22"));
        assert!(is_new);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn remove_ignores_stale_session() {
        let registry = SessionRegistry::new();
        let (stale, _) = registry.get_or_create(&magnet("cc33"));
        registry.remove(&stale);
        let (fresh, _) = registry.get_or_create(&magnet("cc33"));
        assert!(registry.remove(&stale).is_none());
        assert!(registry.get(fresh.info_hash()).is_some());
    }

    #[test]
    fn evict_if_respects_predicate() {
        let registry = SessionRegistry::new();
        let (session, _) = registry.get_or_create(&magnet("dd44"));
        let hash = session.info_hash().clone();
        assert!(registry
            .evict_if(&hash, |_, inner| inner.state != SessionState::Pending)
            .is_none());
        assert_eq!(registry.len(), 1);
        session.lock().state = SessionState::Ready;
        assert!(registry
            .evict_if(&hash, |_, inner| inner.state != SessionState::Pending)
            .is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn drain_marks_everything_disposed() {
        let registry = SessionRegistry::new();
        let (a, _) = registry.get_or_create(&magnet("ee55"));
        let (b, _) = registry.get_or_create(&magnet("ff66"));
        assert_eq!(registry.drain().len(), 2);
        assert!(a.lock().disposed && b.lock().disposed);
        assert!(registry.snapshot().is_empty());
    }
}
