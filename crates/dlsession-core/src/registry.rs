//! Session registry - the single source of truth for download state
//!
//! Every session lives in its own slot behind a mutex. The map lock is only
//! taken to insert, unlink or look up a slot, so two gids never contend and
//! all changes to one gid go through [`SessionRegistry::update`].

use crate::error::CoreError;
use dlsession_types::{DownloadSession, Gid, Options, SessionState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct Slot {
    /// Creation rank, used to order `list`
    order: u64,
    session: Mutex<DownloadSession>,
}

/// Map from gid to session state
pub struct SessionRegistry {
    slots: RwLock<HashMap<Gid, Arc<Slot>>>,
    /// Per-registry offset so gids differ between runs
    salt: u64,
    next_order: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_salt(Uuid::new_v4().as_u64_pair().0)
    }

    pub fn with_salt(salt: u64) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            salt,
            next_order: AtomicU64::new(0),
        }
    }

    /// Create a Pending session and return its fresh gid
    pub fn create(&self, source_uri: impl Into<String>, options: Options) -> Gid {
        // `order` is never handed out twice and wrapping_add is a bijection,
        // so a gid is never reused
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let gid = Gid::from_u64(self.salt.wrapping_add(order));
        let slot = Arc::new(Slot {
            order,
            session: Mutex::new(DownloadSession::new(gid.clone(), source_uri.into(), options)),
        });
        self.slots.write().insert(gid.clone(), slot);
        gid
    }

    /// Snapshot of one session
    pub fn get(&self, gid: &Gid) -> Result<DownloadSession, CoreError> {
        self.update(gid, |session| session.clone())
    }

    /// Run `mutator` with the session locked.
    ///
    /// A session already marked Removed is reported as NotFound, even if it
    /// has not been unlinked yet.
    pub fn update<R>(
        &self,
        gid: &Gid,
        mutator: impl FnOnce(&mut DownloadSession) -> R,
    ) -> Result<R, CoreError> {
        let slot = self.slot(gid)?;
        let mut session = slot.session.lock();
        if session.state == SessionState::Removed {
            return Err(CoreError::NotFound(gid.clone()));
        }
        Ok(mutator(&mut session))
    }

    /// Unlink a session from the registry
    pub fn remove(&self, gid: &Gid) -> Result<DownloadSession, CoreError> {
        let slot = self
            .slots
            .write()
            .remove(gid)
            .ok_or_else(|| CoreError::NotFound(gid.clone()))?;
        let session = slot.session.lock().clone();
        Ok(session)
    }

    /// All live sessions, oldest first
    pub fn list(&self) -> Vec<DownloadSession> {
        self.snapshot_where(|_| true)
    }

    /// Live sessions matching `filter`, oldest first
    pub fn snapshot_where(&self, filter: impl Fn(&DownloadSession) -> bool) -> Vec<DownloadSession> {
        let mut slots: Vec<Arc<Slot>> = self.slots.read().values().cloned().collect();
        slots.sort_by_key(|slot| slot.order);

        slots
            .iter()
            .filter_map(|slot| {
                let session = slot.session.lock();
                (session.state != SessionState::Removed && filter(&session)).then(|| session.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    fn slot(&self, gid: &Gid) -> Result<Arc<Slot>, CoreError> {
        self.slots
            .read()
            .get(gid)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(gid.clone()))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_create_assigns_distinct_gids() {
        let registry = SessionRegistry::with_salt(0x2089b05ecca3d800);
        let a = registry.create("http://x/a", Options::new());
        let b = registry.create("http://x/b", Options::new());
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "2089b05ecca3d800");
        assert_eq!(registry.get(&a).unwrap().state, SessionState::Pending);
    }

    #[test]
    fn test_salt_wraps_without_collision() {
        let registry = SessionRegistry::with_salt(u64::MAX);
        let a = registry.create("http://x/a", Options::new());
        let b = registry.create("http://x/b", Options::new());
        assert_eq!(a.as_str(), "ffffffffffffffff");
        assert_eq!(b.as_str(), "0000000000000000");
    }

    #[test]
    fn test_list_is_in_creation_order() {
        let registry = SessionRegistry::new();
        let gids: Vec<Gid> = (0..5)
            .map(|i| registry.create(format!("http://x/{}", i), Options::new()))
            .collect();
        let listed: Vec<Gid> = registry.list().into_iter().map(|s| s.gid).collect();
        assert_eq!(listed, gids);
    }

    #[test]
    fn test_unknown_gid_is_not_found() {
        let registry = SessionRegistry::new();
        let gid = Gid::from("unknown-gid");
        assert!(matches!(registry.get(&gid), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.update(&gid, |_| ()), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.remove(&gid), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_removed_session_is_invisible_before_unlink() {
        let registry = SessionRegistry::new();
        let gid = registry.create("http://x/a", Options::new());
        registry
            .update(&gid, |s| s.set_state(SessionState::Removed))
            .unwrap();

        assert!(matches!(registry.get(&gid), Err(CoreError::NotFound(_))));
        assert!(registry.list().is_empty());
        assert_eq!(registry.len(), 1);

        registry.remove(&gid).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_creates_are_unique() {
        let registry = SessionRegistry::new();
        let gids: Vec<Gid> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let registry = &registry;
                    scope.spawn(move || {
                        (0..100)
                            .map(|i| registry.create(format!("http://x/{}/{}", t, i), Options::new()))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = gids.iter().collect();
        assert_eq!(unique.len(), 800);
        assert_eq!(registry.len(), 800);
    }
}
