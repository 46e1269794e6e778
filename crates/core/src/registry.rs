//! Which sessions are backed by a live agent subprocess right now.
//! Owned by whoever builds the launcher and the source factory; cloned into
//! both. There is no process-wide instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use agent_trail_types::SessionId;

#[derive(Debug, Default)]
struct Inner {
    active: HashSet<SessionId>,
    /// Placeholder (or otherwise superseded) id → the id it was rekeyed to.
    aliases: HashMap<SessionId, SessionId>,
}

/// Cloneable handle over the shared active-session set.
#[derive(Debug, Clone, Default)]
pub struct ActiveSessionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ActiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId) {
        tracing::debug!(session_id = %id, "Registering active session");
        self.write().active.insert(id);
    }

    /// Forget `id` and any alias that points at it.
    pub fn unregister(&self, id: &SessionId) {
        let mut inner = self.write();
        inner.active.remove(id);
        inner.aliases.retain(|old, new| new != id && old != id);
        tracing::debug!(session_id = %id, "Unregistered session");
    }

    /// Active under `id` itself, or under the id it was rekeyed to.
    pub fn is_active(&self, id: &SessionId) -> bool {
        let inner = self.read();
        if inner.active.contains(id) {
            return true;
        }
        inner
            .aliases
            .get(id)
            .is_some_and(|target| inner.active.contains(target))
    }

    /// Move an active entry from `old` to `new`. Lookups under `old` keep
    /// working until `new` is unregistered.
    pub fn rekey(&self, old: &SessionId, new: SessionId) {
        if old == &new {
            return;
        }
        let mut inner = self.write();
        let was_active = inner.active.remove(old);
        if was_active {
            inner.active.insert(new.clone());
        }
        // Anything aliased to `old` now follows `new`.
        for target in inner.aliases.values_mut() {
            if target == old {
                *target = new.clone();
            }
        }
        tracing::info!(from = %old, to = %new, was_active, "Rekeyed session");
        inner.aliases.insert(old.clone(), new);
    }

    /// Resolve an alias to the id it currently maps to.
    pub fn canonical(&self, id: &SessionId) -> SessionId {
        self.read().aliases.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.read().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock leaves the set itself intact.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
