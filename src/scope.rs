//! Scope classes and the shared (session and application) containers.
//!
//! Connection-scope values live inside each [`Connection`](crate::Connection)
//! and are guarded by that connection's dispatch lock. The two shared scopes
//! live here: one [`SharedScope`] for the whole application and one per
//! browsing session inside [`SessionScopes`]. Each map has its own
//! reader/writer lock so that traffic on one session never serializes
//! behind another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a declared state value lives and who shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Private to one tab.
    #[default]
    Connection,
    /// Shared by every tab carrying the same session cookie.
    Session,
    /// Shared by every tab in the process.
    Application,
}

// Handlers run under `catch_unwind`, so a panic may leave a lock poisoned.
// The maps hold plain values that are never left half-written, so the
// guard is recovered instead of propagating the poison.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A key/value map shared across connections behind a reader/writer lock.
#[derive(Debug, Default)]
pub struct SharedScope {
    values: RwLock<HashMap<String, Value>>,
}

impl SharedScope {
    /// Read the raw stored value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.values).get(key).cloned()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&self, key: &str, value: Value) {
        write(&self.values).insert(key.to_owned(), value);
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        read(&self.values).len()
    }

    /// Returns `true` if nothing has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One browsing session's values plus its last activity time.
#[derive(Debug)]
struct SessionEntry {
    values: SharedScope,
    last_access: Mutex<Instant>,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            values: SharedScope::default(),
            last_access: Mutex::new(now),
        }
    }

    fn touch(&self, now: Instant) {
        let mut last = lock(&self.last_access);
        if now > *last {
            *last = now;
        }
    }

    fn expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(*lock(&self.last_access)) > ttl
    }
}

/// Outcome of resolving a session cookie on page load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    /// The session id to use for the new tab.
    pub id: String,
    /// `true` if `id` was minted here and must be sent back as a cookie.
    pub minted: bool,
}

/// Session-scope storage for every live browsing session.
///
/// Sessions are keyed by the durable cookie id. Logged-out ids are moved to
/// an invalidation list and stay there until their own expiry window has
/// passed, so a cookie that is still sitting in a browser cannot bring the
/// cleared data back.
#[derive(Debug, Default)]
pub struct SessionScopes {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    invalidated: RwLock<HashMap<String, Instant>>,
}

impl SessionScopes {
    /// Resolve the session id a page load should use.
    ///
    /// A present, non-invalidated cookie is reused (and its entry created or
    /// refreshed). An absent or invalidated cookie mints a fresh id.
    ///
    /// # Arguments
    ///
    /// * `cookie` - The session cookie value sent by the browser, if any.
    ///
    /// # Returns
    ///
    /// The [`ResolvedSession`] with the id and whether it was minted.
    pub fn resolve(&self, cookie: Option<&str>) -> ResolvedSession {
        let now = Instant::now();
        if let Some(id) = cookie.map(str::trim).filter(|id| !id.is_empty()) {
            if self.is_invalidated(id) {
                tracing::info!(session_id = %id, "invalidated session cookie presented, minting a new session");
            } else {
                self.entry_or_insert(id, now).touch(now);
                return ResolvedSession {
                    id: id.to_owned(),
                    minted: false,
                };
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        self.entry_or_insert(&id, now);
        tracing::debug!(session_id = %id, "minted session");
        ResolvedSession { id, minted: true }
    }

    /// Read the raw value for `key` in session `session_id`.
    ///
    /// Returns `None` for unknown or invalidated sessions.
    pub fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        if self.is_invalidated(session_id) {
            return None;
        }
        let entry = read(&self.sessions).get(session_id).cloned()?;
        entry.values.get(key)
    }

    /// Store `value` under `key` in session `session_id`.
    ///
    /// A session that was swept while one of its tabs stayed open is
    /// recreated on write.
    ///
    /// # Returns
    ///
    /// `false` if the session has been invalidated and the write was
    /// dropped; `true` otherwise.
    pub fn set(&self, session_id: &str, key: &str, value: Value) -> bool {
        // Held across the write so `invalidate` cannot land in between.
        let invalidated = read(&self.invalidated);
        if invalidated.contains_key(session_id) {
            return false;
        }
        self.entry_or_insert(session_id, Instant::now())
            .values
            .set(key, value);
        true
    }

    /// Refresh the last activity time of `session_id`, if it exists.
    pub fn touch(&self, session_id: &str) {
        if let Some(entry) = read(&self.sessions).get(session_id) {
            entry.touch(Instant::now());
        }
    }

    /// Drop all data for `session_id` and refuse the id from now on.
    ///
    /// Used on logout. The id stays refused until [`sweep_at`] finds its
    /// invalidation older than the session window.
    ///
    /// [`sweep_at`]: SessionScopes::sweep_at
    pub fn invalidate(&self, session_id: &str) {
        // Refuse the id first; `set` checks it under the same lock.
        write(&self.invalidated).insert(session_id.to_owned(), Instant::now());
        write(&self.sessions).remove(session_id);
        tracing::info!(session_id = %session_id, "session invalidated");
    }

    /// Returns `true` if `session_id` was invalidated and has not yet aged out.
    pub fn is_invalidated(&self, session_id: &str) -> bool {
        read(&self.invalidated).contains_key(session_id)
    }

    /// Returns `true` if `session_id` currently has an entry.
    pub fn contains(&self, session_id: &str) -> bool {
        read(&self.sessions).contains_key(session_id)
    }

    /// Number of live session entries.
    pub fn len(&self) -> usize {
        read(&self.sessions).len()
    }

    /// Returns `true` if there are no live session entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove sessions idle for longer than `ttl`, and forget invalidations
    /// older than `ttl`.
    ///
    /// # Returns
    ///
    /// `(sessions_removed, invalidations_removed)`.
    pub(crate) fn sweep_at(&self, now: Instant, ttl: Duration) -> (usize, usize) {
        let sessions = {
            let mut map = write(&self.sessions);
            let before = map.len();
            map.retain(|_, entry| !entry.expired(now, ttl));
            before - map.len()
        };
        let invalidated = {
            let mut map = write(&self.invalidated);
            let before = map.len();
            map.retain(|_, at| now.saturating_duration_since(*at) <= ttl);
            before - map.len()
        };
        (sessions, invalidated)
    }

    fn entry_or_insert(&self, session_id: &str, now: Instant) -> Arc<SessionEntry> {
        if let Some(entry) = read(&self.sessions).get(session_id) {
            return Arc::clone(entry);
        }
        let mut map = write(&self.sessions);
        Arc::clone(
            map.entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(SessionEntry::new(now))),
        )
    }
}

/// The two shared scope containers, passed by reference into every
/// execution context.
///
/// `Clone` is cheap; both containers are `Arc`-wrapped. Tests inject fresh
/// containers through [`AppBuilder::scopes`](crate::AppBuilder::scopes).
#[derive(Debug, Clone, Default)]
pub struct Scopes {
    pub(crate) application: Arc<SharedScope>,
    pub(crate) sessions: Arc<SessionScopes>,
}

impl Scopes {
    /// The process-wide application scope.
    pub fn application(&self) -> &SharedScope {
        &self.application
    }

    /// Session scopes keyed by session id.
    pub fn sessions(&self) -> &SessionScopes {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shared_scope_set_then_get() {
        let scope = SharedScope::default();
        assert!(scope.is_empty());
        scope.set("visits", json!(3));
        assert_eq!(scope.get("visits"), Some(json!(3)));
        assert_eq!(scope.get("missing"), None);
    }

    #[test]
    fn resolve_without_cookie_mints_new_id() {
        let sessions = SessionScopes::default();
        let a = sessions.resolve(None);
        let b = sessions.resolve(None);
        assert!(a.minted && b.minted);
        assert_ne!(a.id, b.id);
        assert!(sessions.contains(&a.id));
    }

    #[test]
    fn resolve_reuses_known_cookie() {
        let sessions = SessionScopes::default();
        let first = sessions.resolve(None);
        let again = sessions.resolve(Some(&first.id));
        assert_eq!(again.id, first.id);
        assert!(!again.minted);
    }

    #[test]
    fn resolve_blank_cookie_mints() {
        let sessions = SessionScopes::default();
        assert!(sessions.resolve(Some("  ")).minted);
    }

    #[test]
    fn values_are_isolated_per_session() {
        let sessions = SessionScopes::default();
        assert!(sessions.set("s1", "user", json!("ada")));
        assert_eq!(sessions.get("s1", "user"), Some(json!("ada")));
        assert_eq!(sessions.get("s2", "user"), None);
    }

    #[test]
    fn invalidated_session_refuses_reads_writes_and_cookie() {
        let sessions = SessionScopes::default();
        let s = sessions.resolve(None);
        sessions.set(&s.id, "user", json!("ada"));

        sessions.invalidate(&s.id);

        assert_eq!(sessions.get(&s.id, "user"), None);
        assert!(!sessions.set(&s.id, "user", json!("eve")));
        let next = sessions.resolve(Some(&s.id));
        assert!(next.minted);
        assert_ne!(next.id, s.id);
    }

    #[test]
    fn concurrent_writes_cannot_revive_an_invalidated_session() {
        let sessions = Arc::new(SessionScopes::default());
        let s = sessions.resolve(None);

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let sessions = Arc::clone(&sessions);
                let id = s.id.clone();
                std::thread::spawn(move || {
                    let mut n = 0i64;
                    while sessions.set(&id, &format!("k{i}"), json!(n)) {
                        n += 1;
                        std::thread::yield_now();
                    }
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(5));
        sessions.invalidate(&s.id);
        for writer in writers {
            writer.join().expect("writer thread should not panic");
        }

        assert!(!sessions.contains(&s.id));
        assert_eq!(sessions.get(&s.id, "k0"), None);
    }

    #[test]
    fn sweep_removes_idle_sessions_and_old_invalidations() {
        let sessions = SessionScopes::default();
        let live = sessions.resolve(None);
        let dead = sessions.resolve(None);
        sessions.invalidate(&dead.id);

        let ttl = Duration::from_secs(60);
        assert_eq!(sessions.sweep_at(Instant::now(), ttl), (0, 0));

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(sessions.sweep_at(later, ttl), (1, 1));
        assert!(!sessions.contains(&live.id));
        assert!(!sessions.is_invalidated(&dead.id));
    }

    #[test]
    fn swept_session_is_recreated_on_write() {
        let sessions = SessionScopes::default();
        let s = sessions.resolve(None);
        sessions.sweep_at(Instant::now() + Duration::from_secs(10), Duration::from_secs(1));
        assert!(!sessions.contains(&s.id));
        assert!(sessions.set(&s.id, "k", json!(1)));
        assert_eq!(sessions.get(&s.id, "k"), Some(json!(1)));
    }
}
