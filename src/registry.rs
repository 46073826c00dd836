//! Process-wide table of live connections and its expiry sweeper.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::composition::Composition;
use crate::connection::Connection;
use crate::scope::{Scopes, read, write};

/// Shortest interval between two background sweeps.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections idle for longer than the connection TTL.
    pub connections: usize,
    /// Sessions idle for longer than the session window.
    pub sessions: usize,
    /// Invalidated session ids whose rejection window has passed.
    pub invalidated: usize,
}

/// Maps connection ids to their runtimes.
///
/// Lookups of unknown or expired ids return `None`; callers treat that as
/// an expired tab, never as a failure.
pub struct SessionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    scopes: Scopes,
    queue_capacity: usize,
    session_ttl: Duration,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("connections", &self.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("session_ttl", &self.session_ttl)
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `scopes` - Shared scope containers handed to every dispatch.
    /// * `queue_capacity` - Patch queue bound for each new connection.
    /// * `session_ttl` - Idle window after which session data and
    ///   invalidated ids are swept.
    pub fn new(scopes: Scopes, queue_capacity: usize, session_ttl: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            scopes,
            queue_capacity,
            session_ttl,
        }
    }

    /// The shared scopes used by connections in this registry.
    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Create and register a runtime for a new tab.
    ///
    /// An existing entry with the same id is replaced and closed.
    pub fn create_connection(
        &self,
        connection_id: &str,
        session_id: Option<&str>,
        composition: Arc<Composition>,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(
            connection_id.to_owned(),
            session_id.map(str::to_owned),
            composition,
            self.queue_capacity,
        ));
        let replaced =
            write(&self.connections).insert(connection_id.to_owned(), Arc::clone(&connection));
        if let Some(old) = replaced {
            tracing::warn!(connection_id = %connection_id, "replacing existing connection");
            old.shutdown();
        }
        tracing::debug!(
            connection_id = %connection_id,
            session_id = session_id.unwrap_or(""),
            page = connection.composition().id(),
            "connection created"
        );
        connection
    }

    /// Look up a live connection.
    pub fn lookup(&self, connection_id: &str) -> Option<Arc<Connection>> {
        read(&self.connections).get(connection_id).cloned()
    }

    /// Refresh the last access time of a connection and its session.
    ///
    /// # Returns
    ///
    /// `false` if the connection is unknown.
    pub fn touch(&self, connection_id: &str) -> bool {
        let Some(connection) = self.lookup(connection_id) else {
            return false;
        };
        connection.touch();
        if let Some(session) = connection.session_id() {
            self.scopes.sessions.touch(session);
        }
        true
    }

    /// Remove a connection immediately and end its push channel.
    ///
    /// # Returns
    ///
    /// `false` if the connection was already gone.
    pub fn close(&self, connection_id: &str) -> bool {
        let removed = write(&self.connections).remove(connection_id);
        match removed {
            Some(connection) => {
                connection.shutdown();
                tracing::debug!(connection_id = %connection_id, "connection closed");
                true
            }
            None => {
                tracing::debug!(connection_id = %connection_id, "close for unknown connection");
                false
            }
        }
    }

    /// Sweep against the current time. See
    /// [`sweep_expired_at`](SessionRegistry::sweep_expired_at).
    pub fn sweep_expired(&self, ttl: Duration) -> SweepReport {
        self.sweep_expired_at(Instant::now(), ttl)
    }

    /// Remove every connection whose last access is more than `ttl` before
    /// `now`, then sweep session data and invalidated ids on the session
    /// window.
    ///
    /// Expired push channels are ended after the registry lock is released.
    pub fn sweep_expired_at(&self, now: Instant, ttl: Duration) -> SweepReport {
        let expired: Vec<Arc<Connection>> = {
            let mut map = write(&self.connections);
            let ids: Vec<String> = map
                .iter()
                .filter(|(_, c)| now.saturating_duration_since(c.last_access()) > ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        for connection in &expired {
            connection.shutdown();
        }

        let (sessions, invalidated) = self.scopes.sessions.sweep_at(now, self.session_ttl);
        let report = SweepReport {
            connections: expired.len(),
            sessions,
            invalidated,
        };
        if report != SweepReport::default() {
            tracing::info!(
                connections = report.connections,
                sessions = report.sessions,
                invalidated = report.invalidated,
                "swept expired entries"
            );
        }
        report
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        read(&self.connections).len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background sweeper on the current tokio runtime.
    ///
    /// Sweeps run every `ttl / 10`, so an idle tab is gone at most about
    /// `1.1 * ttl` after its last access.
    pub fn start_sweeper(self: &Arc<Self>, ttl: Duration) -> SweeperHandle {
        let period = (ttl / 10).max(MIN_SWEEP_PERIOD);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_expired(ttl);
                    }
                    // A send or every handle dropped: stop either way.
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("sweeper stopped");
        });
        tracing::debug!(?period, ?ttl, "sweeper started");
        SweeperHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Controls a running sweeper.
///
/// `Clone` is cheap. The sweeper stops on [`shutdown`](SweeperHandle::shutdown)
/// or once every clone has been dropped.
#[derive(Debug, Clone)]
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its task to exit.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the sweeper task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| io::Error::other(format!("sweeper task failed: {e}"))),
            None => Ok(()),
        }
    }
}
