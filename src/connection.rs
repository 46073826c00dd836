//! The per-tab runtime: connection-scope storage, patch queue, push channel.
//!
//! A [`Connection`] is created when a page is first rendered for a tab and
//! lives in the [`SessionRegistry`](crate::SessionRegistry) until the tab
//! closes or its TTL elapses. All connection-scope data sits in one
//! [`Tab`] behind the dispatch lock, so signal injection, handler execution
//! and sync for the same tab never interleave.
//!
//! The push channel is a stream over the patch queue (see
//! [`Connection::patches`]). Only one stream drains a queue at a time; a
//! reconnecting client supersedes the previous stream, and closing the
//! connection ends it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;

use crate::composition::Composition;
use crate::patch::{Patch, PatchQueue, QueueReader};
use crate::scope::{Scope, lock};

/// Which kind of code is currently running against a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Nothing is running.
    Idle,
    /// The initial page view is rendering. Reads only.
    View,
    /// An action handler is running. Mutations and syncs allowed.
    Action,
}

/// Connection-scope storage plus sync bookkeeping, guarded by the
/// connection's dispatch lock.
#[derive(Debug)]
pub(crate) struct Tab {
    pub(crate) values: HashMap<String, Value>,
    pub(crate) signals: HashMap<String, Value>,
    /// Signals written since the last sync, ordered for stable patches.
    pub(crate) changed: BTreeSet<String>,
    pub(crate) mode: Mode,
}

impl Tab {
    /// Seed a tab from the composition's declared initial values.
    pub(crate) fn seeded(composition: &Composition) -> Self {
        let values = composition
            .states()
            .iter()
            .filter(|s| s.scope == Scope::Connection)
            .map(|s| (s.key.clone(), s.initial.clone()))
            .collect();
        let signals = composition
            .signals()
            .iter()
            .map(|s| (s.key.clone(), s.initial.clone()))
            .collect();
        Self {
            values,
            signals,
            changed: BTreeSet::new(),
            mode: Mode::Idle,
        }
    }
}

/// Push channel lifecycle. Each subscriber owns one generation and stops
/// as soon as the value moves past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Open(u64),
    Closed,
}

/// Runtime for one open tab.
pub struct Connection {
    id: String,
    session_id: Option<String>,
    composition: Arc<Composition>,
    tab: Mutex<Tab>,
    queue: PatchQueue,
    last_access: Mutex<Instant>,
    channel: watch::Sender<Channel>,
}

// Manual `Debug` to keep tab contents and queue internals out of logs.
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("composition", &self.composition.id())
            .finish()
    }
}

impl Connection {
    /// Create a runtime seeded from `composition`.
    ///
    /// # Arguments
    ///
    /// * `id` - Connection id, unique per tab.
    /// * `session_id` - Browsing session this tab belongs to, if any.
    /// * `composition` - The page the tab was opened on.
    /// * `queue_capacity` - Maximum number of undelivered patches.
    pub(crate) fn new(
        id: String,
        session_id: Option<String>,
        composition: Arc<Composition>,
        queue_capacity: usize,
    ) -> Self {
        let tab = Tab::seeded(&composition);
        let (channel, _) = watch::channel(Channel::Open(0));
        Self {
            id,
            session_id,
            composition,
            tab: Mutex::new(tab),
            queue: PatchQueue::new(queue_capacity),
            last_access: Mutex::new(Instant::now()),
            channel,
        }
    }

    /// The connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session this tab belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The page this tab was opened on.
    pub fn composition(&self) -> &Arc<Composition> {
        &self.composition
    }

    /// When the tab was last seen.
    pub fn last_access(&self) -> Instant {
        *lock(&self.last_access)
    }

    /// Refresh the last access time to now.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = lock(&self.last_access);
        if now > *last {
            *last = now;
        }
    }

    /// Returns `true` once the connection has been closed or swept.
    pub fn is_closed(&self) -> bool {
        *self.channel.borrow() == Channel::Closed
    }

    /// Open the push channel.
    ///
    /// Returns a stream yielding patches in enqueue order. The stream ends
    /// when the connection is closed or when a newer call to `patches`
    /// supersedes it. Dropping the stream (client disconnect) releases the
    /// queue for the next subscriber; undelivered patches stay queued.
    pub fn patches(&self) -> BoxStream<'static, Patch> {
        let mut generation = 0;
        self.channel.send_if_modified(|state| match state {
            Channel::Open(g) => {
                *g += 1;
                generation = *g;
                true
            }
            Channel::Closed => false,
        });
        if generation == 0 {
            return futures::stream::empty().boxed();
        }

        let drain = Drain {
            queue: self.queue.reader(),
            channel: self.channel.subscribe(),
            generation,
        };
        futures::stream::unfold(drain, |mut drain| async move {
            let patch = drain.next().await?;
            Some((patch, drain))
        })
        .boxed()
    }

    /// Pop the next queued patch without waiting.
    ///
    /// Returns `None` if the queue is empty. Competes with an open push
    /// channel for patches.
    pub fn try_recv_patch(&self) -> Option<Patch> {
        self.queue.try_pop()
    }

    /// Enqueue a patch, dropping it if the queue is full.
    pub(crate) fn enqueue(&self, patch: Patch) -> bool {
        self.queue.push(&self.id, patch)
    }

    /// Take the dispatch lock.
    pub(crate) fn lock_tab(&self) -> MutexGuard<'_, Tab> {
        lock(&self.tab)
    }

    /// Mark the connection closed and end its push channel.
    pub(crate) fn shutdown(&self) {
        self.channel.send_replace(Channel::Closed);
    }
}

/// State carried by the push channel stream between items.
struct Drain {
    queue: QueueReader,
    channel: watch::Receiver<Channel>,
    generation: u64,
}

impl Drain {
    async fn next(&mut self) -> Option<Patch> {
        tokio::select! {
            biased;
            _ = superseded(&mut self.channel, self.generation) => None,
            patch = self.queue.recv() => Some(patch),
        }
    }
}

/// Resolves once the channel has moved past `generation` or its sender is
/// gone.
async fn superseded(channel: &mut watch::Receiver<Channel>, generation: u64) {
    let _ = channel
        .wait_for(|state| *state != Channel::Open(generation))
        .await;
}
