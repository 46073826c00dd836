//! Patches and the bounded per-connection patch queue.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{Notify, mpsc};

use crate::scope::lock;

/// One unit of pushed update.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// Serialized HTML to merge into the page, matched by its root id.
    Elements(String),
    /// Changed signal values, keyed by signal id.
    Signals(Map<String, Value>),
    /// Script text for the client to run once.
    Script(String),
}

/// The kind of a [`Patch`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchKind {
    /// See [`Patch::Elements`].
    Elements,
    /// See [`Patch::Signals`].
    Signals,
    /// See [`Patch::Script`].
    Script,
}

impl PatchKind {
    /// Stable lowercase name, used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            PatchKind::Elements => "elements",
            PatchKind::Signals => "signals",
            PatchKind::Script => "script",
        }
    }
}

impl Patch {
    /// The kind of this patch.
    pub fn kind(&self) -> PatchKind {
        match self {
            Patch::Elements(_) => PatchKind::Elements,
            Patch::Signals(_) => PatchKind::Signals,
            Patch::Script(_) => PatchKind::Script,
        }
    }
}

/// Bounded FIFO of patches waiting for the push channel.
///
/// Producers never wait: a full queue drops the patch. Consumers take the
/// receiver lock only for a non-blocking pop and wait on a notification in
/// between, so a stalled consumer never holds back a newer one. The queue
/// survives push-channel reconnects.
#[derive(Debug)]
pub(crate) struct PatchQueue {
    tx: mpsc::Sender<Patch>,
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    rx: Mutex<mpsc::Receiver<Patch>>,
    ready: Notify,
}

impl Shared {
    fn try_pop(&self) -> Option<Patch> {
        lock(&self.rx).try_recv().ok()
    }
}

impl PatchQueue {
    /// Create a queue holding at most `capacity` patches (minimum 1).
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            shared: Arc::new(Shared {
                rx: Mutex::new(rx),
                ready: Notify::new(),
            }),
        }
    }

    /// Enqueue without blocking.
    ///
    /// # Returns
    ///
    /// `true` if the patch was queued, `false` if it was dropped because the
    /// queue is full.
    pub(crate) fn push(&self, connection_id: &str, patch: Patch) -> bool {
        match self.tx.try_send(patch) {
            Ok(()) => {
                self.shared.ready.notify_waiters();
                true
            }
            Err(mpsc::error::TrySendError::Full(patch)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    kind = patch.kind().as_str(),
                    "patch queue full, dropping patch"
                );
                false
            }
            // The receiver lives as long as the queue itself, so this only
            // happens while the connection is being torn down.
            Err(mpsc::error::TrySendError::Closed(patch)) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    kind = patch.kind().as_str(),
                    "patch queue closed, dropping patch"
                );
                false
            }
        }
    }

    /// A waiting handle on the receiving end, for one push channel.
    pub(crate) fn reader(&self) -> QueueReader {
        QueueReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Pop a patch if one is ready.
    pub(crate) fn try_pop(&self) -> Option<Patch> {
        self.shared.try_pop()
    }
}

/// Receiving handle held by a push channel.
pub(crate) struct QueueReader {
    shared: Arc<Shared>,
}

impl QueueReader {
    /// Wait for the next patch.
    ///
    /// Cancel safe: a patch is only removed from the queue in the same poll
    /// that returns it.
    pub(crate) async fn recv(&self) -> Patch {
        loop {
            let ready = self.shared.ready.notified();
            tokio::pin!(ready);
            // Register before checking so a push in between still wakes us.
            ready.as_mut().enable();
            if let Some(patch) = self.shared.try_pop() {
                return patch;
            }
            ready.await;
        }
    }
}
