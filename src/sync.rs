//! Turning tab state into patches.
//!
//! A sync renders the target view under the current state and enqueues an
//! element patch, then a signal patch with whatever signals changed since
//! the last sync. Every operation here is rejected outside an action
//! handler.

use serde_json::Map;

use crate::composition::ComponentRef;
use crate::connection::{Connection, Tab};
use crate::context::ViewContext;
use crate::patch::Patch;
use crate::render::{Render, wrap_root};
use crate::scope::Scopes;
use crate::store::in_action;

/// What a sync re-renders: the whole page, or the component that owns the
/// running action.
#[derive(Debug, Clone)]
pub(crate) enum SyncTarget {
    Page,
    Component(ComponentRef),
}

impl SyncTarget {
    /// The target for `action_id` on `connection`'s page.
    pub(crate) fn for_action(connection: &Connection, action_id: &str) -> Self {
        match connection.composition().owner(action_id) {
            Some(owner) => SyncTarget::Component(owner.clone()),
            None => SyncTarget::Page,
        }
    }
}

/// Render the whole page for `connection`, wrapped in the page root.
pub(crate) fn render_page(tab: &Tab, connection: &Connection, scopes: &Scopes) -> String {
    let ctx = ViewContext::new(tab, connection, scopes);
    let composition = connection.composition();
    wrap_root(composition.id(), &(composition.view_fn())(&ctx))
}

/// Re-render `target` and enqueue it, then flush changed signals.
///
/// Returns `false` if rejected outside an action handler.
pub(crate) fn sync(
    tab: &mut Tab,
    connection: &Connection,
    scopes: &Scopes,
    target: &SyncTarget,
) -> bool {
    if !in_action(tab, connection, "sync") {
        return false;
    }
    let html = match target {
        SyncTarget::Page => render_page(tab, connection, scopes),
        SyncTarget::Component(component) => {
            component.render(&ViewContext::new(tab, connection, scopes))
        }
    };
    tracing::debug!(
        connection_id = %connection.id(),
        bytes = html.len(),
        "sync"
    );
    connection.enqueue(Patch::Elements(html));
    flush_signals(tab, connection);
    true
}

/// Enqueue a handler-rendered fragment, then flush changed signals.
pub(crate) fn sync_fragment(tab: &mut Tab, connection: &Connection, fragment: &dyn Render) -> bool {
    if !in_action(tab, connection, "sync_fragment") {
        return false;
    }
    let html = String::from_utf8_lossy(&fragment.render()).into_owned();
    connection.enqueue(Patch::Elements(html));
    flush_signals(tab, connection);
    true
}

/// Flush changed signals without rendering.
pub(crate) fn sync_signals(tab: &mut Tab, connection: &Connection) -> bool {
    if !in_action(tab, connection, "sync_signals") {
        return false;
    }
    flush_signals(tab, connection);
    true
}

/// Enqueue a script for the client to run once.
pub(crate) fn execute_script(tab: &mut Tab, connection: &Connection, script: String) -> bool {
    if !in_action(tab, connection, "execute_script") {
        return false;
    }
    connection.enqueue(Patch::Script(script));
    true
}

/// Enqueue a signal patch for every signal written since the last flush,
/// then reset the changed set. Nothing is enqueued if nothing changed.
fn flush_signals(tab: &mut Tab, connection: &Connection) {
    if tab.changed.is_empty() {
        return;
    }
    let changed = std::mem::take(&mut tab.changed);
    let patch: Map<_, _> = changed
        .into_iter()
        .filter_map(|key| {
            let value = tab.signals.get(&key)?.clone();
            Some((key, value))
        })
        .collect();
    connection.enqueue(Patch::Signals(patch));
}
