//! Handles passed to view functions and action handlers.
//!
//! Views get a read-only [`ViewContext`]. Handlers get an [`ActionContext`],
//! the only way to mutate state, write signals, and push patches. Both are
//! borrowed from the connection's dispatch lock, so nothing else touches
//! the tab while they exist.

use serde_json::{Map, Value};

use crate::composition::{Component, Signal, State};
use crate::connection::{Connection, Tab};
use crate::render::Render;
use crate::scope::Scopes;
use crate::store;
use crate::sync::{self, SyncTarget};
use crate::value::StoreValue;

/// Read access for view functions.
pub struct ViewContext<'a> {
    tab: &'a Tab,
    connection: &'a Connection,
    scopes: &'a Scopes,
}

impl<'a> ViewContext<'a> {
    pub(crate) fn new(tab: &'a Tab, connection: &'a Connection, scopes: &'a Scopes) -> Self {
        Self {
            tab,
            connection,
            scopes,
        }
    }

    /// Current value of `state`, or its initial value if absent or not
    /// decodable as `T`.
    pub fn get<T: StoreValue>(&self, state: &State<T>) -> T {
        store::read_state(self.tab, self.connection, self.scopes, state)
    }

    /// Current value of `signal`.
    pub fn signal<T: StoreValue>(&self, signal: &Signal<T>) -> T {
        store::read_signal(self.tab, signal)
    }

    /// All signal values as a JSON object, for seeding the client.
    pub fn signals_json(&self) -> String {
        let map: Map<String, Value> = self
            .tab
            .signals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map).to_string()
    }

    /// Render a mounted child component in place, wrapped in its root
    /// element.
    pub fn component(&self, component: &Component) -> String {
        component.inner.render(self)
    }

    /// Id of the tab being rendered.
    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    /// Session of the tab being rendered, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.connection.session_id()
    }
}

/// Read and write access for action handlers.
pub struct ActionContext<'a> {
    tab: &'a mut Tab,
    connection: &'a Connection,
    scopes: &'a Scopes,
    target: &'a SyncTarget,
    action_id: &'a str,
}

impl<'a> ActionContext<'a> {
    pub(crate) fn new(
        tab: &'a mut Tab,
        connection: &'a Connection,
        scopes: &'a Scopes,
        target: &'a SyncTarget,
        action_id: &'a str,
    ) -> Self {
        Self {
            tab,
            connection,
            scopes,
            target,
            action_id,
        }
    }

    /// Current value of `state`.
    pub fn get<T: StoreValue>(&self, state: &State<T>) -> T {
        store::read_state(&*self.tab, self.connection, self.scopes, state)
    }

    /// Current value of `signal`, including any value the client sent with
    /// this action.
    pub fn signal<T: StoreValue>(&self, signal: &Signal<T>) -> T {
        store::read_signal(&*self.tab, signal)
    }

    /// Store `value` in the scope `state` was declared with.
    ///
    /// Application and session writes are visible to other tabs at once,
    /// but their pages only change when they sync.
    pub fn set<T: StoreValue>(&mut self, state: &State<T>, value: T) {
        store::write_state(self.tab, self.connection, self.scopes, state, &value);
    }

    /// Store `value` in `signal`. The change is pushed on the next sync.
    pub fn set_signal<T: StoreValue>(&mut self, signal: &Signal<T>, value: T) {
        store::write_signal(self.tab, self.connection, signal, &value);
    }

    /// Re-render and push the owning component, or the whole page for
    /// page-level actions, followed by any changed signals.
    pub fn sync(&mut self) {
        sync::sync(self.tab, self.connection, self.scopes, self.target);
    }

    /// Push a fragment rendered by the handler itself. Its root element's
    /// id decides where the client merges it.
    pub fn sync_fragment(&mut self, fragment: impl Render) {
        sync::sync_fragment(self.tab, self.connection, &fragment);
    }

    /// Push changed signals without re-rendering.
    pub fn sync_signals(&mut self) {
        sync::sync_signals(self.tab, self.connection);
    }

    /// Ask the client to run `script` once.
    pub fn execute_script(&mut self, script: impl Into<String>) {
        sync::execute_script(self.tab, self.connection, script.into());
    }

    /// End the session this tab belongs to. Later requests carrying the
    /// same cookie get a fresh session.
    pub fn invalidate_session(&mut self) {
        match self.connection.session_id() {
            Some(session) => self.scopes.sessions.invalidate(session),
            None => tracing::debug!(
                connection_id = %self.connection.id(),
                "invalidate_session on a connection without a session"
            ),
        }
    }

    /// The action being handled.
    pub fn action_id(&self) -> &str {
        self.action_id
    }

    /// Id of the component owning this action, `None` for page actions.
    pub fn component_id(&self) -> Option<&str> {
        match self.target {
            SyncTarget::Page => None,
            SyncTarget::Component(c) => Some(&*c.id),
        }
    }

    /// Id of the tab that triggered the action.
    pub fn connection_id(&self) -> &str {
        self.connection.id()
    }

    /// Session of the triggering tab, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.connection.session_id()
    }
}
