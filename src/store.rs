//! Scoped reads and writes against a tab and the shared scopes.
//!
//! Reads resolve a typed handle to its scope, decode the stored value with
//! coercion, and fall back to the declared initial value. Writes are only
//! legal while an action handler runs; anything else is logged and dropped.

use serde_json::{Map, Value};

use crate::composition::{Composition, Signal, State};
use crate::connection::{Connection, Mode, Tab};
use crate::scope::{Scope, Scopes};
use crate::value::{StoreValue, coerce, encode};

/// Returns `true` if the tab is running an action handler; logs and returns
/// `false` otherwise.
pub(crate) fn in_action(tab: &Tab, connection: &Connection, op: &'static str) -> bool {
    if tab.mode == Mode::Action {
        return true;
    }
    tracing::warn!(
        connection_id = %connection.id(),
        op,
        mode = ?tab.mode,
        "rejected outside an action handler"
    );
    false
}

/// Read `state` for this tab.
pub(crate) fn read_state<T: StoreValue>(
    tab: &Tab,
    connection: &Connection,
    scopes: &Scopes,
    state: &State<T>,
) -> T {
    let key = state.key();
    let raw = match state.scope() {
        Scope::Connection => tab.values.get(key).cloned(),
        Scope::Session => connection
            .session_id()
            .and_then(|session| scopes.sessions.get(session, key)),
        Scope::Application => scopes.application.get(key),
    };
    match raw {
        Some(raw) => coerce(key, &raw, state.initial()),
        None => state.initial().clone(),
    }
}

/// Read `signal` for this tab.
pub(crate) fn read_signal<T: StoreValue>(tab: &Tab, signal: &Signal<T>) -> T {
    match tab.signals.get(signal.key()) {
        Some(raw) => coerce(signal.key(), raw, signal.initial()),
        None => signal.initial().clone(),
    }
}

/// Write `value` to `state`.
///
/// # Returns
///
/// `true` if the value was stored. `false` outside an action handler, when
/// the value cannot be encoded, when a session-scope write has no session,
/// or when the session has been invalidated.
pub(crate) fn write_state<T: StoreValue>(
    tab: &mut Tab,
    connection: &Connection,
    scopes: &Scopes,
    state: &State<T>,
    value: &T,
) -> bool {
    if !in_action(tab, connection, "set") {
        return false;
    }
    let Some(raw) = encode_for(connection, state.key(), value) else {
        return false;
    };
    let key = state.key();
    match state.scope() {
        Scope::Connection => {
            tab.values.insert(key.to_owned(), raw);
            true
        }
        Scope::Application => {
            scopes.application.set(key, raw);
            true
        }
        Scope::Session => {
            let Some(session) = connection.session_id() else {
                tracing::warn!(
                    connection_id = %connection.id(),
                    key,
                    "session-scope write on a connection without a session"
                );
                return false;
            };
            if scopes.sessions.set(session, key, raw) {
                true
            } else {
                tracing::warn!(
                    connection_id = %connection.id(),
                    session_id = %session,
                    key,
                    "session invalidated, dropping write"
                );
                false
            }
        }
    }
}

/// Write `value` to `signal` and mark it changed for the next sync.
pub(crate) fn write_signal<T: StoreValue>(
    tab: &mut Tab,
    connection: &Connection,
    signal: &Signal<T>,
    value: &T,
) -> bool {
    if !in_action(tab, connection, "set_signal") {
        return false;
    }
    let Some(raw) = encode_for(connection, signal.key(), value) else {
        return false;
    };
    tab.signals.insert(signal.key().to_owned(), raw);
    tab.changed.insert(signal.key().to_owned());
    true
}

/// Copy client-supplied signal values into the tab.
///
/// Only declared signals are accepted; unknown keys are ignored so a client
/// cannot grow the map. Values are stored as sent and coerced on read.
/// Injected values are not marked changed: the client already has them.
///
/// # Returns
///
/// The number of values stored.
pub(crate) fn inject_signals(
    tab: &mut Tab,
    connection: &Connection,
    composition: &Composition,
    signals: Map<String, Value>,
) -> usize {
    let mut stored = 0;
    for (key, value) in signals {
        if composition.declares_signal(&key) {
            tab.signals.insert(key, value);
            stored += 1;
        } else {
            tracing::debug!(
                connection_id = %connection.id(),
                key = %key,
                "ignoring undeclared signal in payload"
            );
        }
    }
    stored
}

fn encode_for<T: StoreValue>(connection: &Connection, key: &str, value: &T) -> Option<Value> {
    match encode(value) {
        Ok(raw) => Some(raw),
        Err(e) => {
            tracing::warn!(
                connection_id = %connection.id(),
                key,
                error = %e,
                "value could not be encoded, dropping write"
            );
            None
        }
    }
}
