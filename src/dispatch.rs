//! Routing action requests to handlers.
//!
//! A request names an action and carries the client's signal values plus
//! the originating connection id under [`CONNECTION_KEY`]. Dispatch holds
//! the connection's lock for the whole injection, handler, and sync
//! sequence, so two actions on one tab never interleave. A panicking
//! handler is contained and logged; the connection stays usable.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use serde_json::{Map, Value};

use crate::connection::{Connection, Mode};
use crate::context::ActionContext;
use crate::error::PayloadError;
use crate::scope::Scopes;
use crate::store;
use crate::sync::SyncTarget;

/// Reserved payload key carrying the originating connection id.
pub const CONNECTION_KEY: &str = "_tab";

/// What happened to an action request.
///
/// Every outcome is acknowledged to the client the same way; the variants
/// exist for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran to completion.
    Handled,
    /// The page has no action with that id. Nothing ran.
    UnknownAction,
    /// The connection id is unknown or expired. Nothing ran.
    ConnectionNotFound,
    /// The handler panicked. Writes made before the panic are kept.
    HandlerPanicked,
}

/// A decoded action payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Id of the originating tab.
    pub connection_id: String,
    /// Signal values sent by the client, reserved key removed.
    pub signals: Map<String, Value>,
}

/// Decode a raw action payload.
///
/// # Errors
///
/// * [`PayloadError::Malformed`] if `raw` is not JSON.
/// * [`PayloadError::NotAnObject`] if it is not a JSON object.
/// * [`PayloadError::MissingConnectionId`] if [`CONNECTION_KEY`] is absent
///   or not a string.
pub fn parse_payload(raw: &str) -> Result<ActionRequest, PayloadError> {
    let Value::Object(mut signals) = serde_json::from_str::<Value>(raw)? else {
        return Err(PayloadError::NotAnObject);
    };
    let Some(Value::String(connection_id)) = signals.remove(CONNECTION_KEY) else {
        return Err(PayloadError::MissingConnectionId);
    };
    Ok(ActionRequest {
        connection_id,
        signals,
    })
}

/// Run `action_id` against `connection`.
///
/// Blocks on the connection's dispatch lock; call from a blocking context
/// when running on an async executor.
pub(crate) fn dispatch(
    connection: &Connection,
    scopes: &Scopes,
    action_id: &str,
    signals: Map<String, Value>,
) -> DispatchOutcome {
    let _span = tracing::info_span!(
        "dispatch",
        connection_id = %connection.id(),
        action_id,
    )
    .entered();

    let composition = connection.composition();
    let Some(handler) = composition.handler(action_id) else {
        tracing::info!("unknown action, ignoring");
        return DispatchOutcome::UnknownAction;
    };
    let target = SyncTarget::for_action(connection, action_id);

    let mut tab = connection.lock_tab();

    // 1. Fold the client's signal values in before the handler reads them.
    store::inject_signals(&mut tab, connection, composition, signals);

    // 2. Run the handler with writes and syncs enabled.
    tab.mode = Mode::Action;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = ActionContext::new(&mut tab, connection, scopes, &target, action_id);
        handler(&mut ctx);
    }));

    // 3. Back to idle whatever happened.
    tab.mode = Mode::Idle;
    drop(tab);

    match result {
        Ok(()) => {
            tracing::debug!("action handled");
            DispatchOutcome::Handled
        }
        Err(payload) => {
            tracing::error!(
                connection_id = %connection.id(),
                action_id,
                panic = panic_message(payload.as_ref()),
                "action handler panicked"
            );
            DispatchOutcome::HandlerPanicked
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
