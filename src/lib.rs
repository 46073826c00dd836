//! Server-held UI state for many concurrent browser tabs, pushed to the
//! client as HTML fragments and signal patches over a long-lived stream.

mod app;
pub use app::{App, AppBuilder, RenderedPage};
mod composition;
pub use composition::{Action, Component, Composition, CompositionBuilder, Signal, State};
mod config;
pub use config::{
    CLIENT_SCRIPT_ENV_VAR, CONNECTION_TTL_ENV_VAR, COOKIE_NAME_ENV_VAR, Config,
    PATCH_QUEUE_CAPACITY_ENV_VAR, SESSION_MAX_AGE_ENV_VAR,
};
mod connection;
pub use connection::Connection;
mod context;
pub use context::{ActionContext, ViewContext};
mod dispatch;
pub use dispatch::{ActionRequest, CONNECTION_KEY, DispatchOutcome, parse_payload};
mod error;
pub use error::{CompositionError, ConfigError, PageError, PayloadError};
pub mod http;
mod patch;
pub use patch::{Patch, PatchKind};
mod registry;
pub use registry::{SessionRegistry, SweepReport, SweeperHandle};
mod render;
pub use render::Render;
mod scope;
pub use scope::{ResolvedSession, Scope, Scopes, SessionScopes, SharedScope};
mod store;
mod sync;
mod value;
pub use value::StoreValue;
