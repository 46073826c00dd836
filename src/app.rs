//! The application: registered pages, the connection registry, and the
//! shared scopes, plus the transport-independent entry points.
//!
//! The HTTP layer in [`crate::http`] is a thin shell over these methods;
//! tests and other transports call them directly.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::composition::Composition;
use crate::config::Config;
use crate::connection::{Connection, Mode};
use crate::dispatch::{self, DispatchOutcome, parse_payload};
use crate::error::{CompositionError, PageError, PayloadError};
use crate::patch::Patch;
use crate::registry::{SessionRegistry, SweeperHandle};
use crate::render::page_shell;
use crate::scope::Scopes;
use crate::sync;

/// Paths served by the transport itself.
const RESERVED_ROUTES: [&str; 2] = ["/_sse", "/_session/close"];

/// Result of rendering a page for a new tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// Id of the connection created for the tab.
    pub connection_id: String,
    /// Session the tab belongs to.
    pub session_id: String,
    /// `true` if the session id was minted and must be set as a cookie.
    pub new_session: bool,
    /// The full HTML document.
    pub html: String,
}

/// A running application.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct App {
    pages: Arc<HashMap<String, Arc<Composition>>>,
    registry: Arc<SessionRegistry>,
    config: Arc<Config>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("routes", &self.pages.keys().collect::<Vec<_>>())
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl App {
    /// Start configuring an application.
    pub fn builder() -> AppBuilder {
        AppBuilder::new()
    }

    /// Render the page on `route` for a new tab.
    ///
    /// Resolves the session from `session_cookie` (minting one if absent or
    /// invalidated), registers a fresh connection, and renders the page view
    /// in view mode.
    ///
    /// # Errors
    ///
    /// * [`PageError::UnknownRoute`] if no page is registered on `route`.
    /// * [`PageError::ViewPanicked`] if the view panicked. The connection
    ///   is discarded.
    pub fn render_page(
        &self,
        route: &str,
        session_cookie: Option<&str>,
    ) -> Result<RenderedPage, PageError> {
        let composition = self
            .pages
            .get(route)
            .ok_or_else(|| PageError::UnknownRoute(route.to_owned()))?;

        let session = self.scopes().sessions.resolve(session_cookie);
        let connection_id = Uuid::new_v4().to_string();
        let connection = self.registry.create_connection(
            &connection_id,
            Some(&session.id),
            Arc::clone(composition),
        );

        let root = render_initial(&connection, self.scopes()).map_err(|panic| {
            tracing::error!(
                connection_id = %connection_id,
                route,
                panic = %panic,
                "page view panicked"
            );
            self.registry.close(&connection_id);
            PageError::ViewPanicked {
                route: route.to_owned(),
            }
        })?;

        let html = page_shell(&connection_id, self.config.client_script.as_deref(), &root);
        Ok(RenderedPage {
            connection_id,
            session_id: session.id,
            new_session: session.minted,
            html,
        })
    }

    /// Handle a raw action request.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] only if `payload` cannot be decoded. Unknown
    /// actions, expired connections and panicking handlers are reported in
    /// the [`DispatchOutcome`].
    pub fn dispatch(&self, action_id: &str, payload: &str) -> Result<DispatchOutcome, PayloadError> {
        let request = parse_payload(payload)?;
        Ok(self.dispatch_signals(&request.connection_id, action_id, request.signals))
    }

    /// Run `action_id` on `connection_id` with already-decoded signals.
    ///
    /// Blocks on the connection's dispatch lock.
    pub fn dispatch_signals(
        &self,
        connection_id: &str,
        action_id: &str,
        signals: Map<String, Value>,
    ) -> DispatchOutcome {
        let Some(connection) = self.registry.lookup(connection_id) else {
            tracing::info!(
                connection_id = %connection_id,
                action_id,
                "action for unknown or expired connection"
            );
            return DispatchOutcome::ConnectionNotFound;
        };
        self.registry.touch(connection_id);
        dispatch::dispatch(&connection, self.scopes(), action_id, signals)
    }

    /// Open the push channel for `connection_id`.
    ///
    /// Refreshes the connection's last access time. A previously open
    /// channel for the same connection ends.
    ///
    /// Returns `None` for unknown or expired connections.
    pub fn open_push_channel(&self, connection_id: &str) -> Option<BoxStream<'static, Patch>> {
        let connection = self.registry.lookup(connection_id)?;
        self.registry.touch(connection_id);
        tracing::debug!(connection_id = %connection_id, "push channel opened");
        Some(connection.patches())
    }

    /// Remove a connection at once, e.g. on page unload.
    pub fn close_connection(&self, connection_id: &str) -> bool {
        self.registry.close(connection_id)
    }

    /// Log out `session_id`: drop its data and refuse the cookie from now on.
    pub fn invalidate_session(&self, session_id: &str) {
        self.scopes().sessions.invalidate(session_id);
    }

    /// Look up a live connection.
    pub fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.registry.lookup(connection_id)
    }

    /// Spawn the background TTL sweeper on the current tokio runtime.
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.registry.start_sweeper(self.config.connection_ttl)
    }

    /// Registered page routes.
    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.pages.keys().map(String::as_str)
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The shared scopes.
    pub fn scopes(&self) -> &Scopes {
        self.registry.scopes()
    }
}

/// Render the page view under the dispatch lock in view mode.
fn render_initial(connection: &Connection, scopes: &Scopes) -> Result<String, String> {
    let mut tab = connection.lock_tab();
    tab.mode = Mode::View;
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        sync::render_page(&tab, connection, scopes)
    }));
    tab.mode = Mode::Idle;
    result.map_err(|payload| dispatch::panic_message(payload.as_ref()).to_owned())
}

/// Builder for an [`App`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tabsync::{App, Composition};
///
/// let mut home = Composition::page("home", "/");
/// home.view(|_ctx| "<h1>hi</h1>").expect("view should be accepted");
///
/// let app = App::builder()
///     .page(home.build().expect("build should succeed"))
///     .connection_ttl(Duration::from_secs(60))
///     .build()
///     .expect("app should build");
/// assert_eq!(app.routes().collect::<Vec<_>>(), vec!["/"]);
/// ```
pub struct AppBuilder {
    pages: Vec<Composition>,
    config: Config,
    scopes: Option<Scopes>,
}

impl AppBuilder {
    /// Create a builder with default configuration and no pages.
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            config: Config::default(),
            scopes: None,
        }
    }

    /// Register a page. Its route comes from [`Composition::page`].
    pub fn page(mut self, page: Composition) -> Self {
        self.pages.push(page);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the idle connection TTL.
    pub fn connection_ttl(mut self, ttl: Duration) -> Self {
        self.config.connection_ttl = ttl;
        self
    }

    /// Set the session cookie max-age and session data window.
    pub fn session_max_age(mut self, max_age: Duration) -> Self {
        self.config.session_max_age = max_age;
        self
    }

    /// Set the per-connection patch queue capacity.
    pub fn patch_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.patch_queue_capacity = capacity;
        self
    }

    /// Use existing scope containers instead of fresh ones.
    pub fn scopes(mut self, scopes: Scopes) -> Self {
        self.scopes = Some(scopes);
        self
    }

    /// Build the [`App`].
    ///
    /// # Errors
    ///
    /// * [`CompositionError::MissingRoute`] if a registered composition has
    ///   no route.
    /// * [`CompositionError::InvalidRoute`] if a route does not start with
    ///   `/` or is one of the transport endpoints.
    /// * [`CompositionError::DuplicateRoute`] if two pages share a route.
    pub fn build(self) -> Result<App, CompositionError> {
        let mut pages: HashMap<String, Arc<Composition>> = HashMap::with_capacity(self.pages.len());
        for page in self.pages {
            let Some(route) = page.route().map(str::to_owned) else {
                return Err(CompositionError::MissingRoute {
                    composition: page.id().to_owned(),
                });
            };
            if !route.starts_with('/')
                || route.starts_with("/_action/")
                || RESERVED_ROUTES.contains(&route.as_str())
            {
                return Err(CompositionError::InvalidRoute(route));
            }
            if pages.contains_key(&route) {
                return Err(CompositionError::DuplicateRoute(route));
            }
            pages.insert(route, Arc::new(page));
        }

        let registry = SessionRegistry::new(
            self.scopes.unwrap_or_default(),
            self.config.patch_queue_capacity,
            self.config.session_max_age,
        );
        tracing::debug!(pages = pages.len(), "app built");
        Ok(App {
            pages: Arc::new(pages),
            registry: Arc::new(registry),
            config: Arc::new(self.config),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
