//! Declarative registration of pages and nested components.
//!
//! A [`CompositionBuilder`] collects the catalog for one routable unit: the
//! state and signal declarations that seed every new tab, the action
//! handlers the client can trigger, and the single view function. Child
//! compositions are folded in bottom-up with [`CompositionBuilder::mount`];
//! their declarations join the parent's catalog tagged with the child as
//! owner, so the root always has one flat dispatch table no matter how deep
//! the nesting goes.
//!
//! State and signal declarations close once the view is set. Actions may
//! still be added afterwards since they do not seed tab storage.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{ActionContext, ViewContext};
use crate::error::CompositionError;
use crate::render::{Render, wrap_root};
use crate::scope::Scope;
use crate::value::{StoreValue, encode};

/// Type-erased view function returning serialized HTML.
pub(crate) type ViewFn = Arc<dyn Fn(&ViewContext<'_>) -> Vec<u8> + Send + Sync>;

/// Type-erased action handler.
pub(crate) type ActionFn = Arc<dyn Fn(&mut ActionContext<'_>) + Send + Sync>;

/// The owning component of an action: its id and its own view, so a sync
/// can re-render just that subtree.
#[derive(Clone)]
pub(crate) struct ComponentRef {
    pub(crate) id: Arc<str>,
    pub(crate) view: ViewFn,
}

impl ComponentRef {
    /// Render the component wrapped in its root element.
    pub(crate) fn render(&self, ctx: &ViewContext<'_>) -> String {
        wrap_root(&self.id, &(self.view)(ctx))
    }
}

impl fmt::Debug for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRef").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StateDecl {
    pub(crate) key: String,
    pub(crate) initial: Value,
    pub(crate) scope: Scope,
    pub(crate) owner: Option<Arc<str>>,
}

#[derive(Debug, Clone)]
pub(crate) struct SignalDecl {
    pub(crate) key: String,
    pub(crate) initial: Value,
    pub(crate) owner: Option<Arc<str>>,
}

/// Typed handle to a declared state value.
///
/// Wraps the declaration id, its scope, and the initial value that reads
/// fall back to. Handles are cheap to clone and are usually moved into the
/// action and view closures that use them.
pub struct State<T> {
    key: Arc<str>,
    scope: Scope,
    initial: Arc<T>,
}

// Manual `Clone`: only the `Arc`s are cloned, `T` is never copied.
impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            scope: self.scope,
            initial: Arc::clone(&self.initial),
        }
    }
}

impl<T> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("key", &self.key)
            .field("scope", &self.scope)
            .finish()
    }
}

impl<T> State<T> {
    /// The declaration id.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The scope the value lives in.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// The declared initial value.
    pub fn initial(&self) -> &T {
        &self.initial
    }
}

/// Typed handle to a declared signal: a client-visible value synchronized
/// in both directions.
pub struct Signal<T> {
    key: Arc<str>,
    initial: Arc<T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            initial: Arc::clone(&self.initial),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("key", &self.key).finish()
    }
}

impl<T> Signal<T> {
    /// The signal id, as seen by the client.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The declared initial value.
    pub fn initial(&self) -> &T {
        &self.initial
    }
}

/// Handle to a registered action. Views use [`Action::id`] to render the
/// client-side trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    id: Arc<str>,
}

impl Action {
    /// The action id routed through `/_action/{id}`.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Handle to a mounted child component, used by the parent view to embed
/// it with [`ViewContext::component`].
#[derive(Debug, Clone)]
pub struct Component {
    pub(crate) inner: ComponentRef,
}

impl Component {
    /// The component id, also the id of its root element.
    pub fn id(&self) -> &str {
        &self.inner.id
    }
}

/// Explicit result of folding a finished child into its parent.
struct Merge {
    component: ComponentRef,
    nested: Vec<Arc<str>>,
    actions: Vec<(String, ActionFn, ComponentRef)>,
    states: Vec<StateDecl>,
    signals: Vec<SignalDecl>,
}

/// Builder for a [`Composition`].
///
/// # Examples
///
/// ```
/// use tabsync::{Composition, Scope};
///
/// let mut page = Composition::page("counter", "/");
/// let count = page
///     .state("count", 0i64, Scope::Connection)
///     .expect("state declaration should succeed");
/// let view_count = count.clone();
/// page.view(move |ctx| format!("<p>count={}</p>", ctx.get(&view_count)))
///     .expect("view should be accepted");
/// page.action("increment", move |ctx| {
///     let n = ctx.get(&count);
///     ctx.set(&count, n + 1);
///     ctx.sync();
/// })
/// .expect("action declaration should succeed");
/// let page = page.build().expect("build should succeed");
/// assert_eq!(page.route(), Some("/"));
/// ```
pub struct CompositionBuilder {
    id: Arc<str>,
    route: Option<String>,
    view: Option<ViewFn>,
    actions: HashMap<String, ActionFn>,
    owners: HashMap<String, ComponentRef>,
    components: HashSet<Arc<str>>,
    states: Vec<StateDecl>,
    signals: Vec<SignalDecl>,
    finalized: bool,
}

impl CompositionBuilder {
    fn new(id: &str, route: Option<String>) -> Self {
        Self {
            id: Arc::from(id),
            route,
            view: None,
            actions: HashMap::new(),
            owners: HashMap::new(),
            components: HashSet::new(),
            states: Vec::new(),
            signals: Vec::new(),
            finalized: false,
        }
    }

    /// Declare a state value.
    ///
    /// # Arguments
    ///
    /// * `key` - Declaration id, unique among this tree's states.
    /// * `initial` - Value every new tab is seeded with (connection scope)
    ///   and the fallback for reads of absent or incompatible values.
    /// * `scope` - Where the value lives.
    ///
    /// # Returns
    ///
    /// A typed [`State`] handle for reads and writes.
    ///
    /// # Errors
    ///
    /// * [`CompositionError::Finalized`] if the view is already set.
    /// * [`CompositionError::Duplicate`] if `key` is already a state.
    /// * [`CompositionError::Encode`] if `initial` cannot be serialized.
    pub fn state<T: StoreValue>(
        &mut self,
        key: &str,
        initial: T,
        scope: Scope,
    ) -> Result<State<T>, CompositionError> {
        self.ensure_open(key)?;
        if self.states.iter().any(|s| s.key == key) {
            return Err(self.duplicate("state", key));
        }
        let raw = encode(&initial).map_err(|source| CompositionError::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.states.push(StateDecl {
            key: key.to_owned(),
            initial: raw,
            scope,
            owner: None,
        });
        Ok(State {
            key: Arc::from(key),
            scope,
            initial: Arc::new(initial),
        })
    }

    /// Declare a signal.
    ///
    /// # Errors
    ///
    /// Same as [`state`](CompositionBuilder::state), checked against the
    /// signal namespace.
    pub fn signal<T: StoreValue>(
        &mut self,
        key: &str,
        initial: T,
    ) -> Result<Signal<T>, CompositionError> {
        self.ensure_open(key)?;
        if self.signals.iter().any(|s| s.key == key) {
            return Err(self.duplicate("signal", key));
        }
        let raw = encode(&initial).map_err(|source| CompositionError::Encode {
            key: key.to_owned(),
            source,
        })?;
        self.signals.push(SignalDecl {
            key: key.to_owned(),
            initial: raw,
            owner: None,
        });
        Ok(Signal {
            key: Arc::from(key),
            initial: Arc::new(initial),
        })
    }

    /// Register an action handler.
    ///
    /// Allowed before or after the view is set.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::Duplicate`] if `id` is already registered
    /// anywhere in this tree.
    pub fn action<F>(&mut self, id: &str, handler: F) -> Result<Action, CompositionError>
    where
        F: Fn(&mut ActionContext<'_>) + Send + Sync + 'static,
    {
        if self.actions.contains_key(id) {
            return Err(self.duplicate("action", id));
        }
        self.actions.insert(id.to_owned(), Arc::new(handler));
        Ok(Action { id: Arc::from(id) })
    }

    /// Set the view function and close state and signal declarations.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::ViewAlreadySet`] on a second call.
    pub fn view<F, R>(&mut self, view: F) -> Result<(), CompositionError>
    where
        F: Fn(&ViewContext<'_>) -> R + Send + Sync + 'static,
        R: Render,
    {
        if self.view.is_some() {
            return Err(CompositionError::ViewAlreadySet {
                composition: self.id.to_string(),
            });
        }
        self.view = Some(Arc::new(move |ctx: &ViewContext<'_>| view(ctx).render()));
        self.finalized = true;
        Ok(())
    }

    /// Fold a finished child composition into this one.
    ///
    /// The child's states, signals and actions join this catalog. Actions
    /// the child did not already assign to a deeper component are owned by
    /// the child, so triggering them re-renders only the child's subtree.
    ///
    /// # Returns
    ///
    /// A [`Component`] handle for embedding the child in this view.
    ///
    /// # Errors
    ///
    /// * [`CompositionError::Finalized`] if this view is already set.
    /// * [`CompositionError::Duplicate`] if any id in the child clashes with
    ///   one already here. Nothing is merged in that case.
    pub fn mount(&mut self, child: Composition) -> Result<Component, CompositionError> {
        let merge = child.into_merge();
        self.fold(merge)
    }

    /// Finish the composition.
    ///
    /// # Errors
    ///
    /// Returns [`CompositionError::MissingView`] if no view was set.
    pub fn build(self) -> Result<Composition, CompositionError> {
        let view = self.view.ok_or_else(|| CompositionError::MissingView {
            composition: self.id.to_string(),
        })?;
        let signal_keys = self.signals.iter().map(|s| s.key.clone()).collect();
        Ok(Composition {
            id: self.id,
            route: self.route,
            view,
            actions: self.actions,
            owners: self.owners,
            components: self.components,
            states: self.states,
            signals: self.signals,
            signal_keys,
        })
    }

    fn fold(&mut self, merge: Merge) -> Result<Component, CompositionError> {
        let child_id = Arc::clone(&merge.component.id);
        self.ensure_open(&child_id)?;

        // Validate everything before touching the catalog.
        for id in std::iter::once(&child_id).chain(merge.nested.iter()) {
            if **id == *self.id || self.components.contains(id) {
                return Err(self.duplicate("component", id));
            }
        }
        if let Some(s) = merge
            .states
            .iter()
            .find(|s| self.states.iter().any(|own| own.key == s.key))
        {
            return Err(self.duplicate("state", &s.key));
        }
        if let Some(s) = merge
            .signals
            .iter()
            .find(|s| self.signals.iter().any(|own| own.key == s.key))
        {
            return Err(self.duplicate("signal", &s.key));
        }
        if let Some((id, _, _)) = merge
            .actions
            .iter()
            .find(|(id, _, _)| self.actions.contains_key(id))
        {
            return Err(self.duplicate("action", id));
        }

        self.components.insert(Arc::clone(&child_id));
        self.components.extend(merge.nested);
        self.states.extend(merge.states);
        self.signals.extend(merge.signals);
        for (id, handler, owner) in merge.actions {
            self.owners.insert(id.clone(), owner);
            self.actions.insert(id, handler);
        }
        Ok(Component {
            inner: merge.component,
        })
    }

    fn ensure_open(&self, key: &str) -> Result<(), CompositionError> {
        if self.finalized {
            return Err(CompositionError::Finalized {
                composition: self.id.to_string(),
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    fn duplicate(&self, kind: &'static str, key: &str) -> CompositionError {
        CompositionError::Duplicate {
            composition: self.id.to_string(),
            kind,
            key: key.to_owned(),
        }
    }
}

/// The finished catalog for one page or component.
///
/// Immutable once built and shared by every tab opened on its route.
pub struct Composition {
    id: Arc<str>,
    route: Option<String>,
    view: ViewFn,
    actions: HashMap<String, ActionFn>,
    owners: HashMap<String, ComponentRef>,
    components: HashSet<Arc<str>>,
    states: Vec<StateDecl>,
    signals: Vec<SignalDecl>,
    signal_keys: HashSet<String>,
}

// Manual `Debug`: closures are not `Debug`.
impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("actions", &self.actions.len())
            .field("states", &self.states.len())
            .field("signals", &self.signals.len())
            .finish()
    }
}

impl Composition {
    /// Start building a routable page.
    pub fn page(id: &str, route: impl Into<String>) -> CompositionBuilder {
        CompositionBuilder::new(id, Some(route.into()))
    }

    /// Start building a component meant to be mounted into a parent.
    pub fn component(id: &str) -> CompositionBuilder {
        CompositionBuilder::new(id, None)
    }

    /// The composition id, also the id of its root element.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The route this page is served on, `None` for components.
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Returns `true` if `action_id` resolves in this catalog.
    pub fn has_action(&self, action_id: &str) -> bool {
        self.actions.contains_key(action_id)
    }

    /// Id of the component owning `action_id`, `None` for page-level
    /// actions and unknown ids.
    pub fn action_owner(&self, action_id: &str) -> Option<&str> {
        self.owners.get(action_id).map(|c| &*c.id)
    }

    /// Id of the component that declared state `key`, `None` for page-level
    /// and unknown states.
    pub fn state_owner(&self, key: &str) -> Option<&str> {
        self.states
            .iter()
            .find(|s| s.key == key)
            .and_then(|s| s.owner.as_deref())
    }

    /// Id of the component that declared signal `key`, `None` for page-level
    /// and unknown signals.
    pub fn signal_owner(&self, key: &str) -> Option<&str> {
        self.signals
            .iter()
            .find(|s| s.key == key)
            .and_then(|s| s.owner.as_deref())
    }

    /// Ids of every component mounted anywhere below this composition.
    pub fn component_ids(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(|id| &**id)
    }

    pub(crate) fn view_fn(&self) -> &ViewFn {
        &self.view
    }

    pub(crate) fn handler(&self, action_id: &str) -> Option<&ActionFn> {
        self.actions.get(action_id)
    }

    pub(crate) fn owner(&self, action_id: &str) -> Option<&ComponentRef> {
        self.owners.get(action_id)
    }

    pub(crate) fn states(&self) -> &[StateDecl] {
        &self.states
    }

    pub(crate) fn signals(&self) -> &[SignalDecl] {
        &self.signals
    }

    pub(crate) fn declares_signal(&self, key: &str) -> bool {
        self.signal_keys.contains(key)
    }

    fn into_merge(mut self) -> Merge {
        let component = ComponentRef {
            id: Arc::clone(&self.id),
            view: self.view,
        };
        let actions = self
            .actions
            .into_iter()
            .map(|(id, handler)| {
                let owner = self
                    .owners
                    .remove(&id)
                    .unwrap_or_else(|| component.clone());
                (id, handler, owner)
            })
            .collect();
        let tag = |owner: Option<Arc<str>>| owner.or_else(|| Some(Arc::clone(&component.id)));
        let states = self
            .states
            .into_iter()
            .map(|s| StateDecl {
                owner: tag(s.owner),
                ..s
            })
            .collect();
        let signals = self
            .signals
            .into_iter()
            .map(|s| SignalDecl {
                owner: tag(s.owner),
                ..s
            })
            .collect();
        Merge {
            nested: self.components.into_iter().collect(),
            component,
            actions,
            states,
            signals,
        }
    }
}
