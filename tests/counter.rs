//! Integration tests for multi-tab state scoping, sync and lifecycle.
//!
//! Every test drives the public [`App`] API the way the HTTP layer does:
//! render a page for a tab, dispatch actions with client signals, and read
//! back the patches queued for that tab.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tabsync::{App, Composition, DispatchOutcome, Patch, Scope};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A page with one value per scope, a mounted cart component, and the
/// actions the tests trigger.
fn home_page() -> Composition {
    let mut cart = Composition::component("cart");
    let items = cart.state("cart.items", 0i64, Scope::Connection)
        .expect("state declaration should succeed");
    let view_items = items.clone();
    cart.view(move |ctx| format!("<span>items={}</span>", ctx.get(&view_items)))
        .expect("view should be accepted");
    cart.action("cart.add", move |ctx| {
        let n = ctx.get(&items);
        ctx.set(&items, n + 1);
        ctx.sync();
    })
    .expect("action declaration should succeed");

    let mut page = Composition::page("home", "/");
    let cart = page.mount(cart.build().expect("build should succeed"))
        .expect("mount should succeed");
    let count = page.state("count", 0i64, Scope::Connection)
        .expect("state declaration should succeed");
    let user = page.state("user", "anon".to_string(), Scope::Session)
        .expect("state declaration should succeed");
    let visits = page.state("visits", 0i64, Scope::Application)
        .expect("state declaration should succeed");
    let step = page.signal("step", 1i64).expect("signal declaration should succeed");
    let name = page.signal("name", String::new()).expect("signal declaration should succeed");

    {
        let (count, user, visits) = (count.clone(), user.clone(), visits.clone());
        page.view(move |ctx| {
            format!(
                "<p>count={}</p><p>user={}</p><p>visits={}</p>{}",
                ctx.get(&count),
                ctx.get(&user),
                ctx.get(&visits),
                ctx.component(&cart)
            )
        })
        .expect("view should be accepted");
    }

    page.action("increment", move |ctx| {
        let n = ctx.get(&count) + ctx.signal(&step);
        ctx.set(&count, n);
        ctx.sync();
    })
    .expect("action declaration should succeed");
    page.action("login", move |ctx| {
        let who = ctx.signal(&name);
        ctx.set(&user, who);
        ctx.sync();
    })
    .expect("action declaration should succeed");
    page.action("visit", move |ctx| {
        let n = ctx.get(&visits);
        ctx.set(&visits, n + 1);
        ctx.sync();
    })
    .expect("action declaration should succeed");
    page.action("refresh", |ctx| ctx.sync()).expect("action declaration should succeed");
    page.action("logout", |ctx| {
        ctx.invalidate_session();
        ctx.sync();
    })
    .expect("action declaration should succeed");
    page.build().expect("build should succeed")
}

fn app() -> App {
    init_tracing();
    App::builder().page(home_page()).build().expect("app should build")
}

fn act(app: &App, tab: &str, action: &str, signals: Value) -> DispatchOutcome {
    let signals: Map<String, Value> = signals.as_object().cloned().unwrap_or_default();
    app.dispatch_signals(tab, action, signals)
}

/// Drain the tab's queue and return the element patches only.
fn fragments(app: &App, tab: &str) -> Vec<String> {
    let conn = app.connection(tab).expect("tab is live");
    std::iter::from_fn(|| conn.try_recv_patch())
        .filter_map(|p| match p {
            Patch::Elements(html) => Some(html),
            _ => None,
        })
        .collect()
}

fn last_fragment(app: &App, tab: &str) -> String {
    fragments(app, tab).pop().expect("a fragment was pushed")
}

#[test]
fn one_increment_shows_count_one() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    assert!(tab.html.contains("count=0"));

    assert_eq!(act(&app, &tab.connection_id, "increment", json!({})), DispatchOutcome::Handled);
    assert!(last_fragment(&app, &tab.connection_id).contains("count=1"));
}

#[test]
fn connection_scope_is_private_to_each_tab() {
    let app = app();
    let a = app.render_page("/", None).expect("page should render");
    let b = app.render_page("/", Some(&a.session_id)).expect("page should render");

    act(&app, &a.connection_id, "increment", json!({}));
    act(&app, &b.connection_id, "refresh", json!({}));

    assert!(last_fragment(&app, &a.connection_id).contains("count=1"));
    assert!(last_fragment(&app, &b.connection_id).contains("count=0"));
}

#[test]
fn session_scope_is_shared_by_tabs_of_one_session() {
    let app = app();
    let a = app.render_page("/", None).expect("page should render");
    let b = app.render_page("/", Some(&a.session_id)).expect("page should render");
    let other = app.render_page("/", None).expect("page should render");
    assert_ne!(other.session_id, a.session_id);

    act(&app, &a.connection_id, "login", json!({ "name": "ada" }));
    act(&app, &b.connection_id, "refresh", json!({}));
    act(&app, &other.connection_id, "refresh", json!({}));

    assert!(last_fragment(&app, &b.connection_id).contains("user=ada"));
    assert!(last_fragment(&app, &other.connection_id).contains("user=anon"));
}

#[test]
fn application_scope_is_shared_by_every_tab() {
    let app = app();
    let a = app.render_page("/", None).expect("page should render");
    let other = app.render_page("/", None).expect("page should render");

    act(&app, &a.connection_id, "visit", json!({}));
    act(&app, &other.connection_id, "refresh", json!({}));

    assert!(last_fragment(&app, &other.connection_id).contains("visits=1"));
}

#[test]
fn repeated_sync_produces_identical_fragments() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    act(&app, &tab.connection_id, "refresh", json!({}));
    act(&app, &tab.connection_id, "refresh", json!({}));

    let frags = fragments(&app, &tab.connection_id);
    assert_eq!(frags.len(), 2);
    assert_eq!(frags[0], frags[1]);
}

#[test]
fn component_action_pushes_only_the_component() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    assert!(tab.html.contains("<div id=\"cart\"><span>items=0</span></div>"));

    act(&app, &tab.connection_id, "cart.add", json!({}));
    assert_eq!(
        last_fragment(&app, &tab.connection_id),
        "<div id=\"cart\"><span>items=1</span></div>"
    );
}

#[test]
fn page_action_pushes_the_page_root() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    act(&app, &tab.connection_id, "increment", json!({}));

    let html = last_fragment(&app, &tab.connection_id);
    assert!(html.starts_with("<div id=\"home\">"));
    assert!(html.contains("<div id=\"cart\">"));
}

#[test]
fn initial_render_queues_nothing() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    let conn = app.connection(&tab.connection_id).expect("connection should be live");
    assert_eq!(conn.try_recv_patch(), None);
}

#[test]
fn idle_tabs_are_swept_and_active_ones_survive() {
    let app = app();
    let stale = app.render_page("/", None).expect("page should render");
    thread::sleep(Duration::from_millis(40));
    let fresh = app.render_page("/", None).expect("page should render");

    let report = app
        .registry()
        .sweep_expired_at(Instant::now(), Duration::from_millis(20));
    assert_eq!(report.connections, 1);
    assert!(app.connection(&stale.connection_id).is_none());
    assert!(app.connection(&fresh.connection_id).is_some());
    assert_eq!(
        act(&app, &stale.connection_id, "increment", json!({})),
        DispatchOutcome::ConnectionNotFound
    );
}

#[test]
fn logout_clears_session_and_mints_a_new_id() {
    let app = app();
    let a = app.render_page("/", None).expect("page should render");
    let b = app.render_page("/", Some(&a.session_id)).expect("page should render");
    act(&app, &a.connection_id, "login", json!({ "name": "ada" }));
    act(&app, &a.connection_id, "logout", json!({}));
    assert!(app.scopes().sessions().is_invalidated(&a.session_id));

    // Tabs still open on the old session read initial values and cannot
    // write the session back into existence.
    act(&app, &b.connection_id, "login", json!({ "name": "mallory" }));
    assert!(last_fragment(&app, &b.connection_id).contains("user=anon"));

    let again = app.render_page("/", Some(&a.session_id)).expect("page should render");
    assert!(again.new_session);
    assert_ne!(again.session_id, a.session_id);
    assert!(again.html.contains("user=anon"));
}

#[test]
fn client_values_are_coerced_to_declared_types() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    let id = tab.connection_id.as_str();

    act(&app, id, "increment", json!({ "step": "42" }));
    assert!(last_fragment(&app, id).contains("count=42"));

    act(&app, id, "increment", json!({ "step": 42.0 }));
    assert!(last_fragment(&app, id).contains("count=84"));

    // An object cannot be a step; the declared initial value of 1 is used.
    act(&app, id, "increment", json!({ "step": { "n": 5 } }));
    assert!(last_fragment(&app, id).contains("count=85"));
}

#[test]
fn unknown_action_and_undeclared_signals_are_ignored() {
    let app = app();
    let tab = app.render_page("/", None).expect("page should render");
    assert_eq!(
        act(&app, &tab.connection_id, "nope", json!({})),
        DispatchOutcome::UnknownAction
    );
    assert_eq!(
        act(&app, &tab.connection_id, "increment", json!({ "bogus": 1 })),
        DispatchOutcome::Handled
    );
    assert!(last_fragment(&app, &tab.connection_id).contains("count=1"));
}

#[test]
fn concurrent_tabs_do_not_interfere() {
    let app = app();
    let tabs: Vec<String> = (0..8)
        .map(|_| app.render_page("/", None).expect("page should render").connection_id)
        .collect();

    thread::scope(|s| {
        for tab in &tabs {
            let app = app.clone();
            s.spawn(move || {
                for _ in 0..10 {
                    act(&app, tab, "increment", json!({}));
                    act(&app, tab, "visit", json!({}));
                }
            });
        }
    });

    for tab in &tabs {
        assert!(last_fragment(&app, tab).contains("count=10"));
    }
    // Tabs race on the shared counter, so updates may be lost but never
    // invented.
    let visits = app
        .scopes()
        .application()
        .get("visits")
        .and_then(|v| v.as_i64())
        .expect("visits should have been written");
    assert!((1..=80).contains(&visits), "visits = {visits}");
}
