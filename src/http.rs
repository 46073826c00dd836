//! HTTP transport.
//!
//! Routes:
//! - `GET <page route>` renders a page for a new tab and sets the session
//!   cookie when a session was minted
//! - `GET /_sse?tab={connection id}` is the push channel, an SSE stream
//! - `GET /_action/{action id}?payload={json}` triggers an action
//! - `POST /_session/close` with the connection id as body closes a tab

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{MatchedPath, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::StreamExt;

use crate::app::App;
use crate::error::PageError;
use crate::patch::Patch;

/// SSE event name for element patches.
pub const EVENT_PATCH_ELEMENTS: &str = "patch-elements";
/// SSE event name for signal patches.
pub const EVENT_PATCH_SIGNALS: &str = "patch-signals";
/// SSE event name for script patches.
pub const EVENT_EXECUTE_SCRIPT: &str = "execute-script";

/// Bind `addr`, start the sweeper, and serve `app` until the server stops.
///
/// # Errors
///
/// Returns `io::Error` if binding or serving fails.
pub async fn serve(app: App, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "tabsync listening");
    let sweeper = app.start_sweeper();
    let result = axum::serve(listener, router(app)).await;
    if let Err(e) = sweeper.shutdown().await {
        tracing::warn!(error = %e, "sweeper did not shut down cleanly");
    }
    result
}

/// Build the router (separated for testing).
pub fn router(app: App) -> Router {
    let mut router = Router::new()
        .route("/_sse", get(push_channel))
        .route("/_action/:action_id", get(action))
        .route("/_session/close", post(close));
    for route in app.routes() {
        router = router.route(route, get(page));
    }
    router.with_state(app)
}

async fn page(State(app): State<App>, path: MatchedPath, headers: HeaderMap) -> Response {
    let cookie = session_cookie(&headers, &app.config().cookie_name).map(str::to_owned);
    let route = path.as_str().to_owned();
    let renderer = app.clone();
    let rendered = tokio::task::spawn_blocking(move || {
        renderer.render_page(&route, cookie.as_deref())
    })
    .await;

    match rendered {
        Ok(Ok(page)) if page.new_session => {
            let cookie = set_cookie(&app, &page.session_id);
            ([(header::SET_COOKIE, cookie)], Html(page.html)).into_response()
        }
        Ok(Ok(page)) => Html(page.html).into_response(),
        Ok(Err(PageError::UnknownRoute(_))) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(PageError::ViewPanicked { .. })) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "page render task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushQuery {
    tab: String,
}

async fn push_channel(State(app): State<App>, Query(query): Query<PushQuery>) -> Response {
    let Some(patches) = app.open_push_channel(&query.tab) else {
        tracing::debug!(connection_id = %query.tab, "push channel for unknown connection");
        return StatusCode::NOT_FOUND.into_response();
    };
    let events = patches.map(|patch| Ok::<_, Infallible>(sse_event(&patch)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Deserialize)]
struct ActionQuery {
    payload: Option<String>,
}

async fn action(
    State(app): State<App>,
    Path(action_id): Path<String>,
    Query(query): Query<ActionQuery>,
) -> StatusCode {
    let Some(payload) = query.payload else {
        tracing::warn!(action_id = %action_id, "action request without payload");
        return StatusCode::BAD_REQUEST;
    };
    let result = tokio::task::spawn_blocking(move || app.dispatch(&action_id, &payload)).await;
    match result {
        Ok(Ok(outcome)) => {
            tracing::debug!(?outcome, "action acknowledged");
            StatusCode::OK
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "rejected action payload");
            StatusCode::BAD_REQUEST
        }
        Err(e) => {
            tracing::error!(error = %e, "dispatch task failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn close(State(app): State<App>, body: String) -> StatusCode {
    app.close_connection(body.trim());
    StatusCode::OK
}

/// Value of the cookie called `name`, if present and non-empty.
fn session_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn set_cookie(app: &App, session_id: &str) -> String {
    let config = app.config();
    format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        config.cookie_name,
        session_id,
        config.session_max_age.as_secs()
    )
}

/// Encode a patch as an SSE event.
pub fn sse_event(patch: &Patch) -> Event {
    let name = match patch {
        Patch::Elements(_) => EVENT_PATCH_ELEMENTS,
        Patch::Signals(_) => EVENT_PATCH_SIGNALS,
        Patch::Script(_) => EVENT_EXECUTE_SCRIPT,
    };
    Event::default().event(name).data(wire_data(patch))
}

/// The SSE `data` payload for a patch. Every line carries a field prefix
/// so multi-line HTML and scripts survive SSE line splitting.
pub fn wire_data(patch: &Patch) -> String {
    match patch {
        Patch::Elements(html) => prefix_lines("elements", html),
        Patch::Signals(signals) => format!("signals {}", Value::Object(signals.clone())),
        Patch::Script(script) => prefix_lines("script", script),
    }
}

/// Prefix every line of `text`. `\r\n`, a lone `\r` and `\n` all break
/// lines, since an SSE field value may contain none of them.
fn prefix_lines(prefix: &str, text: &str) -> String {
    text.replace("\r\n", "\n")
        .split(['\r', '\n'])
        .map(|line| format!("{prefix} {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Map, json};
    use tower::ServiceExt;

    use super::*;
    use crate::composition::Composition;
    use crate::scope::Scope;

    fn app() -> App {
        let mut page = Composition::page("counter", "/");
        let count = page.state("count", 0i64, Scope::Connection)
            .expect("state declaration should succeed");
        let view_count = count.clone();
        page.view(move |ctx| format!("<p>count={}</p>", ctx.get(&view_count)))
            .expect("view should be accepted");
        page.action("increment", move |ctx| {
            let n = ctx.get(&count);
            ctx.set(&count, n + 1);
            ctx.sync();
        })
        .expect("action declaration should succeed");
        App::builder().page(page.build().expect("build should succeed")).build()
            .expect("app should build")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await
            .expect("body should be readable");
        String::from_utf8(bytes.to_vec()).expect("frame should be utf-8")
    }

    fn action_uri(action: &str, connection_id: &str) -> String {
        let payload = json!({ "_tab": connection_id }).to_string();
        let encoded: String = payload
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => (b as char).to_string(),
                _ => format!("%{b:02X}"),
            })
            .collect();
        format!("/_action/{action}?payload={encoded}")
    }

    #[tokio::test]
    async fn page_sets_cookie_for_new_session() {
        let app = app();
        let response = router(app.clone()).oneshot(get("/")).await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .expect("cookie set")
            .to_str()
            .expect("header should be ascii")
            .to_owned();
        assert!(cookie.starts_with("tabsync_session="));
        assert!(cookie.contains("HttpOnly"));
        let html = body_text(response).await;
        assert!(html.contains("count=0"));
        assert_eq!(app.registry().len(), 1);
    }

    #[tokio::test]
    async fn page_with_known_cookie_sets_no_cookie() {
        let app = app();
        let session = app.scopes().sessions().resolve(None).id;
        let request = Request::builder()
            .uri("/")
            .header(header::COOKIE, format!("other=1; tabsync_session={session}"))
            .body(Body::empty())
            .expect("request should build");
        let response = router(app).oneshot(request).await.expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn unknown_page_is_not_found() {
        let response = router(app()).oneshot(get("/missing")).await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn action_is_acknowledged_and_patch_is_queued() {
        let app = app();
        let page = app.render_page("/", None).expect("page should render");
        let response = router(app.clone())
            .oneshot(get(&action_uri("increment", &page.connection_id)))
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.is_empty());

        let conn = app.connection(&page.connection_id).expect("connection should be live");
        assert_eq!(
            conn.try_recv_patch(),
            Some(Patch::Elements("<div id=\"counter\"><p>count=1</p></div>".into()))
        );
    }

    #[tokio::test]
    async fn action_on_expired_connection_is_still_ok() {
        let response = router(app())
            .oneshot(get(&action_uri("increment", "gone")))
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_action_payload_is_bad_request() {
        let response = router(app())
            .oneshot(get("/_action/increment?payload=nope"))
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = router(app())
            .oneshot(get("/_action/increment"))
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_channel_for_unknown_connection_is_not_found() {
        let response = router(app()).oneshot(get("/_sse?tab=nope")).await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn push_channel_streams_queued_patches() {
        let app = app();
        let page = app.render_page("/", None).expect("page should render");
        app.dispatch(
            "increment",
            &json!({ "_tab": page.connection_id }).to_string(),
        )
        .expect("payload should parse");

        let response = router(app.clone())
            .oneshot(get(&format!("/_sse?tab={}", page.connection_id)))
            .await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("header should be present"),
            "text/event-stream"
        );

        let mut frames = response.into_body().into_data_stream();
        let frame = frames.next().await.expect("stream should yield a frame")
            .expect("frame should be readable");
        let frame = String::from_utf8(frame.to_vec()).expect("frame should be utf-8");
        assert!(frame.contains("event: patch-elements"));
        assert!(frame.contains("data: elements <div id=\"counter\"><p>count=1</p></div>"));
    }

    #[tokio::test]
    async fn close_removes_connection() {
        let app = app();
        let page = app.render_page("/", None).expect("page should render");
        let request = Request::builder()
            .method("POST")
            .uri("/_session/close")
            .body(Body::from(page.connection_id.clone()))
            .expect("request should build");
        let response = router(app.clone()).oneshot(request).await
            .expect("request should be served");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.connection(&page.connection_id).is_none());
    }

    #[test]
    fn wire_data_prefixes_every_line() {
        assert_eq!(
            wire_data(&Patch::Elements("<p>\n1</p>".into())),
            "elements <p>\nelements 1</p>"
        );
        assert_eq!(wire_data(&Patch::Script("go()".into())), "script go()");
        let mut signals = Map::new();
        signals.insert("n".into(), json!(2));
        assert_eq!(wire_data(&Patch::Signals(signals)), "signals {\"n\":2}");
    }

    #[test]
    fn carriage_returns_split_lines_instead_of_reaching_the_event() {
        let elements = Patch::Elements("<p>a\rb</p>".into());
        assert_eq!(wire_data(&elements), "elements <p>a\nelements b</p>");
        let _ = sse_event(&elements);

        let script = Patch::Script("a()\rb()\r\nc()".into());
        assert_eq!(wire_data(&script), "script a()\nscript b()\nscript c()");
        let _ = sse_event(&script);
    }

    #[test]
    fn cookie_parsing_picks_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, "a=1; sid=abc ; b=2".parse()
            .expect("header value should parse"));
        assert_eq!(session_cookie(&headers, "sid"), Some("abc"));
        assert_eq!(session_cookie(&headers, "zzz"), None);
    }
}
