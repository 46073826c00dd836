//! The renderable-tree boundary.
//!
//! The engine never looks inside what a view returns. It only needs bytes,
//! and it wraps each view's output in a root element carrying the
//! composition id so the client can match fragments to their place in the
//! page.

use std::borrow::Cow;

/// Anything a view function can return.
pub trait Render {
    /// Serialize the tree to HTML bytes.
    fn render(&self) -> Vec<u8>;
}

impl Render for String {
    fn render(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Render for &str {
    fn render(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Render for Cow<'_, str> {
    fn render(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Render for Vec<u8> {
    fn render(&self) -> Vec<u8> {
        self.clone()
    }
}

impl<T: Render + ?Sized> Render for Box<T> {
    fn render(&self) -> Vec<u8> {
        (**self).render()
    }
}

/// Wrap rendered view output in the root element for `id`.
pub(crate) fn wrap_root(id: &str, body: &[u8]) -> String {
    format!(
        "<div id=\"{}\">{}</div>",
        escape_attr(id),
        String::from_utf8_lossy(body)
    )
}

/// The full HTML document served on the initial page load.
///
/// The connection id is exposed on `<body>` so the client library can open
/// the push channel and tag action requests with it.
pub(crate) fn page_shell(connection_id: &str, client_script: Option<&str>, root: &str) -> String {
    let connection_id = escape_attr(connection_id);
    let script = client_script
        .map(|src| format!("<script type=\"module\" src=\"{}\"></script>", escape_attr(src)))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"tabsync-connection\" content=\"{connection_id}\">{script}</head>\
         <body data-tabsync-connection=\"{connection_id}\">{root}</body></html>"
    )
}

fn escape_attr(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['&', '"', '<', '>']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}
