//! Allow-list HTML sanitizer.
//!
//! Input is parsed as an HTML5 fragment with `scraper` (html5ever), so the
//! tree we walk is the tree a browser would build: mixed-case tags,
//! entity-encoded attribute values and unclosed elements are normalized
//! before any decision is made. Output is re-serialized from scratch; only
//! allow-listed tags and attributes are ever written.
//!
//! | Input | Result |
//! |-------|--------|
//! | allow-listed tag | kept, with allow-listed attributes only |
//! | `script`, `style`, `iframe`, `object`, `embed`, `noscript`, `template` | removed with its subtree |
//! | any other tag | unwrapped (children kept) |
//! | `on*` / unlisted attribute | removed |
//! | `href`/`src` with a scheme other than http(s) (or mailto for `href`) | removed |
//! | comments, processing instructions | removed |
//!
//! Every removed tag or attribute counts as one dropped fragment.

use scraper::node::Node;
use scraper::{ElementRef, Html};
use tracing::warn;

use crate::error::KbError;

const ALLOWED_TAGS: &[&str] = &[
    "p", "br", "strong", "em", "b", "i", "u", "ul", "ol", "li", "h1", "h2", "h3", "h4", "h5",
    "h6", "a", "img", "div", "span", "code", "pre", "blockquote", "table", "thead", "tbody", "tr",
    "th", "td",
];

const DROP_SUBTREE: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template",
];

const VOID_TAGS: &[&str] = &["br", "img"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub html: String,
    pub dropped: usize,
}

pub fn sanitize(html: &str) -> Sanitized {
    let fragment = Html::parse_fragment(html);
    let mut out = Sanitizer {
        html: String::with_capacity(html.len()),
        dropped: 0,
    };
    out.children(fragment.root_element());
    Sanitized {
        html: out.html,
        dropped: out.dropped,
    }
}

fn allowed_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "a" => &["href", "title"],
        "img" => &["src", "alt"],
        "div" | "span" => &["class"],
        _ => &[],
    }
}

/// Whether a URL attribute value is safe to emit.
///
/// Relative references are allowed. Browsers ignore ASCII whitespace and
/// control characters inside a scheme (`java\tscript:`), so those are
/// stripped before the scheme is read.
fn url_allowed(value: &str, allow_mailto: bool) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_ascii_control() && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    let scheme_end = normalized.find(':');
    let path_start = normalized.find(['/', '?', '#']);
    match (scheme_end, path_start) {
        (Some(colon), Some(path)) if path < colon => true,
        (Some(colon), _) => {
            let scheme = &normalized[..colon];
            scheme == "http" || scheme == "https" || (allow_mailto && scheme == "mailto")
        }
        (None, _) => true,
    }
}

struct Sanitizer {
    html: String,
    dropped: usize,
}

impl Sanitizer {
    fn drop_fragment(&mut self, what: String) {
        self.dropped += 1;
        warn!(error = %KbError::SanitizationViolation(what), "dropped unsafe markup");
    }

    fn children(&mut self, parent: ElementRef<'_>) {
        for child in parent.children() {
            match child.value() {
                Node::Text(text) => escape_into(&mut self.html, text, false),
                Node::Element(_) => {
                    if let Some(el) = ElementRef::wrap(child) {
                        self.element(el);
                    }
                }
                _ => {}
            }
        }
    }

    fn element(&mut self, el: ElementRef<'_>) {
        let tag = el.value().name().to_ascii_lowercase();

        if DROP_SUBTREE.contains(&tag.as_str()) {
            self.drop_fragment(format!("<{}> element", tag));
            return;
        }
        if !ALLOWED_TAGS.contains(&tag.as_str()) {
            self.drop_fragment(format!("<{}> tag unwrapped", tag));
            self.children(el);
            return;
        }

        let allowed = allowed_attributes(&tag);
        for (name, _) in el.value().attrs() {
            if !allowed.contains(&name) {
                self.drop_fragment(format!("{} attribute on <{}>", name, tag));
            }
        }

        self.html.push('<');
        self.html.push_str(&tag);
        for name in allowed {
            let Some(value) = el.value().attr(name) else {
                continue;
            };
            let is_url = matches!(*name, "href" | "src");
            if is_url && !url_allowed(value, *name == "href") {
                self.drop_fragment(format!("{} URL on <{}>", name, tag));
                continue;
            }
            self.html.push(' ');
            self.html.push_str(name);
            self.html.push_str("=\"");
            escape_into(&mut self.html, value, true);
            self.html.push('"');
        }
        self.html.push('>');

        if VOID_TAGS.contains(&tag.as_str()) {
            return;
        }
        self.children(el);
        self.html.push_str("</");
        self.html.push_str(&tag);
        self.html.push('>');
    }
}

pub fn escape_into(out: &mut String, text: &str, attribute: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    escape_into(&mut out, text, true);
    out
}
