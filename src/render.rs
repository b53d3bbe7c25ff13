//! Citation rendering: composed answer → safe, renderable markup.
//!
//! Steps, in order:
//!
//! 1. Citation markers (`<article ref="N"/>`) are swapped for private-use
//!    sentinels so they survive escaping. Ranks outside the retrieved set
//!    and repeat citations of one rank are removed here.
//! 2. The answer's markdown subset is converted to HTML; all text is
//!    escaped first, so model output can never inject raw markup. A
//!    paragraph is closed before each remaining sentinel and reopened
//!    after it, so the expansion never lands inside `<p>`.
//! 3. Each sentinel is replaced with the cited document's full text,
//!    rendered the same way.
//! 4. Every `kb-image:` reference belonging to a retrieved document gets a
//!    freshly signed link; references to any other key are removed.
//! 5. The sanitizer runs last over the whole result.

use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::debug;

use crate::content::IMAGE_SCHEME;
use crate::error::Result;
use crate::models::{ComposedAnswer, RenderedAnswer, RetrievedDocument};
use crate::retry::with_timeout;
use crate::sanitize::{escape_html, sanitize};
use crate::traits::ObjectStore;

const SENTINEL_OPEN: char = '\u{E000}';
const SENTINEL_CLOSE: char = '\u{E001}';

static CITATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<article\s+ref\s*=\s*["']?\s*(\d+)\s*["']?\s*/?>(?:\s*</article>)?"#)
        .expect("valid regex")
});
static SENTINEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{E000}(\\d+)\u{E001}").expect("valid regex"));
static IMAGE_SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r#"src="{}([^"]*)""#, regex::escape(IMAGE_SCHEME))).expect("valid regex")
});
static IMAGE_MD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));
static LINK_MD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("valid regex"));
static BOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+?)\*\*").expect("valid regex"));
static EM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s][^*]*?)\*").expect("valid regex"));
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").expect("valid regex"));
static ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)([-*]|\d+\.)\s+(.*)$").expect("valid regex"));

pub struct CitationRenderer {
    store: Arc<dyn ObjectStore>,
    link_expiry: Duration,
    call_timeout: Duration,
}

impl CitationRenderer {
    pub fn new(store: Arc<dyn ObjectStore>, link_expiry: Duration, call_timeout: Duration) -> Self {
        Self {
            store,
            link_expiry,
            call_timeout,
        }
    }

    pub async fn render(
        &self,
        answer: &ComposedAnswer,
        docs: &[RetrievedDocument],
    ) -> Result<RenderedAnswer> {
        let marked = select_citations(&mark_citations(&answer.text), docs);
        let html = markdown_to_html(&marked);
        let expanded = expand_citations(&html, docs);
        let (linked, unknown_images) = self.sign_images(&expanded, docs).await?;
        let sanitized = sanitize(&linked);

        Ok(RenderedAnswer {
            markup: sanitized.html,
            dropped_fragments: sanitized.dropped + unknown_images,
        })
    }

    /// Replace `kb-image:` sources with signed links. Returns the markup and
    /// the number of references removed because no retrieved document owns
    /// the key.
    async fn sign_images(
        &self,
        html: &str,
        docs: &[RetrievedDocument],
    ) -> Result<(String, usize)> {
        let known: HashSet<&str> = docs
            .iter()
            .flat_map(|d| d.image_keys.iter().map(String::as_str))
            .collect();

        let mut out = String::with_capacity(html.len());
        let mut last = 0;
        let mut removed = 0;
        for caps in IMAGE_SRC_RE.captures_iter(html) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&html[last..whole.start()]);
            last = whole.end();

            let key = unescape_attr(&caps[1]);
            if !known.contains(key.as_str()) {
                debug!(key = %key, "image reference not owned by a retrieved document");
                removed += 1;
                continue;
            }
            // Fresh per render; links are never cached.
            let url = with_timeout(
                self.call_timeout,
                "signed link",
                self.store.signed_url(&key, self.link_expiry),
            )
            .await?;
            out.push_str("src=\"");
            out.push_str(&escape_html(&url));
            out.push('"');
        }
        out.push_str(&html[last..]);
        Ok((out, removed))
    }
}

fn unescape_attr(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Swap citation markers for sentinels carrying the rank.
pub fn mark_citations(text: &str) -> String {
    // Stray sentinel characters in model output must not become citations.
    let cleaned: String = text
        .chars()
        .filter(|c| *c != SENTINEL_OPEN && *c != SENTINEL_CLOSE)
        .collect();
    CITATION_RE
        .replace_all(&cleaned, |caps: &Captures| {
            format!("{}{}{}", SENTINEL_OPEN, &caps[1], SENTINEL_CLOSE)
        })
        .into_owned()
}

/// Keep the first sentinel of each retrieved rank; remove the rest.
fn select_citations(marked: &str, docs: &[RetrievedDocument]) -> String {
    let mut seen = HashSet::new();
    SENTINEL_RE
        .replace_all(marked, |caps: &Captures| {
            match caps[1].parse::<usize>() {
                Ok(rank) if docs.iter().any(|d| d.rank == rank) => {
                    if seen.insert(rank) {
                        caps[0].to_string()
                    } else {
                        String::new()
                    }
                }
                _ => {
                    let raw = &caps[1];
                    debug!(rank = raw, "citation outside retrieved set dropped");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn expand_citations(html: &str, docs: &[RetrievedDocument]) -> String {
    SENTINEL_RE
        .replace_all(html, |caps: &Captures| {
            let rank = caps[1].parse::<usize>().ok();
            let Some(doc) = docs.iter().find(|d| Some(d.rank) == rank) else {
                return String::new();
            };
            format!(
                "<div class=\"cited-document\"><h4>{}</h4>{}</div>",
                escape_html(&doc.title),
                markdown_to_html(&doc.text)
            )
        })
        .into_owned()
}

// ============ Markdown subset ============

#[derive(Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Bullet,
    Ordered,
}

impl ListKind {
    fn tag(self) -> &'static str {
        match self {
            ListKind::Bullet => "ul",
            ListKind::Ordered => "ol",
        }
    }
}

#[derive(Default)]
struct HtmlBuilder {
    out: String,
    paragraph: Vec<String>,
    lists: Vec<(ListKind, usize)>,
    table: Vec<Vec<String>>,
}

impl HtmlBuilder {
    fn flush_paragraph(&mut self) {
        if self.paragraph.is_empty() {
            return;
        }
        self.out.push_str("<p>");
        self.out.push_str(&self.paragraph.join("<br>"));
        self.out.push_str("</p>");
        self.paragraph.clear();
    }

    fn close_lists_deeper_than(&mut self, indent: Option<usize>) {
        while let Some(&(kind, level)) = self.lists.last() {
            if indent.is_some_and(|i| level <= i) {
                break;
            }
            self.out.push_str("</li></");
            self.out.push_str(kind.tag());
            self.out.push('>');
            self.lists.pop();
        }
    }

    fn flush_table(&mut self) {
        if self.table.is_empty() {
            return;
        }
        self.out.push_str("<table>");
        for row in self.table.drain(..) {
            self.out.push_str("<tr>");
            for cell in row {
                self.out.push_str("<td>");
                self.out.push_str(&cell);
                self.out.push_str("</td>");
            }
            self.out.push_str("</tr>");
        }
        self.out.push_str("</table>");
    }

    fn flush_all(&mut self) {
        self.flush_paragraph();
        self.close_lists_deeper_than(None);
        self.flush_table();
    }

    fn list_item(&mut self, indent: usize, kind: ListKind, content: String) {
        self.flush_paragraph();
        self.flush_table();
        self.close_lists_deeper_than(Some(indent));

        match self.lists.last().copied() {
            Some((top_kind, level)) if level == indent && top_kind == kind => {
                self.out.push_str("</li><li>");
            }
            Some((top_kind, level)) if level == indent => {
                self.out.push_str("</li></");
                self.out.push_str(top_kind.tag());
                self.out.push('>');
                self.lists.pop();
                self.open_list(kind, indent);
            }
            _ => self.open_list(kind, indent),
        }
        self.out.push_str(&content);
    }

    /// Add a line of paragraph text, closing the paragraph around each
    /// citation sentinel.
    fn paragraph_line(&mut self, line: &str) {
        let mut last = 0;
        for m in SENTINEL_RE.find_iter(line) {
            self.paragraph_segment(&line[last..m.start()]);
            self.flush_paragraph();
            self.out.push_str(m.as_str());
            last = m.end();
        }
        self.paragraph_segment(&line[last..]);
    }

    fn paragraph_segment(&mut self, text: &str) {
        let text = text.trim();
        if !text.is_empty() {
            self.paragraph.push(inline(text));
        }
    }

    fn open_list(&mut self, kind: ListKind, indent: usize) {
        self.out.push('<');
        self.out.push_str(kind.tag());
        self.out.push_str("><li>");
        self.lists.push((kind, indent));
    }
}

/// Convert the answer markdown subset to HTML.
///
/// Supports `#` headings, `-`/`*`/`1.` lists (nested by indentation),
/// fenced code, `| a | b |` tables, `**bold**`, `*em*`, `` `code` ``,
/// images and links. Consecutive text lines form one paragraph.
pub fn markdown_to_html(text: &str) -> String {
    let mut b = HtmlBuilder::default();
    let mut fence: Option<Vec<String>> = None;

    for line in text.lines() {
        if let Some(code) = fence.as_mut() {
            if line.trim_start().starts_with("```") {
                b.out.push_str("<pre><code>");
                b.out.push_str(&escape_html(&code.join("\n")));
                b.out.push_str("</code></pre>");
                fence = None;
            } else {
                code.push(line.to_string());
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            b.flush_all();
            fence = Some(Vec::new());
            continue;
        }
        if trimmed.is_empty() {
            b.flush_all();
            continue;
        }
        if let Some(caps) = HEADING_RE.captures(trimmed) {
            b.flush_all();
            let level = caps[1].len();
            let title = SENTINEL_RE.replace_all(&caps[2], "");
            b.out.push_str(&format!("<h{}>{}</h{}>", level, inline(title.trim()), level));
            // Citations in a heading expand after it.
            for m in SENTINEL_RE.find_iter(&caps[2]) {
                b.out.push_str(m.as_str());
            }
            continue;
        }
        if let Some(caps) = ITEM_RE.captures(line) {
            let indent = caps[1].chars().count();
            let kind = if caps[2].ends_with('.') {
                ListKind::Ordered
            } else {
                ListKind::Bullet
            };
            b.list_item(indent, kind, inline(&caps[3]));
            continue;
        }
        if trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 1 {
            b.flush_paragraph();
            b.close_lists_deeper_than(None);
            let inner = &trimmed[1..trimmed.len() - 1];
            if inner.chars().all(|c| matches!(c, '-' | ':' | '|' | ' ')) {
                continue;
            }
            let cells = inner.split('|').map(|c| inline(c.trim())).collect();
            b.table.push(cells);
            continue;
        }

        b.close_lists_deeper_than(None);
        b.flush_table();
        b.paragraph_line(trimmed);
    }

    if let Some(code) = fence {
        b.out.push_str("<pre><code>");
        b.out.push_str(&escape_html(&code.join("\n")));
        b.out.push_str("</code></pre>");
    }
    b.flush_all();
    b.out
}

/// Inline formatting on one line. Text inside backticks is left literal.
fn inline(text: &str) -> String {
    let mut out = String::new();
    let mut parts = text.split('`').peekable();
    let mut in_code = false;
    while let Some(part) = parts.next() {
        if in_code {
            if parts.peek().is_some() || text.ends_with('`') {
                out.push_str("<code>");
                out.push_str(&escape_html(part));
                out.push_str("</code>");
            } else {
                // Unclosed backtick: keep it literal.
                out.push('`');
                out.push_str(&format_span(part));
            }
        } else {
            out.push_str(&format_span(part));
        }
        in_code = !in_code;
    }
    out
}

fn format_span(text: &str) -> String {
    let escaped = escape_html(text);
    let with_images = IMAGE_MD_RE.replace_all(&escaped, r#"<img src="$2" alt="$1">"#);
    let with_links = LINK_MD_RE.replace_all(&with_images, r#"<a href="$2">$1</a>"#);
    let bold = BOLD_RE.replace_all(&with_links, "<strong>$1</strong>");
    EM_RE.replace_all(&bold, "<em>$1</em>").into_owned()
}
