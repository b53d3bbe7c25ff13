//! Wiki storage-format markup → normalized plain text.
//!
//! [`transform`] is a pure function: it performs no I/O and the same input
//! always yields byte-identical output. Only the subset of the storage
//! format needed for text-and-image question answering is understood.
//!
//! # Conversions
//!
//! | Markup | Output |
//! |--------|--------|
//! | `<h1>`..`<h6>` | `#`..`######` headings |
//! | `<ul>/<li>` | `- item` (nested lists indent two spaces) |
//! | `<ol>/<li>` | `1. item` |
//! | `<strong>`, `<em>`, `<code>` | `**b**`, `*i*`, `` `c` `` |
//! | `<pre>`, code macro | fenced block |
//! | `<table>` | one `| a | b |` line per row |
//! | `<ac:image>` + `<ri:attachment>` | placeholder token, see [`placeholder_token`] |
//! | `<ac:link>` | link body, or the target page title |
//! | info/note/warning/tip macros | `[INFO]` label + body |
//! | other macros | rich-text body only, or nothing |
//!
//! Placeholders are numbered from 1 in document order. Their delimiters
//! are private-use characters stripped from page text, so a token can only
//! come from an image and appears exactly once.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{KbError, Result};
use crate::models::ImagePlaceholder;

const TOKEN_OPEN: char = '\u{E000}';
const TOKEN_CLOSE: char = '\u{E001}';

/// URI scheme of relocated image references in normalized text.
pub const IMAGE_SCHEME: &str = "kb-image:";

/// Normalized text plus the images it references, in output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed {
    pub text: String,
    pub placeholders: Vec<ImagePlaceholder>,
}

/// Transform raw storage markup into normalized text.
///
/// Fails with [`KbError::MalformedContent`] when the markup is not
/// well-formed (mismatched or unclosed elements, broken attributes).
pub fn transform(raw: &str) -> Result<Transformed> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = true;

    let mut p = Processor::default();

    loop {
        let event = reader.read_event().map_err(|e| {
            KbError::MalformedContent(format!(
                "at byte {}: {}",
                reader.buffer_position(),
                e
            ))
        })?;
        match event {
            Event::Start(e) => p.start(&e)?,
            Event::Empty(e) => {
                p.start(&e)?;
                p.end();
            }
            Event::End(_) => p.end(),
            Event::Text(t) => {
                let text = t
                    .unescape_with(resolve_entity)
                    .map_err(|e| KbError::MalformedContent(e.to_string()))?;
                p.text(&text);
            }
            Event::CData(c) => p.text(&String::from_utf8_lossy(&c)),
            Event::Eof => break,
            _ => {}
        }
    }

    if p.skip_depth > 0 || !p.frames.is_empty() {
        return Err(KbError::MalformedContent(
            "unexpected end of markup: unclosed element".to_string(),
        ));
    }

    Ok(Transformed {
        text: finish(&p.w.out),
        placeholders: p.placeholders,
    })
}

/// The token left in normalized text for the `n`th image (1-based).
pub fn placeholder_token(n: usize) -> String {
    format!("{}image:{}{}", TOKEN_OPEN, n, TOKEN_CLOSE)
}

fn is_reserved(c: char) -> bool {
    c == TOKEN_OPEN || c == TOKEN_CLOSE
}

/// Text to substitute for a placeholder token.
pub fn image_reference(alt: &str, key: &str) -> String {
    format!("![{}]({}{})", markdown_label(alt), IMAGE_SCHEME, key)
}

/// Strip characters that would break a markdown link label.
pub fn markdown_label(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '[' | ']' | '\n' | '\r') && !is_reserved(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

// ============ Output writer ============

#[derive(Default)]
struct Writer {
    out: String,
    pending_space: bool,
}

impl Writer {
    fn at_line_start(&self) -> bool {
        self.out.is_empty() || self.out.ends_with('\n')
    }

    fn flush_space(&mut self) {
        if self.pending_space && !self.at_line_start() && !self.out.ends_with(' ') {
            self.out.push(' ');
        }
        self.pending_space = false;
    }

    /// Flowing text: whitespace runs collapse to one space.
    fn text(&mut self, s: &str) {
        for ch in s.chars().filter(|c| !is_reserved(*c)) {
            if ch.is_whitespace() {
                self.pending_space = true;
            } else {
                self.flush_space();
                self.out.push(ch);
            }
        }
    }

    fn raw(&mut self, s: &str) {
        self.pending_space = false;
        self.out.push_str(s);
    }

    fn open_inline(&mut self, marker: &str) {
        self.flush_space();
        self.out.push_str(marker);
    }

    fn close_inline(&mut self, marker: &str) {
        self.out.push_str(marker);
    }

    fn line_break(&mut self) {
        self.pending_space = false;
        if !self.at_line_start() {
            self.out.push('\n');
        }
    }

    fn block_break(&mut self) {
        self.line_break();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }
}

// ============ Element handling ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Container,
    Block,
    Heading,
    Inline(&'static str),
    List,
    ListItem,
    Pre,
    Table,
    Row,
    Cell,
    Image,
    Link,
    Macro,
    CodeBody,
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Unordered,
    Ordered(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacroKind {
    Code,
    Callout,
    Other,
}

struct ImageCtx {
    alt: String,
    filename: Option<String>,
}

struct LinkCtx {
    start: usize,
    fallback: Option<String>,
}

#[derive(Default)]
struct Processor {
    w: Writer,
    frames: Vec<Frame>,
    skip_depth: usize,
    lists: Vec<ListKind>,
    pre_depth: usize,
    macros: Vec<MacroKind>,
    rows: Vec<Vec<String>>,
    cells: Vec<usize>,
    image: Option<ImageCtx>,
    link: Option<LinkCtx>,
    placeholders: Vec<ImagePlaceholder>,
}

impl Processor {
    fn start(&mut self, e: &BytesStart) -> Result<()> {
        if self.skip_depth > 0 {
            self.skip_depth += 1;
            return Ok(());
        }

        let name = String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
        let frame = match name.as_str() {
            "p" | "div" | "blockquote" => {
                if self.lists.is_empty() {
                    self.w.block_break();
                    Frame::Block
                } else {
                    Frame::Container
                }
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                let level = name[1..].parse::<usize>().unwrap_or(1);
                self.w.block_break();
                self.w.raw(&format!("{} ", "#".repeat(level)));
                Frame::Heading
            }
            "ul" | "ac:task-list" => {
                self.w.line_break();
                self.lists.push(ListKind::Unordered);
                Frame::List
            }
            "ol" => {
                self.w.line_break();
                self.lists.push(ListKind::Ordered(0));
                Frame::List
            }
            "li" | "ac:task" => {
                self.w.line_break();
                let indent = "  ".repeat(self.lists.len().saturating_sub(1));
                let marker = match self.lists.last_mut() {
                    Some(ListKind::Ordered(n)) => {
                        *n += 1;
                        format!("{}. ", n)
                    }
                    _ => "- ".to_string(),
                };
                self.w.raw(&format!("{}{}", indent, marker));
                Frame::ListItem
            }
            "strong" | "b" => self.inline("**"),
            "em" | "i" => self.inline("*"),
            "code" => self.inline("`"),
            "pre" => {
                self.w.block_break();
                self.w.raw("```\n");
                self.pre_depth += 1;
                Frame::Pre
            }
            "br" => {
                if self.pre_depth > 0 {
                    self.w.raw("\n");
                } else {
                    self.w.line_break();
                }
                Frame::Container
            }
            "hr" => {
                self.w.block_break();
                self.w.raw("---");
                self.w.block_break();
                Frame::Container
            }
            "table" => {
                self.w.block_break();
                Frame::Table
            }
            "tr" => {
                self.rows.push(Vec::new());
                Frame::Row
            }
            "th" | "td" => {
                self.w.pending_space = false;
                self.cells.push(self.w.out.len());
                Frame::Cell
            }
            "ac:image" => {
                let alt = attr(e, "ac:alt")?
                    .or(attr(e, "ac:title")?)
                    .unwrap_or_default();
                self.image = Some(ImageCtx {
                    alt,
                    filename: None,
                });
                Frame::Image
            }
            "ri:attachment" => {
                let filename = attr(e, "ri:filename")?;
                if let Some(image) = self.image.as_mut() {
                    image.filename = filename;
                } else if let Some(link) = self.link.as_mut() {
                    link.fallback = link.fallback.take().or(filename);
                }
                Frame::Container
            }
            "ri:page" => {
                let title = attr(e, "ri:content-title")?;
                if let Some(link) = self.link.as_mut() {
                    link.fallback = title;
                }
                Frame::Container
            }
            "ac:link" => {
                self.link = Some(LinkCtx {
                    start: self.w.out.len(),
                    fallback: None,
                });
                Frame::Link
            }
            "ac:structured-macro" | "ac:macro" => {
                let macro_name = attr(e, "ac:name")?
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let kind = match macro_name.as_str() {
                    "code" | "noformat" => {
                        self.w.block_break();
                        MacroKind::Code
                    }
                    "info" | "note" | "warning" | "tip" => {
                        self.w.block_break();
                        self.w.raw(&format!("[{}]", macro_name.to_ascii_uppercase()));
                        self.w.line_break();
                        MacroKind::Callout
                    }
                    _ => MacroKind::Other,
                };
                self.macros.push(kind);
                Frame::Macro
            }
            "ac:plain-text-body" => {
                if self.macros.last() == Some(&MacroKind::Code) {
                    self.w.raw("```\n");
                    self.pre_depth += 1;
                    Frame::CodeBody
                } else {
                    return self.skip();
                }
            }
            "ac:parameter" | "ac:caption" | "ac:placeholder" | "ac:emoticon"
            | "ac:task-id" | "ac:task-uuid" | "ac:task-status" | "colgroup" | "script"
            | "style" => return self.skip(),
            _ => Frame::Container,
        };

        self.frames.push(frame);
        Ok(())
    }

    fn inline(&mut self, marker: &'static str) -> Frame {
        if self.pre_depth > 0 {
            return Frame::Container;
        }
        self.w.open_inline(marker);
        Frame::Inline(marker)
    }

    fn skip(&mut self) -> Result<()> {
        self.skip_depth = 1;
        Ok(())
    }

    fn end(&mut self) {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }
        let Some(frame) = self.frames.pop() else {
            return;
        };

        match frame {
            Frame::Container => {}
            Frame::Block | Frame::Heading | Frame::Table => self.w.block_break(),
            Frame::Inline(marker) => self.w.close_inline(marker),
            Frame::List => {
                self.lists.pop();
                self.w.line_break();
                if self.lists.is_empty() {
                    self.w.block_break();
                }
            }
            Frame::ListItem => self.w.line_break(),
            Frame::Pre | Frame::CodeBody => {
                if !self.w.out.ends_with('\n') {
                    self.w.raw("\n");
                }
                self.w.raw("```");
                self.pre_depth = self.pre_depth.saturating_sub(1);
                if frame == Frame::Pre {
                    self.w.block_break();
                }
            }
            Frame::Row => {
                let cells = self.rows.pop().unwrap_or_default();
                if !cells.is_empty() {
                    self.w.line_break();
                    self.w.raw(&format!("| {} |", cells.join(" | ")));
                    self.w.line_break();
                }
            }
            Frame::Cell => {
                let start = self.cells.pop().unwrap_or(self.w.out.len());
                let content = self
                    .w
                    .out
                    .get(start..)
                    .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
                    .unwrap_or_default();
                self.w.out.truncate(start);
                self.w.pending_space = false;
                match self.rows.last_mut() {
                    Some(row) => row.push(content),
                    None => self.w.text(&content),
                }
            }
            Frame::Image => {
                if let Some(image) = self.image.take() {
                    match image.filename {
                        Some(filename) => {
                            let token = placeholder_token(self.placeholders.len() + 1);
                            self.w.open_inline(&token);
                            self.placeholders.push(ImagePlaceholder {
                                token,
                                filename,
                                alt: image.alt,
                            });
                        }
                        None => self.w.text(&image.alt),
                    }
                }
            }
            Frame::Link => {
                if let Some(link) = self.link.take() {
                    if self.w.out.len() == link.start {
                        if let Some(title) = link.fallback {
                            self.w.text(&title);
                        }
                    }
                }
            }
            Frame::Macro => {
                if let Some(MacroKind::Code | MacroKind::Callout) = self.macros.pop() {
                    self.w.block_break();
                }
            }
        }
    }

    fn text(&mut self, s: &str) {
        if self.skip_depth > 0 || self.image.is_some() {
            return;
        }
        if self.pre_depth > 0 {
            let literal: String = s.chars().filter(|c| !is_reserved(*c)).collect();
            self.w.raw(&literal);
        } else {
            self.w.text(s);
        }
    }
}

fn attr(e: &BytesStart, key: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| KbError::MalformedContent(err.to_string()))?;
        if a.key.as_ref().eq_ignore_ascii_case(key.as_bytes()) {
            let value = a
                .unescape_value_with(resolve_entity)
                .map_err(|err| KbError::MalformedContent(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Named entities that appear in storage format beyond the XML five.
/// Unknown names resolve to nothing rather than failing the page.
fn resolve_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "lt" => "<",
        "gt" => ">",
        "amp" => "&",
        "quot" => "\"",
        "apos" => "'",
        "nbsp" | "ensp" | "emsp" | "thinsp" => " ",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "laquo" => "\u{ab}",
        "raquo" => "\u{bb}",
        "bull" => "\u{2022}",
        "middot" => "\u{b7}",
        "copy" => "\u{a9}",
        "reg" => "\u{ae}",
        "trade" => "\u{2122}",
        "deg" => "\u{b0}",
        "times" => "\u{d7}",
        "divide" => "\u{f7}",
        "plusmn" => "\u{b1}",
        "euro" => "\u{20ac}",
        "pound" => "\u{a3}",
        "larr" => "\u{2190}",
        "rarr" => "\u{2192}",
        "uarr" => "\u{2191}",
        "darr" => "\u{2193}",
        "sect" => "\u{a7}",
        "para" => "\u{b6}",
        _ => "",
    })
}

/// Trim line ends, collapse blank-line runs to one, trim the whole.
fn finish(out: &str) -> String {
    let mut result = String::with_capacity(out.len());
    let mut blank_run = 0;
    for line in out.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        result.push_str(line);
        result.push('\n');
    }
    result.trim().to_string()
}
