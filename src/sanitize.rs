//! Cleaning of untrusted text and URLs coming back from the places API.
//!
//! Markup is parsed with html5ever (through `scraper`) and rebuilt from the
//! tree, so nothing the tokenizer saw as a tag can reach the output unless it
//! is on the allow-list. Text nodes are re-encoded on the way out.

use html_escape::encode_text;
use reqwest::Url;
use scraper::{ElementRef, Html, Node};

/// Formatting tags kept in review bodies. Attributes are always dropped.
const ALLOWED_BODY_TAGS: &[&str] = &[
    "p", "br", "b", "strong", "i", "em", "u", "ul", "ol", "li", "blockquote",
];

/// Elements removed together with everything inside them.
const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "noscript", "template",
];

const VOID_TAGS: &[&str] = &["br"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Output {
    Plain,
    Rich,
}

/// Single-line field: all markup removed, whitespace collapsed, trimmed.
/// The result is raw text; callers escape it when rendering.
pub fn plain_text(input: &str) -> String {
    let mut out = String::new();
    walk(parse(input), Output::Plain, &mut out);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Multi-line body: script-like elements removed entirely, a short list of
/// formatting tags kept without attributes, every other tag unwrapped and
/// all text entity-encoded.
pub fn rich_text(input: &str) -> String {
    let mut out = String::new();
    walk(parse(input), Output::Rich, &mut out);
    out.trim().to_string()
}

/// Accepts only absolute http(s) URLs with a host; anything else maps to `None`.
pub fn http_url(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let url = Url::parse(trimmed).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url.to_string()),
        _ => None,
    }
}

fn parse(input: &str) -> Html {
    Html::parse_fragment(input)
}

fn walk(fragment: Html, mode: Output, out: &mut String) {
    write_children(fragment.root_element(), mode, out);
}

fn write_children(element: ElementRef<'_>, mode: Output, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => match mode {
                Output::Plain => out.push_str(text),
                Output::Rich => out.push_str(&encode_text(&**text)),
            },
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    write_element(child, mode, out);
                }
            }
            _ => {}
        }
    }
}

fn write_element(element: ElementRef<'_>, mode: Output, out: &mut String) {
    let name = element.value().name().to_ascii_lowercase();
    if DROPPED_ELEMENTS.contains(&name.as_str()) {
        return;
    }

    let keep = mode == Output::Rich && ALLOWED_BODY_TAGS.contains(&name.as_str());
    if !keep {
        write_children(element, mode, out);
        return;
    }

    out.push('<');
    out.push_str(&name);
    out.push('>');
    if VOID_TAGS.contains(&name.as_str()) {
        return;
    }
    write_children(element, mode, out);
    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}
