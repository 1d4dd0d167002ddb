//! # Rich Text
//!
//! Pure `string ⇄ document` conversions used by connectors whose sources store
//! formatted text. Real services plug in their own converter; the
//! [`ParagraphTransform`] here keeps only paragraph structure and basic
//! emphasis.
//!
//! Every conversion accepts empty input and produces an empty paragraph.

use serde_json::{json, Value};

/// Converter between HTML, Markdown and a service's native document JSON.
pub trait RichTextTransform: Send + Sync {
    fn to_markdown(&self, html: &str) -> String;

    fn to_html(&self, markdown: &str) -> String;

    fn to_native_document(&self, html: &str) -> Value;

    fn from_native_document(&self, document: &Value) -> String;
}

/// Paragraph-level converter.
///
/// Native documents look like
/// `{"type": "doc", "content": [{"type": "paragraph", "text": "..."}]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParagraphTransform;

impl RichTextTransform for ParagraphTransform {
    fn to_markdown(&self, html: &str) -> String {
        html_paragraphs(html).join("\n\n")
    }

    fn to_html(&self, markdown: &str) -> String {
        let paragraphs = markdown_paragraphs(markdown);
        if paragraphs.is_empty() {
            return "<p></p>".to_string();
        }
        paragraphs
            .iter()
            .map(|p| format!("<p>{}</p>", inline_markdown_to_html(p)))
            .collect()
    }

    fn to_native_document(&self, html: &str) -> Value {
        let mut paragraphs = html_paragraphs(html);
        if paragraphs.is_empty() {
            paragraphs.push(String::new());
        }
        let content: Vec<Value> = paragraphs
            .into_iter()
            .map(|text| json!({ "type": "paragraph", "text": text }))
            .collect();
        json!({ "type": "doc", "content": content })
    }

    fn from_native_document(&self, document: &Value) -> String {
        let paragraphs: Vec<&str> = document
            .get("content")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|node| node.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();

        if paragraphs.is_empty() {
            return "<p></p>".to_string();
        }
        paragraphs
            .iter()
            .map(|p| format!("<p>{}</p>", inline_markdown_to_html(p)))
            .collect()
    }
}

// =============================================================================
// Helpers
// =============================================================================

const BLOCK_END_TAGS: &[&str] = &["/p", "/div", "/li", "/h1", "/h2", "/h3", "/h4", "/h5", "/h6"];

/// Splits HTML into paragraphs of Markdown-flavoured text.
fn html_paragraphs(html: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        current.push_str(&rest[..start]);
        let Some(len) = rest[start..].find('>') else {
            // Unterminated tag: keep the text as is.
            current.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + len].trim().to_ascii_lowercase();
        let name = tag.split_whitespace().next().unwrap_or("").trim_end_matches('/');

        match name {
            "br" => current.push('\n'),
            "strong" | "b" | "/strong" | "/b" => current.push_str("**"),
            "em" | "i" | "/em" | "/i" => current.push('*'),
            n if BLOCK_END_TAGS.contains(&n) => {
                flush(&mut current, &mut paragraphs);
            }
            _ => {}
        }
        rest = &rest[start + len + 1..];
    }
    current.push_str(rest);
    flush(&mut current, &mut paragraphs);
    paragraphs
}

fn flush(current: &mut String, paragraphs: &mut Vec<String>) {
    let text = unescape_html(current.trim());
    if !text.is_empty() {
        paragraphs.push(text);
    }
    current.clear();
}

fn markdown_paragraphs(markdown: &str) -> Vec<&str> {
    markdown
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn inline_markdown_to_html(text: &str) -> String {
    let escaped = escape_html(text);
    let with_strong = replace_pairs(&escaped, "**", "strong");
    let with_em = replace_pairs(&with_strong, "*", "em");
    with_em.replace('\n', "<br>")
}

/// Replaces balanced `marker` pairs with `<tag>..</tag>`.
fn replace_pairs(text: &str, marker: &str, tag: &str) -> String {
    let parts: Vec<&str> = text.split(marker).collect();
    if parts.len() < 3 {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let closed = parts.len() % 2 == 1;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            let last_unbalanced = !closed && i == parts.len() - 1;
            if last_unbalanced {
                out.push_str(marker);
            } else if i % 2 == 1 {
                out.push_str(&format!("<{}>", tag));
            } else {
                out.push_str(&format!("</{}>", tag));
            }
        }
        out.push_str(part);
    }
    out
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape_html(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_empty_paragraph() {
        let t = ParagraphTransform;
        assert_eq!(t.to_html(""), "<p></p>");
        assert_eq!(t.to_markdown(""), "");
        assert_eq!(
            t.to_native_document(""),
            json!({ "type": "doc", "content": [{ "type": "paragraph", "text": "" }] })
        );
        assert_eq!(t.from_native_document(&Value::Null), "<p></p>");
    }

    #[test]
    fn test_html_to_markdown() {
        let t = ParagraphTransform;
        let md = t.to_markdown("<p>Hello <strong>world</strong></p><p>a &amp; b</p>");
        assert_eq!(md, "Hello **world**\n\na & b");
    }

    #[test]
    fn test_markdown_to_html() {
        let t = ParagraphTransform;
        let html = t.to_html("Hello **world**\n\nUse *care* & <tags>");
        assert_eq!(
            html,
            "<p>Hello <strong>world</strong></p><p>Use <em>care</em> &amp; &lt;tags&gt;</p>"
        );
    }

    #[test]
    fn test_native_document_paragraphs() {
        let t = ParagraphTransform;
        let doc = t.to_native_document("<p>One</p><p>Two</p>");
        assert_eq!(doc["content"].as_array().unwrap().len(), 2);
        assert_eq!(t.from_native_document(&doc), "<p>One</p><p>Two</p>");
    }
}
