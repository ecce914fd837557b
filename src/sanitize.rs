use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static PARAGRAPH_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("p, li").unwrap());
static BODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TERMINAL_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:[.!?]\s*){2,}").unwrap());

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];

/// Reduce an HTML page to blank-line separated prose paragraphs.
///
/// Text is taken from `<p>` and `<li>` elements so navigation and footer
/// boilerplate stays out of the paragraphs. Pages without any such element
/// fall back to the whole body as a single paragraph. Never fails: html5ever
/// recovers from any markup.
pub fn sanitize(html: &str) -> String {
    let doc = Html::parse_document(html);

    let mut paragraphs: Vec<String> = doc
        .select(&PARAGRAPH_SEL)
        .filter(|el| !is_hidden_subtree(el) && !inside_paragraph(el))
        .map(|el| {
            let mut raw = String::new();
            push_text(el, &mut raw);
            clean(&raw)
        })
        .filter(|p| !p.is_empty())
        .collect();

    if paragraphs.is_empty() {
        let root = doc
            .select(&BODY_SEL)
            .next()
            .unwrap_or_else(|| doc.root_element());
        let mut raw = String::new();
        push_text(root, &mut raw);
        let body = clean(&raw);
        if !body.is_empty() {
            paragraphs.push(body);
        }
    }

    paragraphs.join("\n\n")
}

/// Collapse whitespace and terminal punctuation runs, then trim.
fn clean(raw: &str) -> String {
    let spaced = WHITESPACE_RE.replace_all(raw, " ");
    TERMINAL_RUN_RE
        .replace_all(&spaced, ". ")
        .trim()
        .to_string()
}

fn push_text(el: ElementRef, out: &mut String) {
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_el) = ElementRef::wrap(child) {
            if is_skipped(&child_el) {
                continue;
            }
            if child_el.value().name() == "br" {
                out.push(' ');
                continue;
            }
            push_text(child_el, out);
        }
    }
}

fn is_skipped(el: &ElementRef) -> bool {
    let v = el.value();
    if SKIPPED_TAGS.contains(&v.name()) || v.attr("hidden").is_some() {
        return true;
    }
    v.attr("style").is_some_and(|style| {
        let compact: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        compact.contains("display:none")
    })
}

fn is_hidden_subtree(el: &ElementRef) -> bool {
    is_skipped(el) || el.ancestors().filter_map(ElementRef::wrap).any(|a| is_skipped(&a))
}

/// A `<p>` inside an `<li>` (or the reverse) is already covered by its ancestor.
fn inside_paragraph(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "p" | "li"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_script_keeps_paragraphs() {
        let text = sanitize("<p>Hello</p><script>evil()</script><p>World</p>");
        assert!(text.contains("Hello"));
        assert!(text.contains("World"));
        assert!(!text.contains("evil()"));
        assert_eq!(text, "Hello\n\nWorld");
    }

    #[test]
    fn drops_hidden_and_style() {
        let html = r#"<html><head><style>p { color: red }</style></head><body>
            <p>Visible</p>
            <div style="DISPLAY: none"><p>Secret</p></div>
            <p hidden>Also secret</p>
            <p>Shown <span style="display:none">tracker</span>text</p>
        </body></html>"#;
        let text = sanitize(html);
        assert_eq!(text, "Visible\n\nShown text");
    }

    #[test]
    fn collapses_whitespace_and_dots() {
        let text = sanitize("<p>We   collect\n\n data....   Really!!</p>");
        assert_eq!(text, "We collect data. Really.");
    }

    #[test]
    fn nested_list_paragraph_not_duplicated() {
        let text = sanitize("<ul><li><p>Only once</p></li><li>Second</li></ul>");
        assert_eq!(text, "Only once\n\nSecond");
    }

    #[test]
    fn inline_markup_joins_words() {
        let text = sanitize("<p>We share <b>your</b> <a href='#'>email</a>.<br>Always</p>");
        assert_eq!(text, "We share your email. Always");
    }

    #[test]
    fn falls_back_to_body_text() {
        let text = sanitize("<body><div>Plain   policy <span>text</span></div><script>x()</script></body>");
        assert_eq!(text, "Plain policy text");
    }

    #[test]
    fn malformed_markup_degrades() {
        let text = sanitize("<p>Unclosed <b>bold<p>Next</div></span>");
        assert!(text.contains("Unclosed bold"));
        assert!(text.contains("Next"));
    }

    #[test]
    fn empty_input() {
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn fixture_policy_page() {
        let html = std::fs::read_to_string("tests/fixtures/policy_page.html").unwrap();
        let text = sanitize(&html);
        let paragraphs: Vec<&str> = text.split("\n\n").collect();
        assert!(paragraphs.len() >= 5);
        assert!(!text.contains("Home | Products"));
        assert!(!text.contains("gtag"));
        assert!(text.contains("email address"));
    }
}
