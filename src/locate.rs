use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::model::Extraction;

static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static DATA_CALLBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)AF_initDataCallback\(\{\s*key:\s*'([^']+)'.*?data:\s*(\[.*?\])\s*,\s*sideChannel:")
        .unwrap()
});

/// Embedded payload block carrying the app's developer metadata.
const EMBEDDED_KEY: &str = "ds:5";
/// Index path from the payload root to the developer privacy-policy URL.
const EMBEDDED_POLICY_PATH: &[usize] = &[1, 2, 99, 0, 5, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristic {
    Anchor,
    EmbeddedData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyLink {
    pub url: Url,
    pub via: Heuristic,
}

/// Finds the developer's privacy-policy link on a store listing page.
#[derive(Debug, Clone)]
pub struct Locator {
    base: Url,
    excluded_hosts: Vec<String>,
}

impl Locator {
    /// `base` resolves relative hrefs; links on `excluded_hosts` (or their
    /// subdomains) are the store operator's own policies and never returned.
    pub fn new(base: Url, excluded_hosts: Vec<String>) -> Self {
        let excluded_hosts = excluded_hosts
            .into_iter()
            .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { base, excluded_hosts }
    }

    /// `None` is the expected outcome for many listings, not an error.
    pub fn locate(&self, html: &str) -> Option<PolicyLink> {
        if let Some(url) = self.scan_anchors(html) {
            return Some(PolicyLink { url, via: Heuristic::Anchor });
        }
        match embedded_policy_url(html) {
            Extraction::Found(url) if !self.is_excluded(&url) => Some(PolicyLink {
                url,
                via: Heuristic::EmbeddedData,
            }),
            Extraction::Found(url) => {
                debug!(url = %url, "Embedded policy URL is on an excluded host");
                None
            }
            Extraction::NotFound => None,
            Extraction::Malformed(reason) => {
                debug!(reason = %reason, "Embedded payload did not yield a policy URL");
                None
            }
        }
    }

    /// First absolute, non-excluded anchor mentioning "privacy" in its text
    /// or href. Relative hrefs are only used when no absolute one survives.
    fn scan_anchors(&self, html: &str) -> Option<Url> {
        let doc = Html::parse_document(html);
        let mut relative: Option<Url> = None;

        for a in doc.select(&ANCHOR_SEL) {
            let href = a.value().attr("href").unwrap_or_default().trim();
            let text: String = a.text().collect();
            if !contains_privacy(&text) && !contains_privacy(href) {
                continue;
            }
            let lower = href.to_ascii_lowercase();
            if href.is_empty()
                || href.starts_with('#')
                || lower.starts_with("javascript:")
                || lower.starts_with("mailto:")
            {
                continue;
            }

            match Url::parse(href) {
                Ok(url) if is_web(&url) => {
                    if self.is_excluded(&url) {
                        debug!(url = %url, "Skipping store operator privacy link");
                        continue;
                    }
                    return Some(url);
                }
                Ok(_) => continue,
                Err(url::ParseError::RelativeUrlWithoutBase) => {
                    if relative.is_some() {
                        continue;
                    }
                    if let Ok(url) = self.base.join(href) {
                        if is_web(&url) && !self.is_excluded(&url) {
                            relative = Some(url);
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        relative
    }

    fn is_excluded(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return true;
        };
        let host = host.to_ascii_lowercase();
        self.excluded_hosts
            .iter()
            .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
    }
}

fn contains_privacy(s: &str) -> bool {
    s.to_lowercase().contains("privacy")
}

fn is_web(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

fn embedded_policy_url(html: &str) -> Extraction<Url> {
    let payload = match embedded_payload(html, EMBEDDED_KEY) {
        Extraction::Found(v) => v,
        Extraction::NotFound => return Extraction::NotFound,
        Extraction::Malformed(e) => return Extraction::Malformed(e),
    };
    let Some(raw) = value_at_path(&payload, EMBEDDED_POLICY_PATH).and_then(Value::as_str) else {
        return Extraction::Malformed(format!(
            "no string at path {:?} in '{}' payload",
            EMBEDDED_POLICY_PATH, EMBEDDED_KEY
        ));
    };
    match Url::parse(raw.trim()) {
        Ok(url) if is_web(&url) => Extraction::Found(url),
        _ => Extraction::Malformed(format!("not an absolute web URL: {}", raw)),
    }
}

/// Locate the `data:` array of the `AF_initDataCallback` block with the given key.
pub fn embedded_payload(html: &str, key: &str) -> Extraction<Value> {
    let Some(caps) = DATA_CALLBACK_RE
        .captures_iter(html)
        .find(|c| c.get(1).is_some_and(|k| k.as_str() == key))
    else {
        return Extraction::NotFound;
    };
    match serde_json::from_str::<Value>(&caps[2]) {
        Ok(v) => Extraction::Found(v),
        Err(e) => Extraction::Malformed(format!("'{}' payload is not JSON: {}", key, e)),
    }
}

/// Descend nested arrays by index. `None` as soon as the shape diverges.
pub fn value_at_path<'a>(root: &'a Value, path: &[usize]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, &i| node.as_array()?.get(i))
}

// ── Tests ──
