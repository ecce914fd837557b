use std::sync::LazyLock;

use regex::Regex;

use crate::model::{Category, PolicySummary, RiskLevel, SummaryItem};
use crate::utils::truncate_bytes;

static PARAGRAPH_BREAK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Upper bound on a snippet, in bytes.
pub const MAX_SNIPPET_BYTES: usize = 4096;

/// Lowercase trigger phrases per category.
#[derive(Debug, Clone)]
pub struct KeywordTable {
    entries: Vec<(Category, Vec<String>)>,
}

impl KeywordTable {
    pub fn new(entries: Vec<(Category, Vec<String>)>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(c, words)| (c, words.into_iter().map(|w| w.to_lowercase()).collect()))
            .collect();
        Self { entries }
    }

    pub fn keywords(&self, category: Category) -> &[String] {
        self.entries
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, w)| w.as_slice())
            .unwrap_or_default()
    }
}

impl Default for KeywordTable {
    fn default() -> Self {
        let raw: [(Category, &[&str]); 10] = [
            (Category::EmailAddress, &["email"]),
            (
                Category::CreditCardAndHomeAddress,
                &["credit card", "billing address", "home address"],
            ),
            (Category::Location, &["location", "gps", "geo"]),
            (Category::SocialSecurityNumber, &["ssn", "social security"]),
            (Category::AdsAndMarketing, &["ads", "advertising", "marketing"]),
            (Category::ChildrenPii, &["children", "child", "under 13", "minor"]),
            (
                Category::LawEnforcementSharing,
                &["law enforcement", "police", "government", "legal request"],
            ),
            (
                Category::PolicyChangeNotification,
                &["notify", "update", "change", "modification"],
            ),
            (Category::ControlOfData, &["access", "delete", "correct", "edit", "opt-out"]),
            (Category::DataAggregation, &["aggregate", "combine", "analyze", "profile"]),
        ];
        Self::new(
            raw.into_iter()
                .map(|(c, words)| (c, words.iter().map(|w| w.to_string()).collect()))
                .collect(),
        )
    }
}

/// Offline approximation: every category whose keywords appear in at least
/// one paragraph gets a Yellow item quoting those paragraphs.
#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    table: KeywordTable,
}

impl KeywordClassifier {
    pub fn new(table: KeywordTable) -> Self {
        Self { table }
    }

    pub fn classify(&self, policy_text: &str) -> PolicySummary {
        let paragraphs: Vec<(&str, String)> = split_paragraphs(policy_text)
            .map(|p| (p, p.to_lowercase()))
            .collect();

        let mut summary = PolicySummary::new();
        for (category, keywords) in &self.table.entries {
            let matches: Vec<&str> = paragraphs
                .iter()
                .filter(|(_, lower)| keywords.iter().any(|k| lower.contains(k.as_str())))
                .map(|(p, _)| *p)
                .collect();
            if matches.is_empty() {
                continue;
            }
            summary.insert(
                *category,
                SummaryItem {
                    risk_level: RiskLevel::Yellow,
                    justification: format!(
                        "Detected {} related paragraphs for \"{}\".",
                        matches.len(),
                        category
                    ),
                    snippet: truncate_bytes(&matches.join("\n\n"), MAX_SNIPPET_BYTES),
                },
            );
        }
        summary
    }
}

/// Blank-line delimited, trimmed, empties dropped.
pub fn split_paragraphs(text: &str) -> impl Iterator<Item = &str> {
    PARAGRAPH_BREAK_RE
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
}
