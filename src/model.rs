use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reverse-domain package name, e.g. `com.example.app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe cache key. ASCII alphanumerics are kept, `.` becomes
    /// `_`, and every other byte is written as `-xx` hex. The mapping is
    /// injective, so two identifiers never share a cache entry.
    pub fn normalized(&self) -> String {
        let mut key = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                key.push(c);
            } else if c == '.' {
                key.push('_');
            } else {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    key.push_str(&format!("-{:02x}", b));
                }
            }
        }
        key
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitized policy text together with the URL it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    pub source_url: String,
    pub plain_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Email Address")]
    EmailAddress,
    #[serde(rename = "Credit Card Number and Home Address")]
    CreditCardAndHomeAddress,
    #[serde(rename = "Location")]
    Location,
    #[serde(rename = "Social Security Number")]
    SocialSecurityNumber,
    #[serde(rename = "Ads and Marketing")]
    AdsAndMarketing,
    #[serde(rename = "Collecting PII of Children")]
    ChildrenPii,
    #[serde(rename = "Sharing with Law Enforcement")]
    LawEnforcementSharing,
    #[serde(rename = "Policy Change Notification")]
    PolicyChangeNotification,
    #[serde(rename = "Control of Data")]
    ControlOfData,
    #[serde(rename = "Data Aggregation")]
    DataAggregation,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::EmailAddress,
        Category::CreditCardAndHomeAddress,
        Category::Location,
        Category::SocialSecurityNumber,
        Category::AdsAndMarketing,
        Category::ChildrenPii,
        Category::LawEnforcementSharing,
        Category::PolicyChangeNotification,
        Category::ControlOfData,
        Category::DataAggregation,
    ];

    /// Human-readable label, also the key used in persisted summaries.
    pub fn label(self) -> &'static str {
        match self {
            Category::EmailAddress => "Email Address",
            Category::CreditCardAndHomeAddress => "Credit Card Number and Home Address",
            Category::Location => "Location",
            Category::SocialSecurityNumber => "Social Security Number",
            Category::AdsAndMarketing => "Ads and Marketing",
            Category::ChildrenPii => "Collecting PII of Children",
            Category::LawEnforcementSharing => "Sharing with Law Enforcement",
            Category::PolicyChangeNotification => "Policy Change Notification",
            Category::ControlOfData => "Control of Data",
            Category::DataAggregation => "Data Aggregation",
        }
    }

    fn ident(self) -> &'static str {
        match self {
            Category::EmailAddress => "EmailAddress",
            Category::CreditCardAndHomeAddress => "CreditCardAndHomeAddress",
            Category::Location => "Location",
            Category::SocialSecurityNumber => "SocialSecurityNumber",
            Category::AdsAndMarketing => "AdsAndMarketing",
            Category::ChildrenPii => "ChildrenPII",
            Category::LawEnforcementSharing => "LawEnforcementSharing",
            Category::PolicyChangeNotification => "PolicyChangeNotification",
            Category::ControlOfData => "ControlOfData",
            Category::DataAggregation => "DataAggregation",
        }
    }

    /// Lenient lookup used on remote responses. Matches either the display
    /// label or the identifier spelling, ignoring case and separators.
    pub fn from_label(raw: &str) -> Option<Category> {
        let wanted = squash(raw);
        if wanted.is_empty() {
            return None;
        }
        Category::ALL
            .into_iter()
            .find(|c| squash(c.label()) == wanted || squash(c.ident()) == wanted)
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

impl RiskLevel {
    pub fn score(self) -> u32 {
        match self {
            RiskLevel::Green => 10,
            RiskLevel::Yellow => 5,
            RiskLevel::Red => 0,
        }
    }

    pub fn parse(raw: &str) -> Option<RiskLevel> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "green" => Some(RiskLevel::Green),
            "yellow" => Some(RiskLevel::Yellow),
            "red" => Some(RiskLevel::Red),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Green => "Green",
            RiskLevel::Yellow => "Yellow",
            RiskLevel::Red => "Red",
        };
        f.pad(s)
    }
}

/// One category's assessment. The category itself is the key in
/// [`PolicySummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryItem {
    pub risk_level: RiskLevel,
    pub justification: String,
    pub snippet: String,
}

/// Category → assessment. A missing category means the policy does not
/// address it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySummary {
    items: BTreeMap<Category, SummaryItem>,
}

impl PolicySummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: Category, item: SummaryItem) {
        self.items.insert(category, item);
    }

    pub fn get(&self, category: Category) -> Option<&SummaryItem> {
        self.items.get(&category)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, &SummaryItem)> {
        self.items.iter().map(|(c, i)| (*c, i))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Merge `other` into `self`, keeping the more severe assessment per
    /// category. Ties keep the existing entry.
    pub fn merge_worst(&mut self, other: PolicySummary) {
        for (category, item) in other.items {
            match self.items.get(&category) {
                Some(existing) if existing.risk_level >= item.risk_level => {}
                _ => {
                    self.items.insert(category, item);
                }
            }
        }
    }

    /// Aggregate percentage: `round(100 * Σ score / (10 * n))`.
    /// `None` for an empty summary.
    pub fn score(&self) -> Option<u32> {
        if self.items.is_empty() {
            return None;
        }
        let total: u32 = self.items.values().map(|i| i.risk_level.score()).sum();
        let max = 10 * self.items.len() as u32;
        Some(((100 * total) as f64 / max as f64).round() as u32)
    }
}

/// Tagged result of one extraction stage over loosely-structured input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction<T> {
    Found(T),
    NotFound,
    Malformed(String),
}

impl<T> Extraction<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Extraction::Found(v) => Some(v),
            _ => None,
        }
    }
}

// ── Tests ──
