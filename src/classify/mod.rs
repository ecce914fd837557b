pub mod keywords;
pub mod remote;
pub mod response;

use std::fmt;

use tracing::{info, warn};

use crate::model::PolicySummary;
use keywords::KeywordClassifier;
use remote::Summarizer;

/// Where a returned summary came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarySource {
    Cache,
    Remote,
    Keyword,
}

impl fmt::Display for SummarySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SummarySource::Cache => "cache",
            SummarySource::Remote => "remote",
            SummarySource::Keyword => "keyword",
        })
    }
}

/// Remote analysis first, keyword matching when the remote path yields
/// nothing usable. Never fails.
pub struct Classifier<R> {
    summarizer: R,
    keywords: KeywordClassifier,
    chunk_size: usize,
}

impl<R: Summarizer> Classifier<R> {
    pub fn new(summarizer: R, keywords: KeywordClassifier, chunk_size: usize) -> Self {
        Self {
            summarizer,
            keywords,
            chunk_size,
        }
    }

    pub async fn classify(&self, policy_text: &str) -> (PolicySummary, SummarySource) {
        if let Some(summary) = self.classify_remote(policy_text).await {
            return (summary, SummarySource::Remote);
        }
        info!("Falling back to keyword classification");
        (self.keywords.classify(policy_text), SummarySource::Keyword)
    }

    /// Chunks go out one at a time, in order. Per-chunk results are merged
    /// keeping the most severe level per category; chunks that fail are
    /// skipped. `None` when no chunk produced a usable summary.
    async fn classify_remote(&self, policy_text: &str) -> Option<PolicySummary> {
        let chunks = remote::chunk_text(policy_text, self.chunk_size);
        let total = chunks.len();
        let mut merged: Option<PolicySummary> = None;

        for (i, chunk) in chunks.iter().enumerate() {
            let Some(raw) = self.summarizer.summarize(chunk).await else {
                warn!(chunk = i + 1, total, "Summarizer unavailable");
                continue;
            };
            match response::parse(&raw) {
                Ok(summary) => match merged.as_mut() {
                    Some(m) => m.merge_worst(summary),
                    None => merged = Some(summary),
                },
                Err(e) => warn!(chunk = i + 1, total, error = %e, "Unusable summarizer response"),
            }
        }
        merged
    }
}
