use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::utils::truncate;

/// Remote policy analysis. `None` means the service could not help this
/// time; callers fall back to local classification.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, policy_text: &str) -> Option<String>;
}

#[async_trait]
impl<T: Summarizer + ?Sized> Summarizer for Arc<T> {
    async fn summarize(&self, policy_text: &str) -> Option<String> {
        (**self).summarize(policy_text).await
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    policy_text: &'a str,
}

/// POSTs `{"policy_text": ...}` to the `analyze_policy` endpoint. One
/// attempt per call, no retries.
pub struct RemoteSummarizer {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteSummarizer {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.read_timeout())
            .build()
            .context("Failed to create summarizer HTTP client")?;
        Ok(Self {
            client,
            endpoint: settings.summarizer_url.clone(),
        })
    }
}

#[async_trait]
impl Summarizer for RemoteSummarizer {
    async fn summarize(&self, policy_text: &str) -> Option<String> {
        info!(url = %self.endpoint, chars = policy_text.chars().count(), "Sending policy to summarizer");
        let start = Instant::now();

        let response = match self
            .client
            .post(&self.endpoint)
            .json(&AnalyzeRequest { policy_text })
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %self.endpoint, error = %e, "Summarizer request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %truncate(&body, 300), "Summarizer returned an error");
            return None;
        }

        match response.text().await {
            Ok(body) => {
                info!(
                    bytes = body.len(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Summarizer responded"
                );
                Some(body)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read summarizer response");
                None
            }
        }
    }
}

/// Pack paragraphs into chunks of at most `max_chars` chars, in order.
/// Paragraphs longer than the limit are hard-split. `max_chars == 0` or a
/// short text yields the text unchanged as a single chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for para in super::keywords::split_paragraphs(text) {
        let para_len = para.chars().count();
        if para_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = para.chars().collect();
            chunks.extend(chars.chunks(max_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        let sep = if current.is_empty() { 0 } else { 2 };
        if current_len + sep + para_len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = serde_json::to_string(&AnalyzeRequest { policy_text: "abc" }).unwrap();
        assert_eq!(body, r#"{"policy_text":"abc"}"#);
    }

    #[test]
    fn chunking_disabled_or_short() {
        assert_eq!(chunk_text("a\n\nb", 0), vec!["a\n\nb"]);
        assert_eq!(chunk_text("a\n\nb", 100), vec!["a\n\nb"]);
    }

    #[test]
    fn chunks_pack_paragraphs_in_order() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        assert_eq!(chunk_text(text, 10), vec!["aaaa\n\nbbbb", "cccc"]);
    }

    #[test]
    fn oversized_paragraph_is_split() {
        let text = "xy\n\nabcdefghij";
        let chunks = chunk_text(text, 4);
        assert_eq!(chunks, vec!["xy", "abcd", "efgh", "ij"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }
}
