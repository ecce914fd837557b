use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::config::Settings;
use crate::locate::Locator;
use crate::model::{AppId, PolicyDocument};
use crate::sanitize::sanitize;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no privacy policy link found for {0}")]
    PolicyNotFound(AppId),
    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },
    #[error("empty body (HTTP {status}) for {url}")]
    EmptyBody { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    /// HTTP status, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Http { status, .. } | FetchError::EmptyBody { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub struct RawPage {
    pub status: u16,
    pub body: String,
}

/// A GET-only view of the web.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn get(&self, url: &Url) -> Result<RawPage, FetchError>;
}

#[async_trait]
impl<T: PageSource + ?Sized> PageSource for Arc<T> {
    async fn get(&self, url: &Url) -> Result<RawPage, FetchError> {
        (**self).get(url).await
    }
}

/// reqwest-backed source with a desktop browser User-Agent and bounded
/// connect/read timeouts.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(settings: &Settings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .default_headers(headers)
            .connect_timeout(settings.connect_timeout())
            .read_timeout(settings.read_timeout())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageSource for HttpSource {
    async fn get(&self, url: &Url) -> Result<RawPage, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = self.client.get(url.clone()).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport)?;
        Ok(RawPage { status, body })
    }
}

/// Listing page → policy link → policy page → sanitized text.
pub struct PolicyFetcher<S> {
    source: S,
    locator: Locator,
    store_details_url: Url,
}

impl<S: PageSource> PolicyFetcher<S> {
    pub fn new(source: S, locator: Locator, store_details_url: Url) -> Self {
        Self {
            source,
            locator,
            store_details_url,
        }
    }

    pub fn listing_url(&self, app_id: &AppId) -> Url {
        let mut url = self.store_details_url.clone();
        url.query_pairs_mut()
            .append_pair("id", app_id.as_str())
            .append_pair("hl", "en");
        url
    }

    pub async fn fetch(&self, app_id: &AppId) -> Result<PolicyDocument, FetchError> {
        let listing_url = self.listing_url(app_id);
        let listing = self.get_ok(&listing_url).await?;

        let Some(link) = self.locator.locate(&listing) else {
            info!(app_id = %app_id, "No privacy policy link on store listing");
            return Err(FetchError::PolicyNotFound(app_id.clone()));
        };
        info!(app_id = %app_id, url = %link.url, via = ?link.via, "Found privacy policy URL");

        let html = self.get_ok(&link.url).await?;
        let plain_text = sanitize(&html);
        info!(app_id = %app_id, chars = plain_text.chars().count(), "Extracted policy text");

        Ok(PolicyDocument {
            source_url: link.url.to_string(),
            plain_text,
        })
    }

    /// GET that treats non-2xx and blank bodies as failures.
    async fn get_ok(&self, url: &Url) -> Result<String, FetchError> {
        let start = Instant::now();
        let page = self.source.get(url).await?;
        debug!(
            url = %url,
            status = page.status,
            latency_ms = start.elapsed().as_millis() as u64,
            "GET"
        );
        if !(200..300).contains(&page.status) {
            return Err(FetchError::Http {
                url: url.to_string(),
                status: page.status,
            });
        }
        if page.body.trim().is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
                status: page.status,
            });
        }
        Ok(page.body)
    }
}

// ── Tests ──
