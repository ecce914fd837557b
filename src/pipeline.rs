use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{ArtifactCache, CacheError};
use crate::classify::keywords::KeywordClassifier;
use crate::classify::remote::{RemoteSummarizer, Summarizer};
use crate::classify::{Classifier, SummarySource};
use crate::config::Settings;
use crate::fetch::{FetchError, HttpSource, PageSource, PolicyFetcher};
use crate::locate::Locator;
use crate::model::{AppId, PolicyDocument, PolicySummary};

/// Terminal failure of a run. Cloneable so concurrent callers for the same
/// identifier can all receive it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no privacy policy found")]
    PolicyNotFound,
    #[error("could not fetch policy: {message}")]
    Fetch { status: Option<u16>, message: String },
    #[error("policy text is empty; nothing to classify")]
    NoClassifiableText,
    #[error("cache failure: {0}")]
    Cache(String),
}

impl From<FetchError> for PipelineError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::PolicyNotFound(_) => PipelineError::PolicyNotFound,
            other => PipelineError::Fetch {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}

impl From<CacheError> for PipelineError {
    fn from(e: CacheError) -> Self {
        PipelineError::Cache(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub summary: PolicySummary,
    pub source: SummarySource,
    /// Set when this run fetched or loaded the document.
    pub source_url: Option<String>,
}

pub type RunResult = Result<RunReport, PipelineError>;

enum State {
    CheckingCache,
    Fetching,
    Classifying(PolicyDocument),
    Done(RunReport),
    Failed(PipelineError),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::CheckingCache => "checking_cache",
            State::Fetching => "fetching",
            State::Classifying(_) => "classifying",
            State::Done(_) => "done",
            State::Failed(_) => "failed",
        }
    }
}

/// cache → fetch → classify, once per identifier at a time.
///
/// Everything that touches a cache entry (`run`, `refresh`, `document`)
/// holds that entry's lane, keyed by [`AppId::normalized`]. Concurrent `run`
/// calls for the same identifier share one pass and its result. Dropping
/// every caller's future cancels the work; a later call starts over from
/// whatever the cache holds.
pub struct Pipeline<S, R> {
    fetcher: PolicyFetcher<S>,
    cache: ArtifactCache,
    classifier: Classifier<R>,
    in_flight: Mutex<HashMap<String, Arc<OnceCell<RunResult>>>>,
    lanes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Pipeline<HttpSource, RemoteSummarizer> {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store_url = Url::parse(&settings.store_details_url)
            .with_context(|| format!("Invalid store URL {}", settings.store_details_url))?;
        let locator = Locator::new(store_url.clone(), settings.excluded_hosts.clone());
        let fetcher = PolicyFetcher::new(HttpSource::new(settings)?, locator, store_url);
        let cache = ArtifactCache::open(&settings.cache_dir)
            .with_context(|| format!("Failed to open cache at {:?}", settings.cache_dir))?;
        let classifier = Classifier::new(
            RemoteSummarizer::new(settings)?,
            KeywordClassifier::default(),
            settings.chunk_size,
        );
        Ok(Pipeline::new(fetcher, cache, classifier))
    }
}

impl<S: PageSource, R: Summarizer> Pipeline<S, R> {
    pub fn new(fetcher: PolicyFetcher<S>, cache: ArtifactCache, classifier: Classifier<R>) -> Self {
        Self {
            fetcher,
            cache,
            classifier,
            in_flight: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub async fn get_summary(&self, app_id: &AppId) -> Result<PolicySummary, PipelineError> {
        self.run(app_id).await.map(|r| r.summary)
    }

    pub async fn run(&self, app_id: &AppId) -> RunResult {
        let key = app_id.normalized();
        let cell = {
            let mut in_flight = lock(&self.in_flight);
            Arc::clone(in_flight.entry(key.clone()).or_default())
        };

        let result = cell
            .get_or_init(|| self.exclusive(&key, self.run_once(app_id)))
            .await
            .clone();

        let mut in_flight = lock(&self.in_flight);
        if in_flight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(&key);
        }
        result
    }

    /// Drop cached artifacts and run again. Waits for whatever already holds
    /// the identifier, so the invalidation never lands mid-run.
    pub async fn refresh(&self, app_id: &AppId) -> RunResult {
        self.exclusive(&app_id.normalized(), self.refresh_once(app_id)).await
    }

    /// Fetch and cache the document only. Returns the cached copy if present.
    pub async fn document(&self, app_id: &AppId) -> Result<PolicyDocument, PipelineError> {
        self.exclusive(&app_id.normalized(), self.load_document(app_id)).await
    }

    /// Run `work` while holding the lane for `key`.
    async fn exclusive<T>(&self, key: &str, work: impl Future<Output = T>) -> T {
        let lane = {
            let mut lanes = lock(&self.lanes);
            Arc::clone(lanes.entry(key.to_string()).or_default())
        };

        let output = {
            let _held = lane.lock().await;
            work.await
        };

        // Only the map and this call still hold the lane: nobody is waiting.
        let mut lanes = lock(&self.lanes);
        if Arc::strong_count(&lane) == 2 && lanes.get(key).is_some_and(|l| Arc::ptr_eq(l, &lane)) {
            lanes.remove(key);
        }
        output
    }

    async fn refresh_once(&self, app_id: &AppId) -> RunResult {
        self.cache.invalidate(app_id)?;
        self.run_once(app_id).await
    }

    async fn load_document(&self, app_id: &AppId) -> Result<PolicyDocument, PipelineError> {
        if let Some(doc) = self.cache.get_document(app_id)? {
            return Ok(doc);
        }
        let doc = self.fetcher.fetch(app_id).await?;
        self.cache.put_document(app_id, &doc)?;
        Ok(doc)
    }

    async fn run_once(&self, app_id: &AppId) -> RunResult {
        let mut state = State::CheckingCache;
        loop {
            debug!(app_id = %app_id, state = state.name(), "Pipeline state");
            state = match state {
                State::CheckingCache => self.check_cache(app_id),
                State::Fetching => match self.fetcher.fetch(app_id).await {
                    Ok(doc) => match self.cache.put_document(app_id, &doc) {
                        Ok(()) => State::Classifying(doc),
                        Err(e) => State::Failed(e.into()),
                    },
                    Err(e) => {
                        warn!(app_id = %app_id, error = %e, "Fetch failed");
                        State::Failed(e.into())
                    }
                },
                State::Classifying(doc) => self.classify(app_id, doc).await,
                State::Done(report) => {
                    info!(
                        app_id = %app_id,
                        source = %report.source,
                        categories = report.summary.len(),
                        "Summary ready"
                    );
                    return Ok(report);
                }
                State::Failed(e) => return Err(e),
            };
        }
    }

    fn check_cache(&self, app_id: &AppId) -> State {
        match self.cache.get_summary(app_id) {
            Ok(Some(summary)) => {
                return State::Done(RunReport {
                    summary,
                    source: SummarySource::Cache,
                    source_url: None,
                })
            }
            Ok(None) => {}
            Err(e) => return State::Failed(e.into()),
        }
        match self.cache.get_document(app_id) {
            Ok(Some(doc)) => State::Classifying(doc),
            Ok(None) => State::Fetching,
            Err(e) => State::Failed(e.into()),
        }
    }

    /// Keyword-derived summaries are cached too, so repeat calls stay
    /// offline. `refresh` is the way to retry the remote service.
    async fn classify(&self, app_id: &AppId, doc: PolicyDocument) -> State {
        if doc.plain_text.trim().is_empty() {
            warn!(app_id = %app_id, "Policy text is empty");
            return State::Failed(PipelineError::NoClassifiableText);
        }
        let (summary, source) = self.classifier.classify(&doc.plain_text).await;
        if let Err(e) = self.cache.put_summary(app_id, &summary) {
            return State::Failed(e.into());
        }
        State::Done(RunReport {
            summary,
            source,
            source_url: Some(doc.source_url).filter(|u| !u.is_empty()),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::tests::{fetcher, FakeWeb, LISTING, POLICY, STORE};
    use crate::model::{Category, RiskLevel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSummarizer {
        reply: Option<String>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl CountingSummarizer {
        fn replying(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(String::from),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }

        fn slow(reply: Option<&str>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(String::from),
                calls: AtomicUsize::new(0),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Summarizer for CountingSummarizer {
        async fn summarize(&self, _policy_text: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.reply.clone()
        }
    }

    const REMOTE_REPLY: &str = r#"{"response": "```json\n{\"Email Address\": {\"risk_level\": \"Red\", \"justification\": \"Shared with partners.\", \"snippet\": \"We store your email address.\"}}\n```"}"#;

    fn web() -> Arc<FakeWeb> {
        Arc::new(
            FakeWeb::default()
                .with(STORE, 200, LISTING)
                .with("https://dev.test/privacy", 200, POLICY),
        )
    }

    fn pipeline(
        web: Arc<FakeWeb>,
        summarizer: Arc<CountingSummarizer>,
        dir: &std::path::Path,
    ) -> Pipeline<Arc<FakeWeb>, Arc<CountingSummarizer>> {
        Pipeline::new(
            fetcher(web),
            ArtifactCache::open(dir).unwrap(),
            Classifier::new(summarizer, KeywordClassifier::default(), 0),
        )
    }

    #[tokio::test]
    async fn remote_summary_then_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let (web, remote) = (web(), CountingSummarizer::replying(Some(REMOTE_REPLY)));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        let first = p.run(&id).await.unwrap();
        assert_eq!(first.source, SummarySource::Remote);
        assert_eq!(first.source_url.as_deref(), Some("https://dev.test/privacy"));
        assert_eq!(
            first.summary.get(Category::EmailAddress).unwrap().risk_level,
            RiskLevel::Red
        );
        assert_eq!((web.gets(), remote.calls()), (2, 1));

        let second = p.run(&id).await.unwrap();
        assert_eq!(second.source, SummarySource::Cache);
        assert_eq!(second.summary, first.summary);
        assert_eq!((web.gets(), remote.calls()), (2, 1));
    }

    #[tokio::test]
    async fn fallback_equals_keyword_pass_and_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (web, remote) = (web(), CountingSummarizer::replying(None));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        let report = p.run(&id).await.unwrap();
        let doc = p.cache().get_document(&id).unwrap().unwrap();
        assert_eq!(report.source, SummarySource::Keyword);
        assert_eq!(report.summary, KeywordClassifier::default().classify(&doc.plain_text));
        assert!(report.summary.get(Category::EmailAddress).is_some());

        assert_eq!(p.get_summary(&id).await.unwrap(), report.summary);
        assert_eq!((web.gets(), remote.calls()), (2, 1));
    }

    #[tokio::test]
    async fn unparseable_remote_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let remote = CountingSummarizer::replying(Some(r#"{"error": "model overloaded"}"#));
        let p = pipeline(web(), remote, dir.path());
        let report = p.run(&AppId::new("com.example.app")).await.unwrap();
        assert_eq!(report.source, SummarySource::Keyword);
    }

    #[tokio::test]
    async fn cached_document_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(FakeWeb::default());
        let remote = CountingSummarizer::replying(Some(REMOTE_REPLY));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");
        let doc = PolicyDocument {
            source_url: "https://dev.test/privacy".into(),
            plain_text: "We store your email address.".into(),
        };
        p.cache().put_document(&id, &doc).unwrap();

        let report = p.run(&id).await.unwrap();
        assert_eq!(report.source, SummarySource::Remote);
        assert_eq!(web.gets(), 0);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn missing_policy_fails_without_caching() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(FakeWeb::default().with(STORE, 200, "<p>No links</p>"));
        let remote = CountingSummarizer::replying(Some(REMOTE_REPLY));
        let p = pipeline(web, remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        assert_eq!(p.run(&id).await, Err(PipelineError::PolicyNotFound));
        assert_eq!(remote.calls(), 0);
        assert!(p.cache().get_document(&id).unwrap().is_none());
        assert!(p.cache().get_summary(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_error_carries_status() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(FakeWeb::default().with(STORE, 429, "slow down"));
        let p = pipeline(web, CountingSummarizer::replying(None), dir.path());
        let err = p.run(&AppId::new("com.example.app")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Fetch { status: Some(429), .. }));
    }

    #[tokio::test]
    async fn empty_text_with_no_remote_fails() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(
            FakeWeb::default()
                .with(STORE, 200, LISTING)
                .with("https://dev.test/privacy", 200, "<script>only()</script>"),
        );
        let p = pipeline(web, CountingSummarizer::replying(None), dir.path());
        let err = p.run(&AppId::new("com.example.app")).await.unwrap_err();
        assert_eq!(err, PipelineError::NoClassifiableText);
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_pass() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(
            FakeWeb::default()
                .with_delay(Duration::from_millis(50))
                .with(STORE, 200, LISTING)
                .with("https://dev.test/privacy", 200, POLICY),
        );
        let remote = CountingSummarizer::replying(None);
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        let (a, b) = tokio::join!(p.run(&id), p.run(&id));
        assert_eq!(a, b);
        assert!(a.is_ok());
        assert_eq!(web.gets(), 2);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_leaves_no_partial_entry() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(
            FakeWeb::default()
                .with_delay(Duration::from_millis(200))
                .with(STORE, 200, LISTING)
                .with("https://dev.test/privacy", 200, POLICY),
        );
        let p = pipeline(web, CountingSummarizer::replying(None), dir.path());
        let id = AppId::new("com.example.app");

        let cancelled = tokio::time::timeout(Duration::from_millis(20), p.run(&id)).await;
        assert!(cancelled.is_err());
        assert!(p.cache().get_document(&id).unwrap().is_none());

        assert!(p.run(&id).await.is_ok());
        assert!(p.cache().get_summary(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let (web, remote) = (web(), CountingSummarizer::replying(None));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        p.run(&id).await.unwrap();
        let again = p.refresh(&id).await.unwrap();
        assert_eq!(again.source, SummarySource::Keyword);
        assert_eq!((web.gets(), remote.calls()), (4, 2));
    }

    #[tokio::test]
    async fn document_only() {
        let dir = tempfile::tempdir().unwrap();
        let (web, remote) = (web(), CountingSummarizer::replying(None));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        let doc = p.document(&id).await.unwrap();
        assert_eq!(doc.source_url, "https://dev.test/privacy");
        assert_eq!(p.document(&id).await.unwrap(), doc);
        assert_eq!((web.gets(), remote.calls()), (2, 0));
    }

    #[tokio::test]
    async fn refresh_waits_for_run_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let web = web();
        let remote = CountingSummarizer::slow(Some(REMOTE_REPLY), Duration::from_millis(200));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let id = AppId::new("com.example.app");

        let (run, refreshed) = tokio::join!(p.run(&id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            p.refresh(&id).await
        });
        assert!(run.is_ok());
        assert_eq!(refreshed.unwrap().source, SummarySource::Remote);
        assert_eq!((web.gets(), remote.calls()), (4, 2));
        assert!(p.cache().get_document(&id).unwrap().is_some());
        assert!(p.cache().get_summary(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn document_alongside_run_fetches_once() {
        let dir = tempfile::tempdir().unwrap();
        let web = Arc::new(
            FakeWeb::default()
                .with_delay(Duration::from_millis(20))
                .with(STORE, 200, LISTING)
                .with("https://dev.test/privacy", 200, POLICY),
        );
        let p = pipeline(web.clone(), CountingSummarizer::replying(None), dir.path());
        let id = AppId::new("com.example.app");

        let (run, doc) = tokio::join!(p.run(&id), p.document(&id));
        assert_eq!(run.unwrap().source, SummarySource::Keyword);
        assert_eq!(doc.unwrap().source_url, "https://dev.test/privacy");
        assert_eq!(web.gets(), 2);
    }

    #[tokio::test]
    async fn similar_ids_keep_separate_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (web, remote) = (web(), CountingSummarizer::replying(None));
        let p = pipeline(web.clone(), remote.clone(), dir.path());
        let (dotted, underscored) = (AppId::new("com.foo.bar"), AppId::new("com.foo_bar"));

        let (a, b) = tokio::join!(p.run(&dotted), p.run(&underscored));
        assert_eq!(a.unwrap().source, SummarySource::Keyword);
        assert_eq!(b.unwrap().source, SummarySource::Keyword);
        assert_eq!((web.gets(), remote.calls()), (4, 2));
        assert!(p.cache().get_summary(&dotted).unwrap().is_some());
        assert!(p.cache().get_summary(&underscored).unwrap().is_some());
    }
}
