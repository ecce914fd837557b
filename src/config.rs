use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const CONFIG_FILE: &str = "policy_summarizer";
const ENV_PREFIX: &str = "PPS";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Runtime settings. Loaded once at startup, immutable afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Store listing endpoint; `id` and `hl` are appended as query params.
    pub store_details_url: String,
    /// Full URL of the remote `analyze_policy` endpoint.
    pub summarizer_url: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub cache_dir: PathBuf,
    pub db_path: PathBuf,
    /// Hosts whose privacy links belong to the store operator, not the app.
    pub excluded_hosts: Vec<String>,
    /// Max chars per remote request. 0 sends the whole text at once.
    pub chunk_size: usize,
    /// Parallel runs for the batch `summarize` command.
    pub concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_details_url: "https://play.google.com/store/apps/details".into(),
            summarizer_url: "https://privacypolicysummarizer.onrender.com/analyze_policy".into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            cache_dir: PathBuf::from("data/cache"),
            db_path: PathBuf::from("data/policies.sqlite"),
            excluded_hosts: vec![
                "play.google.com".into(),
                "policies.google.com".into(),
                "support.google.com".into(),
                "www.google.com".into(),
            ],
            chunk_size: 0,
            concurrency: 4,
        }
    }
}

impl Settings {
    /// Defaults, then `policy_summarizer.toml` if present, then `PPS_*` env vars.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("excluded_hosts"),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize::<Settings>()
            .context("Invalid configuration")?;
        Ok(settings)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}
