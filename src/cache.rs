use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{AppId, PolicyDocument, PolicySummary};

const POLICY_SUFFIX: &str = "_privacy_policy.txt";
const SOURCE_URL_SUFFIX: &str = "_source_url.txt";
const SUMMARY_SUFFIX: &str = "_summary.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt summary in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} already exists; invalidate before rewriting")]
    Occupied(PathBuf),
}

/// Per-application artifacts on disk, keyed by [`AppId::normalized`].
///
/// Each file is written to a temp file in the same directory, fsynced, then
/// renamed into place without clobbering, so readers see either nothing or
/// the complete artifact. An existing artifact is never replaced; call
/// [`ArtifactCache::invalidate`] first.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, app_id: &AppId, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", app_id.normalized(), suffix))
    }

    pub fn get_document(&self, app_id: &AppId) -> Result<Option<PolicyDocument>, CacheError> {
        let Some(plain_text) = read_optional(&self.path(app_id, POLICY_SUFFIX))? else {
            debug!(app_id = %app_id, "Document cache miss");
            return Ok(None);
        };
        let source_url = match read_optional(&self.path(app_id, SOURCE_URL_SUFFIX))? {
            Some(url) => url,
            None => {
                warn!(app_id = %app_id, "Cached document has no source URL");
                String::new()
            }
        };
        debug!(app_id = %app_id, "Document cache hit");
        Ok(Some(PolicyDocument {
            source_url,
            plain_text,
        }))
    }

    /// The text file is written last and marks the document as present.
    pub fn put_document(&self, app_id: &AppId, doc: &PolicyDocument) -> Result<(), CacheError> {
        let text_path = self.path(app_id, POLICY_SUFFIX);
        if text_path.exists() {
            return Err(CacheError::Occupied(text_path));
        }
        let url_path = self.path(app_id, SOURCE_URL_SUFFIX);
        remove_optional(&url_path)?;
        self.write_atomic(&url_path, doc.source_url.as_bytes())?;
        self.write_atomic(&text_path, doc.plain_text.as_bytes())?;
        info!(app_id = %app_id, bytes = doc.plain_text.len(), "Cached policy document");
        Ok(())
    }

    pub fn get_summary(&self, app_id: &AppId) -> Result<Option<PolicySummary>, CacheError> {
        let path = self.path(app_id, SUMMARY_SUFFIX);
        let Some(json) = read_optional(&path)? else {
            debug!(app_id = %app_id, "Summary cache miss");
            return Ok(None);
        };
        let summary = serde_json::from_str(&json).map_err(|source| CacheError::Json { path, source })?;
        debug!(app_id = %app_id, "Summary cache hit");
        Ok(Some(summary))
    }

    pub fn put_summary(&self, app_id: &AppId, summary: &PolicySummary) -> Result<(), CacheError> {
        let path = self.path(app_id, SUMMARY_SUFFIX);
        let json = serde_json::to_vec_pretty(summary).map_err(|source| CacheError::Json {
            path: path.clone(),
            source,
        })?;
        self.write_atomic(&path, &json)?;
        info!(app_id = %app_id, categories = summary.len(), "Cached policy summary");
        Ok(())
    }

    /// Drop every artifact for `app_id`. Summary goes first so a crash
    /// midway never leaves a summary without its document.
    pub fn invalidate(&self, app_id: &AppId) -> Result<(), CacheError> {
        for suffix in [SUMMARY_SUFFIX, POLICY_SUFFIX, SOURCE_URL_SUFFIX] {
            remove_optional(&self.path(app_id, suffix))?;
        }
        info!(app_id = %app_id, "Invalidated cached artifacts");
        Ok(())
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let io_err = |source: io::Error| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                CacheError::Occupied(path.to_path_buf())
            } else {
                io_err(e.error)
            }
        })?;
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, CacheError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_optional(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ── Tests ──
