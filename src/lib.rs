//! Find an app's privacy policy from its store listing, reduce it to plain
//! text, and summarize it per privacy category.

pub mod cache;
pub mod classify;
pub mod config;
pub mod fetch;
pub mod locate;
pub mod model;
pub mod pipeline;
pub mod sanitize;
pub mod utils;

pub use classify::SummarySource;
pub use config::Settings;
pub use model::{AppId, Category, PolicyDocument, PolicySummary, RiskLevel, SummaryItem};
pub use pipeline::{Pipeline, PipelineError, RunReport};
