mod db;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use policy_summarizer::classify::keywords::KeywordClassifier;
use policy_summarizer::classify::remote::RemoteSummarizer;
use policy_summarizer::fetch::HttpSource;
use policy_summarizer::pipeline::RunResult;
use policy_summarizer::sanitize::sanitize;
use policy_summarizer::utils::truncate;
use policy_summarizer::{AppId, Pipeline, PolicySummary, Settings};

type LivePipeline = Pipeline<HttpSource, RemoteSummarizer>;

#[derive(Parser)]
#[command(name = "policy_summarizer", about = "App privacy policy finder and summarizer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find, fetch and summarize the privacy policy of one or more apps
    Summarize {
        /// Store application identifiers (e.g. com.example.app)
        #[arg(required = true)]
        app_ids: Vec<String>,
        /// Drop cached artifacts before running
        #[arg(long)]
        refresh: bool,
    },
    /// Print the cached summary for an app without touching the network
    Show { app_id: String },
    /// Fetch and cache the policy text only
    Fetch { app_id: String },
    /// Keyword-classify a local policy file (plain text, or .html/.htm)
    Classify { file: PathBuf },
    /// Read foreground-app identifiers from stdin and summarize each
    Watch,
    /// Show run statistics
    Stats,
    /// Show recent runs
    History {
        /// Only runs for this app
        app_id: Option<String>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Summarize { app_ids, refresh } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let pipeline = Arc::new(Pipeline::from_settings(&settings)?);
            let app_ids: Vec<AppId> = app_ids.into_iter().map(AppId::new).collect();

            if let [app_id] = app_ids.as_slice() {
                let start = Instant::now();
                let result = if refresh {
                    pipeline.refresh(app_id).await
                } else {
                    pipeline.run(app_id).await
                };
                db::insert_run(&conn, &run_row(app_id, &result, start.elapsed()))?;
                print_result(app_id, &result);
                return Ok(());
            }

            println!("Summarizing {} apps...", app_ids.len());
            let stats = summarize_streaming(&conn, pipeline, app_ids, refresh, settings.concurrency).await?;
            println!("Done: {} apps ({} ok, {} failed).", stats.total, stats.ok, stats.failed);
            Ok(())
        }
        Commands::Show { app_id } => {
            let app_id = AppId::new(app_id);
            let cache = policy_summarizer::cache::ArtifactCache::open(&settings.cache_dir)?;
            match cache.get_summary(&app_id)? {
                Some(summary) => {
                    let url = cache.get_document(&app_id)?.map(|d| d.source_url);
                    print_summary(&app_id, &summary, url.as_deref());
                }
                None => println!("No cached summary for {}. Run 'summarize' first.", app_id),
            }
            Ok(())
        }
        Commands::Fetch { app_id } => {
            let app_id = AppId::new(app_id);
            let pipeline = Pipeline::from_settings(&settings)?;
            match pipeline.document(&app_id).await {
                Ok(doc) => {
                    println!("Source:     {}", doc.source_url);
                    println!("Characters: {}", doc.plain_text.chars().count());
                    println!("Paragraphs: {}", policy_summarizer::classify::keywords::split_paragraphs(&doc.plain_text).count());
                    println!("Cached in   {}", pipeline.cache().dir().display());
                }
                Err(e) => println!("{}: {}", app_id, e),
            }
            Ok(())
        }
        Commands::Classify { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let is_html = file
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("html") || e.eq_ignore_ascii_case("htm"));
            let text = if is_html { sanitize(&raw) } else { raw };
            let summary = KeywordClassifier::default().classify(&text);
            let name = AppId::new(file.display().to_string());
            print_summary(&name, &summary, None);
            Ok(())
        }
        Commands::Watch => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let pipeline = Pipeline::from_settings(&settings)?;
            watch(&conn, &pipeline).await
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Runs:      {}", s.runs);
            println!("Apps:      {}", s.apps);
            println!("Done:      {}", s.done);
            println!("Failed:    {}", s.failed);
            println!("  cache:   {}", s.from_cache);
            println!("  remote:  {}", s.from_remote);
            println!("  keyword: {}", s.from_keyword);
            if let Some(avg) = s.avg_latency_ms {
                println!("Avg time:  {}", format_duration(Duration::from_millis(avg as u64)));
            }
            Ok(())
        }
        Commands::History { app_id, limit } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_history(&conn, app_id.as_deref(), limit)?;
            if rows.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }

            println!(
                "{:<19} | {:<28} | {:<6} | {:<7} | {:>5} | {:>8} | {}",
                "When", "App", "Result", "Source", "Score", "Time", "Error"
            );
            println!("{}", "-".repeat(110));
            for r in &rows {
                let score = r.score.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:<19} | {:<28} | {:<6} | {:<7} | {:>5} | {:>8} | {}",
                    r.created_at,
                    truncate(&r.app_id, 28),
                    r.outcome,
                    r.source,
                    score,
                    format_duration(Duration::from_millis(r.latency_ms)),
                    truncate(&r.error, 40),
                );
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

struct BatchStats {
    total: usize,
    ok: usize,
    failed: usize,
}

/// Run the pipeline for many apps at once, recording each run as it
/// finishes.
async fn summarize_streaming(
    conn: &rusqlite::Connection,
    pipeline: Arc<LivePipeline>,
    app_ids: Vec<AppId>,
    refresh: bool,
    concurrency: usize,
) -> anyhow::Result<BatchStats> {
    let concurrency = concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let total = app_ids.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Workers send finished runs, main loop writes the ledger
    let (tx, mut rx) = tokio::sync::mpsc::channel::<(AppId, RunResult, Duration)>(concurrency * 2);

    for app_id in app_ids {
        let pipeline = Arc::clone(&pipeline);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            let start = Instant::now();
            let result = if refresh {
                pipeline.refresh(&app_id).await
            } else {
                pipeline.run(&app_id).await
            };
            let _ = tx.send((app_id, result, start.elapsed())).await;
        });
    }

    // rx closes once every task has finished
    drop(tx);

    let mut ok = 0usize;
    let mut failed = 0usize;
    let mut lines = Vec::with_capacity(total);

    while let Some((app_id, result, elapsed)) = rx.recv().await {
        match &result {
            Ok(report) => {
                ok += 1;
                let score = report.summary.score().map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                lines.push(format!("{:<40} | {:>5} | {}", truncate(app_id.as_str(), 40), score, report.source));
            }
            Err(e) => {
                failed += 1;
                lines.push(format!("{:<40} | {:>5} | {}", truncate(app_id.as_str(), 40), "-", e));
            }
        }
        db::insert_run(conn, &run_row(&app_id, &result, elapsed))?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(total, ok, failed, "Batch finished");

    println!("{:<40} | {:>5} | {}", "App", "Score", "Source / error");
    println!("{}", "-".repeat(70));
    for line in lines {
        println!("{}", line);
    }

    Ok(BatchStats { total, ok, failed })
}

/// One identifier per stdin line. A repeat of the previous line is ignored;
/// Ctrl-C abandons the run in flight and stops.
async fn watch(conn: &rusqlite::Connection, pipeline: &LivePipeline) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last: Option<String> = None;
    println!("Watching stdin for app identifiers (Ctrl-C to stop)...");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            break;
        };
        let id = line.trim();
        if id.is_empty() || last.as_deref() == Some(id) {
            continue;
        }
        last = Some(id.to_string());

        let app_id = AppId::new(id);
        info!(app_id = %app_id, "Foreground app changed");
        let start = Instant::now();
        let result = tokio::select! {
            result = pipeline.run(&app_id) => result,
            _ = tokio::signal::ctrl_c() => {
                warn!(app_id = %app_id, "Interrupted; abandoning run");
                break;
            }
        };
        db::insert_run(conn, &run_row(&app_id, &result, start.elapsed()))?;
        print_result(&app_id, &result);
    }
    Ok(())
}

fn run_row(app_id: &AppId, result: &RunResult, elapsed: Duration) -> db::RunRow {
    let latency_ms = elapsed.as_millis() as u64;
    match result {
        Ok(report) => db::RunRow {
            app_id: app_id.to_string(),
            source: Some(report.source.to_string()),
            source_url: report.source_url.clone(),
            score: report.summary.score(),
            categories: Some(report.summary.len()),
            error: None,
            latency_ms,
        },
        Err(e) => db::RunRow {
            app_id: app_id.to_string(),
            source: None,
            source_url: None,
            score: None,
            categories: None,
            error: Some(e.to_string()),
            latency_ms,
        },
    }
}

fn print_result(app_id: &AppId, result: &RunResult) {
    match result {
        Ok(report) => {
            println!("Summary source: {}", report.source);
            print_summary(app_id, &report.summary, report.source_url.as_deref());
        }
        Err(e) => println!("{}: {}", app_id, e),
    }
}

fn print_summary(app_id: &AppId, summary: &PolicySummary, source_url: Option<&str>) {
    println!("{}", app_id);
    if let Some(url) = source_url.filter(|u| !u.is_empty()) {
        println!("Policy: {}", url);
    }
    if summary.is_empty() {
        println!("No privacy categories detected.");
        return;
    }

    println!();
    println!("{:<36} | {:<6} | {}", "Category", "Risk", "Justification");
    println!("{}", "-".repeat(100));
    for (category, item) in summary.iter() {
        println!(
            "{:<36} | {:<6} | {}",
            truncate(category.label(), 36),
            item.risk_level,
            truncate(&item.justification, 60),
        );
    }
    if let Some(score) = summary.score() {
        println!("\nPrivacy score: {}/100 ({} categories)", score, summary.len());
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
