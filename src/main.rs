use std::path::Path;

use anyhow::{bail, Context};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use echomap::api::FreesoundClient;
use echomap::checkpoint::CheckpointStore;
use echomap::config::{Config, ValidationMode};
use echomap::crawler::{CrawlConfig, Crawler};
use echomap::error::EchomapError;
use echomap::orchestrator::{HttpStatusSource, JobKind, Orchestrator, Outcome, LOCK_FILE};
use echomap::rate_limit::RateLimiter;
use echomap::validator::{Validator, ValidatorOutcome};
use echomap::{archive, validator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let mode = std::env::args().nth(1).unwrap_or_else(|| "crawl".into());
    tracing::info!(%mode, "echomap starting");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received — finishing current step and saving");
            signal_token.cancel();
        }
    });

    match mode.as_str() {
        "crawl" => run_crawl(&config, &cancel).await?,
        "validate" => run_validate(&config, &cancel).await?,
        "pack" => archive::pack(&config.checkpoint_dir, &config.archive_path)?,
        "unpack" => archive::unpack(&config.archive_path, &config.checkpoint_dir)?,
        other => bail!("unknown mode '{other}' (expected crawl | validate | pack | unpack)"),
    }

    tracing::info!("echomap done");
    Ok(())
}

async fn run_crawl(config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let api_key = config.require_api_key()?;

    let mut orchestrator = Orchestrator::new(
        config.status_url.as_deref().map(HttpStatusSource::new),
        config.checkpoint_dir.join(LOCK_FILE),
    );
    let _guard = match orchestrator.acquire(JobKind::Crawl, cancel).await? {
        Outcome::Proceed(guard) => guard,
        Outcome::Skip => {
            tracing::warn!("SKIP: crawl blocked by a conflicting run — exiting cleanly");
            return Ok(());
        }
    };

    let limiter = RateLimiter::default();
    let client = FreesoundClient::new(api_key, limiter);
    let crawl_config = CrawlConfig::from_config(config);

    let run = || async {
        let store = CheckpointStore::new(&config.checkpoint_dir);
        Crawler::new(&client, store, crawl_config.clone())
            .run(cancel)
            .await
    };

    match run().await {
        Ok(summary) => {
            tracing::info!(reason = summary.reason.as_str(), "crawl complete");
            Ok(())
        }
        Err(e @ EchomapError::CheckpointCorrupt { .. }) => {
            tracing::error!("{e}");
            recover_checkpoint(config)?;
            let summary = run().await.context("crawl failed after recovery")?;
            tracing::info!(reason = summary.reason.as_str(), "crawl complete after recovery");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_validate(config: &Config, cancel: &CancellationToken) -> anyhow::Result<()> {
    let api_key = config.require_api_key()?;
    let kind = match config.validation_mode {
        ValidationMode::Partial => JobKind::PartialValidate,
        ValidationMode::Full => JobKind::FullValidate,
    };

    let mut orchestrator = Orchestrator::new(
        config.status_url.as_deref().map(HttpStatusSource::new),
        config.checkpoint_dir.join(LOCK_FILE),
    );
    let _guard = match orchestrator.acquire(kind, cancel).await? {
        Outcome::Proceed(guard) => guard,
        Outcome::Skip => {
            tracing::warn!("SKIP: validation blocked by a conflicting run — exiting cleanly");
            return Ok(());
        }
    };

    let limiter = RateLimiter::default();
    let client = FreesoundClient::new(api_key, limiter);

    let run = || async {
        let store = CheckpointStore::new(&config.checkpoint_dir);
        Validator::new(&client, store)
            .run(config.validation_mode, cancel)
            .await
    };

    let outcome = match run().await {
        Ok(outcome) => outcome,
        Err(e @ EchomapError::CheckpointCorrupt { .. }) => {
            tracing::error!("{e}");
            recover_checkpoint(config)?;
            run().await.context("validation failed after recovery")?
        }
        Err(e) => return Err(e.into()),
    };

    match outcome {
        ValidatorOutcome::Skipped => {
            tracing::warn!("SKIP: a full validation already ran today");
        }
        ValidatorOutcome::Completed(report) => {
            tracing::info!(
                report = %config.checkpoint_dir.join(validator::REPORT_FILE).display(),
                validated = report.validated_samples,
                deleted = report.deleted_samples.len(),
                "validation complete"
            );
        }
    }
    Ok(())
}

/// A corrupt checkpoint is never overwritten in place: restore from the
/// backup archive when one exists, otherwise quarantine the directory so
/// the run can start fresh beside it.
fn recover_checkpoint(config: &Config) -> anyhow::Result<()> {
    if config.archive_path.is_file() {
        tracing::warn!(
            archive = %config.archive_path.display(),
            "restoring checkpoint from backup archive"
        );
        archive::unpack(&config.archive_path, &config.checkpoint_dir)?;
        return Ok(());
    }

    let quarantine = quarantine_path(&config.checkpoint_dir);
    tracing::warn!(
        to = %quarantine.display(),
        "no backup archive — quarantining corrupt checkpoint and starting fresh"
    );
    std::fs::rename(&config.checkpoint_dir, &quarantine)
        .with_context(|| format!("failed to quarantine {}", config.checkpoint_dir.display()))?;
    Ok(())
}

fn quarantine_path(dir: &Path) -> std::path::PathBuf {
    dir.with_extension(format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")))
}
