//! Cross-process mutual exclusion.
//!
//! Before a crawler or validator does useful work it checks a remote list
//! of active workflow runs for a conflicting category, polling with backoff
//! until the conflict clears or two hours elapse. Timeout is a clean SKIP,
//! not a failure. When the remote status source is unavailable, a
//! filesystem lock with a staleness horizon stands in.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::EchomapError;

pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(30);
pub const POLL_INITIAL: Duration = Duration::from_secs(30);
pub const POLL_MAX: Duration = Duration::from_secs(300);
pub const CONFLICT_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// A lock file older than this is presumed abandoned and overridden.
pub const LOCK_STALE_AFTER: Duration = Duration::from_secs(2 * 3600);

pub const LOCK_FILE: &str = ".echomap.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Crawl,
    PartialValidate,
    FullValidate,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::PartialValidate => "partial_validate",
            Self::FullValidate => "full_validate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "crawl" => Some(Self::Crawl),
            "partial_validate" => Some(Self::PartialValidate),
            "full_validate" => Some(Self::FullValidate),
            _ => None,
        }
    }

    pub fn conflicts_with(self, other: Self) -> bool {
        match self {
            Self::Crawl => matches!(other, Self::PartialValidate | Self::FullValidate),
            Self::PartialValidate => matches!(other, Self::Crawl | Self::FullValidate),
            Self::FullValidate => matches!(other, Self::Crawl | Self::PartialValidate),
        }
    }
}

/// One active run as reported by the remote status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub category: String,
    pub status: String,
}

impl WorkflowRun {
    fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }
}

#[async_trait]
pub trait RunStatusSource: Send + Sync {
    async fn active_runs(&self) -> Result<Vec<WorkflowRun>, EchomapError>;
}

/// Status source backed by an HTTP endpoint returning a JSON array of runs.
pub struct HttpStatusSource {
    client: reqwest::Client,
    url: String,
}

impl HttpStatusSource {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RunStatusSource for HttpStatusSource {
    async fn active_runs(&self) -> Result<Vec<WorkflowRun>, EchomapError> {
        let response = self.client.get(&self.url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// How exclusion was (or wasn't) obtained.
pub enum Outcome {
    /// Clear to run. Holds the file lock when the fallback path was taken.
    Proceed(Option<LockGuard>),
    /// Conflict never cleared (or we were cancelled): exit 0 with a
    /// visible skip record, no API calls made.
    Skip,
}

/// RAII file lock; released on drop.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to release lock file: {e}");
        }
    }
}

pub struct Orchestrator<S> {
    source: Option<S>,
    lock_path: PathBuf,
    cached: Option<(Instant, Vec<WorkflowRun>)>,
}

impl<S: RunStatusSource> Orchestrator<S> {
    pub fn new(source: Option<S>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            lock_path: lock_path.into(),
            cached: None,
        }
    }

    /// Obtain exclusion for `kind`, waiting out conflicts up to the
    /// two-hour deadline.
    pub async fn acquire(
        &mut self,
        kind: JobKind,
        cancel: &CancellationToken,
    ) -> Result<Outcome, EchomapError> {
        let deadline = Instant::now() + CONFLICT_TIMEOUT;

        if self.source.is_none() {
            return self.acquire_file_lock(kind, cancel, deadline).await;
        }

        let mut poll = POLL_INITIAL;
        loop {
            let conflicts = match self.conflicting_runs(kind).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("workflow status query failed ({e}) — using file lock");
                    return self.acquire_file_lock(kind, cancel, deadline).await;
                }
            };

            if conflicts.is_empty() {
                tracing::debug!(job = kind.as_str(), "no conflicting workflow runs");
                return Ok(Outcome::Proceed(None));
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    job = kind.as_str(),
                    conflicts = ?conflicts,
                    "conflict did not clear within the timeout — skipping this run"
                );
                return Ok(Outcome::Skip);
            }

            tracing::info!(
                job = kind.as_str(),
                conflicts = ?conflicts,
                wait_secs = poll.as_secs(),
                "conflicting run active — waiting"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(job = kind.as_str(), "cancelled while waiting — skipping");
                    return Ok(Outcome::Skip);
                }
                _ = tokio::time::sleep(poll) => {}
            }
            poll = (poll * 2).min(POLL_MAX);
        }
    }

    async fn conflicting_runs(&mut self, kind: JobKind) -> Result<Vec<String>, EchomapError> {
        let runs = self.runs_cached().await?;
        Ok(runs
            .iter()
            .filter(|run| run.is_running())
            .filter(|run| {
                JobKind::parse(&run.category)
                    .is_some_and(|other| kind.conflicts_with(other))
            })
            .map(|run| run.category.clone())
            .collect())
    }

    async fn runs_cached(&mut self) -> Result<Vec<WorkflowRun>, EchomapError> {
        if let Some((at, runs)) = &self.cached
            && at.elapsed() < STATUS_CACHE_TTL
        {
            return Ok(runs.clone());
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| EchomapError::Other("no status source configured".into()))?;
        let runs = source.active_runs().await?;
        self.cached = Some((Instant::now(), runs.clone()));
        Ok(runs)
    }

    async fn acquire_file_lock(
        &self,
        kind: JobKind,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Outcome, EchomapError> {
        if let Some(parent) = self.lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| EchomapError::io(parent, e))?;
        }

        let mut poll = POLL_INITIAL;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(
                        file,
                        "{} pid={} at={}",
                        kind.as_str(),
                        std::process::id(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    tracing::debug!(path = %self.lock_path.display(), "file lock acquired");
                    return Ok(Outcome::Proceed(Some(LockGuard {
                        path: self.lock_path.clone(),
                    })));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        tracing::warn!(
                            path = %self.lock_path.display(),
                            "overriding stale lock file"
                        );
                        let _ = fs::remove_file(&self.lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            job = kind.as_str(),
                            "lock held past the timeout — skipping this run"
                        );
                        return Ok(Outcome::Skip);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Outcome::Skip),
                        _ = tokio::time::sleep(poll) => {}
                    }
                    poll = (poll * 2).min(POLL_MAX);
                }
                Err(e) => return Err(EchomapError::io(&self.lock_path, e)),
            }
        }
    }

    fn lock_is_stale(&self) -> bool {
        let Ok(meta) = fs::metadata(&self.lock_path) else {
            // Vanished between the failed create and now; retry will win.
            return true;
        };
        meta.modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .is_some_and(|age| age > LOCK_STALE_AFTER)
    }
}
