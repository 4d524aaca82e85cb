use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::EchomapError;

/// Absolute daily request ceiling imposed by the upstream API.
pub const HARD_DAILY_CAP: u32 = 2000;

/// Default per-session request budget, kept below the daily cap so a manual
/// invocation on the same day still has headroom.
pub const DEFAULT_MAX_REQUESTS: u32 = 1950;

const DEFAULT_MAX_DEPTH: u32 = 3;
const DEFAULT_MAX_RUNTIME_HOURS: f64 = 5.5;
const DEFAULT_CHECKPOINT_DIR: &str = "./checkpoint";
const DEFAULT_ARCHIVE_PATH: &str = "./echomap-checkpoint.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Stop at the request budget (default).
    Limit,
    /// Continue until the queue drains or the safety cap of 10,000 samples.
    QueueEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// 300 oldest by existence check, existence only.
    Partial,
    /// Every known sample, existence plus metadata refresh.
    Full,
}

impl ValidationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

pub struct Config {
    /// Upstream API token. Absent is tolerated here so `pack`/`unpack` work
    /// without credentials; crawl and validate reject it at startup.
    pub api_key: Option<String>,
    pub checkpoint_dir: PathBuf,
    pub max_requests: u32,
    pub max_depth: u32,
    pub max_runtime: Duration,
    pub collection_mode: CollectionMode,
    pub validation_mode: ValidationMode,
    /// Remote workflow-status endpoint. Absent means the orchestrator goes
    /// straight to the file-lock fallback.
    pub status_url: Option<String>,
    pub archive_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, EchomapError> {
        let api_key = env::var("FREESOUND_API_KEY").ok();
        if api_key.is_none() {
            tracing::warn!("FREESOUND_API_KEY not set — crawl and validate unavailable");
        }

        let checkpoint_dir = env::var("ECHOMAP_CHECKPOINT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CHECKPOINT_DIR));

        let mut max_requests = parse_var("ECHOMAP_MAX_REQUESTS", DEFAULT_MAX_REQUESTS)?;
        if max_requests > HARD_DAILY_CAP {
            tracing::warn!(
                requested = max_requests,
                cap = HARD_DAILY_CAP,
                "ECHOMAP_MAX_REQUESTS exceeds the daily API cap — clamping"
            );
            max_requests = HARD_DAILY_CAP;
        }

        let max_depth = parse_var("ECHOMAP_MAX_DEPTH", DEFAULT_MAX_DEPTH)?;
        let max_runtime_hours: f64 =
            parse_var("ECHOMAP_MAX_RUNTIME_HOURS", DEFAULT_MAX_RUNTIME_HOURS)?;
        if !max_runtime_hours.is_finite() || max_runtime_hours <= 0.0 {
            return Err(EchomapError::Config(format!(
                "ECHOMAP_MAX_RUNTIME_HOURS must be a positive number, got {max_runtime_hours}"
            )));
        }

        let collection_mode = match env::var("ECHOMAP_COLLECTION_MODE").as_deref() {
            Ok("queue_empty") => CollectionMode::QueueEmpty,
            Ok("limit") | Err(_) => CollectionMode::Limit,
            Ok(other) => {
                return Err(EchomapError::Config(format!(
                    "ECHOMAP_COLLECTION_MODE must be 'limit' or 'queue_empty', got '{other}'"
                )));
            }
        };

        let validation_mode = match env::var("ECHOMAP_VALIDATION_MODE").as_deref() {
            Ok("full") => ValidationMode::Full,
            Ok("partial") | Err(_) => ValidationMode::Partial,
            Ok(other) => {
                return Err(EchomapError::Config(format!(
                    "ECHOMAP_VALIDATION_MODE must be 'partial' or 'full', got '{other}'"
                )));
            }
        };

        let status_url = env::var("ECHOMAP_STATUS_URL").ok();
        if status_url.is_none() {
            tracing::debug!("ECHOMAP_STATUS_URL not set — orchestrator will use the file lock");
        }

        let archive_path = env::var("ECHOMAP_ARCHIVE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARCHIVE_PATH));

        Ok(Config {
            api_key,
            checkpoint_dir,
            max_requests,
            max_depth,
            max_runtime: Duration::from_secs_f64(max_runtime_hours * 3600.0),
            collection_mode,
            validation_mode,
            status_url,
            archive_path,
        })
    }

    pub fn require_api_key(&self) -> Result<&str, EchomapError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| EchomapError::Config("FREESOUND_API_KEY is required".into()))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, EchomapError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            EchomapError::Config(format!("{name} could not be parsed from '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_mode_names() {
        assert_eq!(ValidationMode::Partial.as_str(), "partial");
        assert_eq!(ValidationMode::Full.as_str(), "full");
    }

    #[test]
    fn default_budget_is_below_daily_cap() {
        assert!(DEFAULT_MAX_REQUESTS < HARD_DAILY_CAP);
    }
}
