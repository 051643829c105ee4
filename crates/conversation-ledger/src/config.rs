// conversation-ledger/crates/conversation-ledger/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Sync engine tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of trailing buffer rows considered during alignment.
    pub window: usize,
    /// Maximum skew between platform timestamps for a content-based match.
    pub timestamp_tolerance_seconds: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            window: 200,
            timestamp_tolerance_seconds: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub similarity_threshold: f64,
    pub max_span_messages: usize,
    pub min_span_messages: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.5,
            max_span_messages: 40,
            min_span_messages: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub min_overlap: usize,
    pub max_group_size: usize,
    pub max_groups_to_process: usize,
    /// Tags attached to more memories than this are ignored when building edges.
    pub max_tag_fanout: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            min_overlap: 3,
            max_group_size: 10,
            max_groups_to_process: 20,
            max_tag_fanout: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub log_level: String,
    pub reasoning_url: Option<String>,
    pub collaborator_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub sync: SyncConfig,
    pub topics: TopicConfig,
    pub dedup: DedupConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ledger.db"),
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            log_level: "info".to_string(),
            reasoning_url: None,
            collaborator_timeout_seconds: 30,
            request_timeout_seconds: 120,
            sync: SyncConfig::default(),
            topics: TopicConfig::default(),
            dedup: DedupConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Missing keys fall back to
    /// their defaults; present but unparseable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cfg = Self {
            db_path: lookup("LEDGER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_host: lookup("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_or(&lookup, "API_PORT", defaults.api_port)?,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            reasoning_url: lookup("REASONING_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            collaborator_timeout_seconds: parse_or(
                &lookup,
                "COLLABORATOR_TIMEOUT_SECONDS",
                defaults.collaborator_timeout_seconds,
            )?,
            request_timeout_seconds: parse_or(
                &lookup,
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            )?,
            sync: SyncConfig {
                window: parse_or(&lookup, "SYNC_WINDOW", defaults.sync.window)?,
                timestamp_tolerance_seconds: parse_or(
                    &lookup,
                    "SYNC_TIMESTAMP_TOLERANCE_SECONDS",
                    defaults.sync.timestamp_tolerance_seconds,
                )?,
            },
            topics: TopicConfig {
                similarity_threshold: parse_or(
                    &lookup,
                    "TOPIC_SIMILARITY_THRESHOLD",
                    defaults.topics.similarity_threshold,
                )?,
                max_span_messages: parse_or(
                    &lookup,
                    "TOPIC_MAX_SPAN_MESSAGES",
                    defaults.topics.max_span_messages,
                )?,
                min_span_messages: parse_or(
                    &lookup,
                    "TOPIC_MIN_SPAN_MESSAGES",
                    defaults.topics.min_span_messages,
                )?,
            },
            dedup: DedupConfig {
                min_overlap: parse_or(&lookup, "DEDUP_MIN_OVERLAP", defaults.dedup.min_overlap)?,
                max_group_size: parse_or(
                    &lookup,
                    "DEDUP_MAX_GROUP_SIZE",
                    defaults.dedup.max_group_size,
                )?,
                max_groups_to_process: parse_or(
                    &lookup,
                    "DEDUP_MAX_GROUPS",
                    defaults.dedup.max_groups_to_process,
                )?,
                max_tag_fanout: parse_or(
                    &lookup,
                    "DEDUP_MAX_TAG_FANOUT",
                    defaults.dedup.max_tag_fanout,
                )?,
            },
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.window == 0 {
            anyhow::bail!("SYNC_WINDOW must be greater than zero");
        }
        if self.sync.timestamp_tolerance_seconds < 0 {
            anyhow::bail!("SYNC_TIMESTAMP_TOLERANCE_SECONDS must not be negative");
        }
        if !(self.topics.similarity_threshold > 0.0 && self.topics.similarity_threshold <= 1.0) {
            anyhow::bail!("TOPIC_SIMILARITY_THRESHOLD must be within (0, 1]");
        }
        if self.topics.max_span_messages == 0 || self.topics.min_span_messages == 0 {
            anyhow::bail!("topic span sizes must be greater than zero");
        }
        if self.topics.min_span_messages > self.topics.max_span_messages {
            anyhow::bail!("TOPIC_MIN_SPAN_MESSAGES exceeds TOPIC_MAX_SPAN_MESSAGES");
        }
        if self.dedup.min_overlap == 0
            || self.dedup.max_group_size < 2
            || self.dedup.max_groups_to_process == 0
            || self.dedup.max_tag_fanout == 0
        {
            anyhow::bail!("dedup limits must be positive (DEDUP_MAX_GROUP_SIZE at least 2)");
        }
        if self.collaborator_timeout_seconds == 0 {
            anyhow::bail!("COLLABORATOR_TIMEOUT_SECONDS must be greater than zero");
        }
        Ok(())
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!(
            "- Reasoning collaborator: {}",
            self.reasoning_url.as_deref().unwrap_or("disabled")
        );
        info!("- Collaborator timeout: {}s", self.collaborator_timeout_seconds);
        info!(
            "- Sync window: {} rows, timestamp tolerance {}s",
            self.sync.window, self.sync.timestamp_tolerance_seconds
        );
        info!(
            "- Topic spans: {}..={} messages, similarity threshold {}",
            self.topics.min_span_messages, self.topics.max_span_messages, self.topics.similarity_threshold
        );
        info!(
            "- Dedup: min overlap {}, max group {}, max groups {}",
            self.dedup.min_overlap, self.dedup.max_group_size, self.dedup.max_groups_to_process
        );
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}
