use std::time::Duration;

use anyhow::Result;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref DEFAULT_USER_AGENTS: Vec<String> = [
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    ]
    .iter()
    .map(|ua| ua.to_string())
    .collect();
    static ref DEFAULT_BLOCKING_PHRASES: Vec<String> = [
        "access denied",
        "blocked",
        "captcha",
        "radware captcha page",
        "we apologize for the inconvenience",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerConfig {
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    /// Total in-flight fetches across all domains.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// In-flight fetches per domain.
    #[serde(default = "default_domain_concurrency")]
    pub domain_concurrency: usize,

    /// Minimum delay between requests to one domain, drawn uniformly
    /// from [low, high] seconds on every admission check.
    #[serde(default = "default_delay_range_secs")]
    pub delay_range_secs: [f32; 2],

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: f32,

    #[serde(default = "default_body_sample_bytes")]
    pub body_sample_bytes: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f32,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: f32,

    #[serde(default = "default_backoff_server_error_secs")]
    pub backoff_server_error_secs: f32,

    #[serde(default = "default_backoff_rate_limited_secs")]
    pub backoff_rate_limited_secs: f32,

    #[serde(default = "default_backoff_denied_secs")]
    pub backoff_denied_secs: f32,

    /// Cooldown growth factor for a domain blocked again while still hot.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_backoff_ceiling_secs")]
    pub backoff_ceiling_secs: f32,

    /// Matched case-insensitively against 2xx body samples.
    #[serde(default = "default_blocking_phrases")]
    pub blocking_phrases: Vec<String>,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: f32,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: f32,

    #[serde(default = "default_respect_robots_txt")]
    pub respect_robots_txt: bool,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agents: default_user_agents(),
            global_concurrency: default_global_concurrency(),
            domain_concurrency: default_domain_concurrency(),
            delay_range_secs: default_delay_range_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            body_sample_bytes: default_body_sample_bytes(),
            max_attempts: default_max_attempts(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            backoff_server_error_secs: default_backoff_server_error_secs(),
            backoff_rate_limited_secs: default_backoff_rate_limited_secs(),
            backoff_denied_secs: default_backoff_denied_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_ceiling_secs: default_backoff_ceiling_secs(),
            blocking_phrases: default_blocking_phrases(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            respect_robots_txt: default_respect_robots_txt(),
            handle_sigint: default_handle_sigint(),
        }
    }
}

fn default_user_agents() -> Vec<String> {
    DEFAULT_USER_AGENTS.clone()
}

fn default_global_concurrency() -> usize {
    16
}

fn default_domain_concurrency() -> usize {
    4
}

fn default_delay_range_secs() -> [f32; 2] {
    [1.0, 3.0]
}

fn default_request_timeout_secs() -> f32 {
    30.0
}

fn default_body_sample_bytes() -> usize {
    4096
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_secs() -> f32 {
    1.5
}

fn default_retry_max_delay_secs() -> f32 {
    60.0
}

fn default_backoff_server_error_secs() -> f32 {
    15.0
}

fn default_backoff_rate_limited_secs() -> f32 {
    30.0
}

fn default_backoff_denied_secs() -> f32 {
    60.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_ceiling_secs() -> f32 {
    900.0
}

fn default_blocking_phrases() -> Vec<String> {
    DEFAULT_BLOCKING_PHRASES.clone()
}

fn default_checkpoint_interval_secs() -> f32 {
    30.0
}

fn default_stats_interval_secs() -> f32 {
    30.0
}

fn default_respect_robots_txt() -> bool {
    true
}

fn default_handle_sigint() -> bool {
    true
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.user_agents.is_empty() {
            anyhow::bail!("userAgents must not be empty");
        }
        if self.global_concurrency == 0 || self.domain_concurrency == 0 {
            anyhow::bail!("concurrency caps must be at least 1");
        }
        let [low, high] = self.delay_range_secs;
        if !(0.0..=high).contains(&low) {
            anyhow::bail!("delayRangeSecs must satisfy 0 <= low <= high, got [{low}, {high}]");
        }
        if self.request_timeout_secs <= 0.0 {
            anyhow::bail!("requestTimeoutSecs must be positive");
        }
        if self.body_sample_bytes == 0 {
            anyhow::bail!("bodySampleBytes must be at least 1");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("maxAttempts must be at least 1");
        }
        if self.retry_base_delay_secs < 0.0 || self.retry_max_delay_secs < 0.0 {
            anyhow::bail!("retry delays must not be negative");
        }
        if self.backoff_multiplier < 1.0 {
            anyhow::bail!("backoffMultiplier must be at least 1.0");
        }
        if self.backoff_server_error_secs < 0.0
            || self.backoff_rate_limited_secs < 0.0
            || self.backoff_denied_secs < 0.0
            || self.backoff_ceiling_secs < 0.0
        {
            anyhow::bail!("backoff durations must not be negative");
        }
        if self.checkpoint_interval_secs <= 0.0 || self.stats_interval_secs <= 0.0 {
            anyhow::bail!("intervals must be positive");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f32(self.retry_base_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs_f32(self.retry_max_delay_secs)
    }

    pub fn backoff_ceiling(&self) -> Duration {
        Duration::from_secs_f32(self.backoff_ceiling_secs)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs_f32(self.checkpoint_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs_f32(self.stats_interval_secs)
    }
}
