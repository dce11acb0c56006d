use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use tokio::time::Instant;

use crate::config::CrawlerConfig;

lazy_static! {
    static ref HTTP_CLI: reqwest::Client = reqwest::ClientBuilder::new()
        .gzip(true)
        .deflate(true)
        .build()
        .unwrap();
}

const ACCEPT_VALUE: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";

/// The fetch collaborator: given a URL, produce a [`FetchOutcome`].
///
/// The scheduler treats implementations as opaque, possibly slow and
/// possibly failing. Substituting a different transport (another HTTP
/// client, a headless browser) requires no scheduler changes.
#[allow(async_fn_in_trait)]
pub trait Fetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome;

    /// Fetch `origin`'s robots.txt, `None` when missing or unreachable.
    async fn fetch_robots(&self, origin: &str) -> Option<String> {
        let _ = origin;
        None
    }
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    /// Bounded body prefix, kept only for blocking-text heuristics.
    pub body_sample: String,
    pub elapsed: Duration,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Http(u16),
    Transport(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect,
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connect => write!(f, "connection failed"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl From<&reqwest::Error> for TransportError {
    fn from(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect
        } else {
            Self::Other(e.to_string())
        }
    }
}

impl FetchOutcome {
    pub fn http(status: u16, body_sample: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: FetchStatus::Http(status),
            body_sample: body_sample.into(),
            elapsed,
            fetched_at: Utc::now(),
        }
    }

    pub fn transport(error: TransportError, elapsed: Duration) -> Self {
        Self {
            status: FetchStatus::Transport(error),
            body_sample: String::new(),
            elapsed,
            fetched_at: Utc::now(),
        }
    }
}

/// Stateless pick from the configured pool; no selection state is kept
/// beyond the thread-local rng.
pub(crate) fn pick_user_agent(pool: &[String]) -> &str {
    let i = rand::thread_rng().gen_range(0..pool.len());
    &pool[i]
}

fn truncate_sample(body: &str, max: usize) -> &str {
    if body.len() <= max {
        return body;
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Default transport backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    user_agents: Vec<String>,
    timeout: Duration,
    sample_bytes: usize,
}

impl HttpFetcher {
    pub fn new(conf: &CrawlerConfig) -> Self {
        Self {
            user_agents: conf.user_agents.clone(),
            timeout: conf.request_timeout(),
            sample_bytes: conf.body_sample_bytes,
        }
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let started = Instant::now();
        let resp = HTTP_CLI
            .get(url)
            .header(USER_AGENT, pick_user_agent(&self.user_agents))
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE)
            .timeout(self.timeout)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                FetchOutcome::http(
                    status,
                    truncate_sample(&body, self.sample_bytes),
                    started.elapsed(),
                )
            }
            Err(e) => FetchOutcome::transport(TransportError::from(&e), started.elapsed()),
        }
    }

    async fn fetch_robots(&self, origin: &str) -> Option<String> {
        let url = format!("{origin}/robots.txt");
        let resp = HTTP_CLI
            .get(&url)
            .header(USER_AGENT, pick_user_agent(&self.user_agents))
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.text().await.ok()
    }
}
