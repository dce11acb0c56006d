use std::fmt;

use crate::fetch::{FetchOutcome, FetchStatus};

/// Cooldown severity attached to a soft-block signal. The tier decides
/// the base cooldown the Backoff Registry applies to the whole domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTier {
    /// Plain 5xx: the server is struggling, short cooldown.
    ServerError,
    /// 429 or 503: explicit rate limiting.
    RateLimited,
    /// 403 or a blocking phrase in the body: deliberate denial.
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    /// One request failed, the domain itself is not implicated.
    Retryable(String),
    /// The domain appears to be actively pushing back.
    Blocked(BlockTier),
    /// The resource does not exist; retrying cannot help.
    Fatal(u16),
}

impl Verdict {
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Retryable(reason) => write!(f, "retryable: {reason}"),
            Self::Blocked(BlockTier::ServerError) => write!(f, "blocked: server error"),
            Self::Blocked(BlockTier::RateLimited) => write!(f, "blocked: rate limited"),
            Self::Blocked(BlockTier::Denied) => write!(f, "blocked: denied"),
            Self::Fatal(status) => write!(f, "fatal: http {status}"),
        }
    }
}

/// Map one fetch outcome to a verdict. Rules apply in priority order;
/// the status line wins over the body, so a 503 carrying a captcha page
/// is still classified by its status.
pub fn classify(outcome: &FetchOutcome, phrases: &[String]) -> Verdict {
    let status = match &outcome.status {
        FetchStatus::Transport(e) => return Verdict::Retryable(e.to_string()),
        FetchStatus::Http(status) => *status,
    };

    match status {
        429 | 503 => Verdict::Blocked(BlockTier::RateLimited),
        500..=599 => Verdict::Blocked(BlockTier::ServerError),
        403 => Verdict::Blocked(BlockTier::Denied),
        200..=299 => {
            if contains_blocking_phrase(&outcome.body_sample, phrases) {
                Verdict::Blocked(BlockTier::Denied)
            } else {
                Verdict::Success
            }
        }
        400..=499 => Verdict::Fatal(status),
        // 1xx and stray 3xx are odd enough to be worth another attempt.
        _ => Verdict::Retryable(format!("unexpected http {status}")),
    }
}

fn contains_blocking_phrase(sample: &str, phrases: &[String]) -> bool {
    if sample.is_empty() || phrases.is_empty() {
        return false;
    }
    let sample = sample.to_lowercase();
    phrases.iter().any(|p| sample.contains(&p.to_lowercase()))
}
