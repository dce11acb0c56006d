use std::time::Duration;

use rand::Rng;

use crate::classify::Verdict;
use crate::config::CrawlerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Re-queue the item, not before this delay.
    After(Duration),
    GiveUp,
}

/// Decide whether an item that just finished attempt `attempts` gets
/// another one. Delays use full jitter: a uniform draw from zero up to
/// the exponential cap, so a burst of simultaneous failures does not
/// retry in lockstep.
pub(crate) fn decide(attempts: u32, verdict: &Verdict, conf: &CrawlerConfig) -> Decision {
    match verdict {
        Verdict::Success => Decision::GiveUp,
        Verdict::Fatal(_) => Decision::GiveUp,
        Verdict::Retryable(_) | Verdict::Blocked(_) => {
            if attempts >= conf.max_attempts {
                return Decision::GiveUp;
            }
            Decision::After(full_jitter(backoff_cap(attempts, conf)))
        }
    }
}

fn backoff_cap(attempts: u32, conf: &CrawlerConfig) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    conf.retry_base_delay()
        .mul_f64(2f64.powi(exp as i32))
        .min(conf.retry_max_delay())
}

fn full_jitter(cap: Duration) -> Duration {
    if cap.is_zero() {
        return cap;
    }
    let millis = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BlockTier;

    fn conf() -> CrawlerConfig {
        CrawlerConfig {
            max_attempts: 3,
            retry_base_delay_secs: 1.0,
            retry_max_delay_secs: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn fatal_is_never_retried() {
        assert_eq!(decide(1, &Verdict::Fatal(404), &conf()), Decision::GiveUp);
    }

    #[test]
    fn retryable_and_blocked_retry_until_the_ceiling() {
        let conf = conf();
        let retryable = Verdict::Retryable("timeout".into());
        let blocked = Verdict::Blocked(BlockTier::RateLimited);

        assert!(matches!(decide(1, &retryable, &conf), Decision::After(_)));
        assert!(matches!(decide(2, &blocked, &conf), Decision::After(_)));
        assert_eq!(decide(3, &retryable, &conf), Decision::GiveUp);
        assert_eq!(decide(4, &blocked, &conf), Decision::GiveUp);
    }

    #[test]
    fn jittered_delay_stays_under_the_exponential_cap() {
        let conf = conf();
        for _ in 0..100 {
            match decide(2, &Verdict::Retryable("x".into()), &conf) {
                // Second attempt failed: cap is base * 2^1.
                Decision::After(d) => assert!(d <= Duration::from_secs(2)),
                Decision::GiveUp => panic!("expected a retry"),
            }
        }
    }

    #[test]
    fn delay_cap_is_bounded_by_the_max() {
        let conf = conf();
        assert_eq!(backoff_cap(10, &conf), Duration::from_secs(10));
        assert_eq!(backoff_cap(u32::MAX, &conf), Duration::from_secs(10));
    }
}
