use std::time::Duration;

use crate::classify::BlockTier;
use crate::config::CrawlerConfig;

// Beyond this the multiplier overflows any sane ceiling anyway.
const MAX_ESCALATIONS: u32 = 16;

pub(crate) fn tier_base(tier: BlockTier, conf: &CrawlerConfig) -> Duration {
    let secs = match tier {
        BlockTier::ServerError => conf.backoff_server_error_secs,
        BlockTier::RateLimited => conf.backoff_rate_limited_secs,
        BlockTier::Denied => conf.backoff_denied_secs,
    };
    Duration::from_secs_f32(secs)
}

/// Cooldown for the nth consecutive block (1-based), escalating
/// multiplicatively up to the configured ceiling.
pub(crate) fn cooldown(tier: BlockTier, consecutive: u32, conf: &CrawlerConfig) -> Duration {
    let exp = consecutive.saturating_sub(1).min(MAX_ESCALATIONS);
    let scaled = tier_base(tier, conf).mul_f64(conf.backoff_multiplier.powi(exp as i32));
    scaled.min(conf.backoff_ceiling())
}
