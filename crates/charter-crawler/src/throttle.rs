use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::backoff;
use crate::classify::BlockTier;
use crate::config::CrawlerConfig;

/// Per-domain accounting: concurrency slots, request pacing and
/// soft-block cooldowns, all behind one lock so an admission check and
/// its acquisition are a single atomic step.
pub struct DomainThrottle {
    states: Mutex<HashMap<String, DomainState>>,
    conf: CrawlerConfig,
}

#[derive(Debug, Default)]
struct DomainState {
    in_flight: usize,
    last_dispatch: Option<Instant>,
    cooldown_until: Option<Instant>,
    consecutive_blocks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The domain is at its concurrency cap.
    AtCapacity,
    /// The randomized inter-request delay has not elapsed.
    TooSoon,
    /// The domain is cooling down after a block signal.
    CoolingDown,
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtCapacity => write!(f, "at capacity"),
            Self::TooSoon => write!(f, "too soon"),
            Self::CoolingDown => write!(f, "cooling down"),
        }
    }
}

/// Read-only view for the stats reporter.
#[derive(Debug, Clone, Default)]
pub struct ThrottleSnapshot {
    pub domains: usize,
    pub in_flight: usize,
    pub cooling: usize,
}

impl DomainThrottle {
    pub fn new(conf: &CrawlerConfig) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            conf: conf.clone(),
        }
    }

    /// Try to take a dispatch slot for `domain`. On success the slot is
    /// held until [`release`](Self::release); the last-dispatch stamp is
    /// recorded as part of the same critical section.
    pub fn try_acquire(&self, domain: &str, now: Instant) -> Result<(), Refusal> {
        let mut states = self.states.lock().unwrap();
        let st = states.entry(domain.to_string()).or_default();

        if st.cooldown_until.is_some_and(|until| now < until) {
            return Err(Refusal::CoolingDown);
        }
        if st.in_flight >= self.conf.domain_concurrency {
            return Err(Refusal::AtCapacity);
        }
        if let Some(last) = st.last_dispatch {
            if now.duration_since(last) < self.draw_delay() {
                return Err(Refusal::TooSoon);
            }
        }

        st.in_flight += 1;
        st.last_dispatch = Some(now);
        Ok(())
    }

    /// Return a slot. Always called on fetch completion, before the
    /// outcome is even classified.
    pub fn release(&self, domain: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(st) = states.get_mut(domain) {
            st.in_flight = st.in_flight.saturating_sub(1);
        }
    }

    /// Enter (or escalate) a cooldown for `domain`. A repeat signal
    /// while the previous cooldown is still running escalates; one that
    /// arrives after it decayed restarts at the tier base.
    pub fn on_blocked(&self, domain: &str, tier: BlockTier, now: Instant) -> Duration {
        let mut states = self.states.lock().unwrap();
        let st = states.entry(domain.to_string()).or_default();

        let still_hot = st.cooldown_until.is_some_and(|until| now < until);
        st.consecutive_blocks = if still_hot { st.consecutive_blocks + 1 } else { 1 };

        let cooldown = backoff::cooldown(tier, st.consecutive_blocks, &self.conf);
        st.cooldown_until = Some(now + cooldown);
        log::warn!(
            "{domain}: entering cooldown for {:.0}s ({tier:?}, {} consecutive)",
            cooldown.as_secs_f32(),
            st.consecutive_blocks,
        );
        cooldown
    }

    /// A single success proves the domain is reachable again: clear any
    /// cooldown and reset the escalation count.
    pub fn on_success(&self, domain: &str) {
        let mut states = self.states.lock().unwrap();
        if let Some(st) = states.get_mut(domain) {
            if st.cooldown_until.is_some() || st.consecutive_blocks > 0 {
                log::info!("{domain}: cooldown cleared");
            }
            st.cooldown_until = None;
            st.consecutive_blocks = 0;
        }
    }

    pub fn is_eligible(&self, domain: &str, now: Instant) -> bool {
        let states = self.states.lock().unwrap();
        match states.get(domain) {
            Some(st) => !st.cooldown_until.is_some_and(|until| now < until),
            None => true,
        }
    }

    pub fn snapshot(&self, now: Instant) -> ThrottleSnapshot {
        let states = self.states.lock().unwrap();
        ThrottleSnapshot {
            domains: states.len(),
            in_flight: states.values().map(|st| st.in_flight).sum(),
            cooling: states
                .values()
                .filter(|st| st.cooldown_until.is_some_and(|until| now < until))
                .count(),
        }
    }

    fn draw_delay(&self) -> Duration {
        let [low, high] = self.conf.delay_range_secs;
        if low >= high {
            return Duration::from_secs_f32(low);
        }
        Duration::from_secs_f32(rand::thread_rng().gen_range(low..=high))
    }
}
