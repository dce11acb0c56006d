use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::classify::{classify, Verdict};
use crate::config::CrawlerConfig;
use crate::fetch::{FetchOutcome, Fetcher};
use crate::ledger::{ItemState, ProgressLedger, ProgressSnapshot, RunStatus};
use crate::retry::{self, Decision};
use crate::robots::RobotsGate;
use crate::stats;
use crate::throttle::DomainThrottle;

// Park time when items exist but none is currently dispatchable.
const DISPATCH_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    /// Stop requested: no new dispatches, in-flight fetches finish.
    Draining,
    Completed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub snapshot: ProgressSnapshot,
    pub dispatches: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    /// True when every item ended up done, with nothing left behind.
    pub fn fully_done(&self) -> bool {
        self.snapshot.done == self.snapshot.total
    }
}

enum Fetched {
    Outcome(FetchOutcome),
    RobotsDenied,
}

/// Run the whole seed set to completion (or until interrupted),
/// checkpointing progress as it goes. The scheduler owns admission:
/// FIFO over the seed order, filtered by retry gates, robots verdicts
/// and the per-domain throttle, bounded by the global cap.
pub async fn crawl<F>(conf: &CrawlerConfig, fetcher: &F, ledger: ProgressLedger) -> Result<RunSummary>
where
    F: Fetcher,
{
    conf.validate()?;

    let started = Instant::now();
    let throttle = Arc::new(DomainThrottle::new(conf));
    let ledger = Arc::new(Mutex::new(ledger));
    let robots = RobotsGate::new();

    let mut queue = ledger.lock().unwrap().pending_ids();
    {
        let snap = ledger.lock().unwrap().counts();
        log::info!("starting run: {} pending of {} items", queue.len(), snap.total);
    }

    let reporter = stats::spawn_reporter(conf.stats_interval(), ledger.clone(), throttle.clone());

    let mut in_flight = FuturesUnordered::new();
    let mut checkpoint = time::interval(conf.checkpoint_interval());
    checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
    checkpoint.tick().await; // the first tick fires immediately

    let mut state = RunState::Running;
    let mut dispatches: u64 = 0;

    let run_result: Result<()> = loop {
        if state == RunState::Running {
            let now = Instant::now();
            let mut passes = queue.len();
            while passes > 0 && in_flight.len() < conf.global_concurrency {
                passes -= 1;
                let Some(id) = queue.pop_front() else {
                    break;
                };
                let (url, domain, gated) = {
                    let lg = ledger.lock().unwrap();
                    match lg.get(&id) {
                        Some(item) => (
                            item.url.clone(),
                            item.domain.clone(),
                            item.not_before.is_some_and(|t| now < t),
                        ),
                        None => continue,
                    }
                };
                if gated || throttle.try_acquire(&domain, now).is_err() {
                    queue.push_back(id);
                    continue;
                }
                ledger.lock().unwrap().begin_attempt(&id, Utc::now());
                dispatches += 1;
                log::debug!("{id}: fetching {url}");
                in_flight.push(run_fetch(fetcher, &robots, conf, id, url, domain));
            }
        }

        let all_done = queue.is_empty() && in_flight.is_empty();
        if all_done || (state == RunState::Draining && in_flight.is_empty()) {
            if all_done {
                state = RunState::Completed;
            }
            break Ok(());
        }

        tokio::select! {
            Some((id, domain, fetched)) = in_flight.next(), if !in_flight.is_empty() => {
                settle(&throttle, &ledger, conf, &mut queue, id, domain, fetched);
            }
            _ = checkpoint.tick() => {
                if let Err(e) = ledger.lock().unwrap().checkpoint(RunStatus::Running) {
                    break Err(e);
                }
            }
            _ = tokio::signal::ctrl_c(), if conf.handle_sigint && state == RunState::Running => {
                log::warn!("interrupt received, draining {} in-flight fetches", in_flight.len());
                state = RunState::Draining;
            }
            _ = time::sleep(DISPATCH_POLL) => {}
        }
    };

    reporter.abort();

    // Final checkpoint happens however the loop ended.
    let snapshot = {
        let mut lg = ledger.lock().unwrap();
        let status = if lg.is_complete() {
            RunStatus::Completed
        } else {
            RunStatus::Running
        };
        let persisted = lg.checkpoint(status);
        if run_result.is_ok() {
            persisted?;
        }
        lg.counts()
    };
    run_result?;

    let summary = RunSummary {
        state,
        snapshot,
        dispatches,
        elapsed: started.elapsed(),
    };
    stats::log_summary(&summary);
    Ok(summary)
}

async fn run_fetch<F: Fetcher>(
    fetcher: &F,
    robots: &RobotsGate,
    conf: &CrawlerConfig,
    id: String,
    url: String,
    domain: String,
) -> (String, String, Fetched) {
    if conf.respect_robots_txt && !robots.allows(fetcher, &url).await {
        return (id, domain, Fetched::RobotsDenied);
    }
    let outcome = fetcher.fetch(&url).await;
    (id, domain, Fetched::Outcome(outcome))
}

fn settle(
    throttle: &DomainThrottle,
    ledger: &Mutex<ProgressLedger>,
    conf: &CrawlerConfig,
    queue: &mut VecDeque<String>,
    id: String,
    domain: String,
    fetched: Fetched,
) {
    // The slot comes back before the outcome is even looked at.
    throttle.release(&domain);

    let outcome = match fetched {
        Fetched::RobotsDenied => {
            log::warn!("{id}: robots.txt disallows fetching, marking failed");
            ledger
                .lock()
                .unwrap()
                .finish(&id, ItemState::Failed, Some("robots: disallowed".into()));
            return;
        }
        Fetched::Outcome(outcome) => outcome,
    };

    let verdict = classify(&outcome, &conf.blocking_phrases);
    let now = Instant::now();
    match &verdict {
        Verdict::Success => throttle.on_success(&domain),
        Verdict::Blocked(tier) => {
            throttle.on_blocked(&domain, *tier, now);
        }
        Verdict::Retryable(_) | Verdict::Fatal(_) => {}
    }

    let mut lg = ledger.lock().unwrap();
    let attempts = lg.get(&id).map(|item| item.attempts).unwrap_or(0);
    match &verdict {
        Verdict::Success => {
            log::info!(
                "{id}: done in {:.2}s (attempt {attempts})",
                outcome.elapsed.as_secs_f32(),
            );
            lg.finish(&id, ItemState::Done, None);
        }
        Verdict::Fatal(_) => {
            log::warn!("{id}: {verdict}, not retrying");
            lg.finish(&id, ItemState::Failed, Some(verdict.label()));
        }
        Verdict::Retryable(_) | Verdict::Blocked(_) => {
            match retry::decide(attempts, &verdict, conf) {
                Decision::After(delay) => {
                    log::info!(
                        "{id}: attempt {attempts} {verdict}, retrying in {:.1}s",
                        delay.as_secs_f32(),
                    );
                    lg.reschedule(&id, now + delay, verdict.label());
                    queue.push_back(id);
                }
                Decision::GiveUp => {
                    log::warn!("{id}: giving up after {attempts} attempts ({verdict})");
                    lg.finish(&id, ItemState::Failed, Some(verdict.label()));
                }
            }
        }
    }
}
