use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::ledger::ProgressLedger;
use crate::scheduler::RunSummary;
use crate::throttle::DomainThrottle;

/// Periodic read-only reporting of ledger and throttle state. Aborted
/// by the scheduler when the run ends.
pub(crate) fn spawn_reporter(
    interval: Duration,
    ledger: Arc<Mutex<ProgressLedger>>,
    throttle: Arc<DomainThrottle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut tick = time::interval(interval);
        tick.tick().await; // skip the immediate tick
        loop {
            tick.tick().await;
            let snap = ledger.lock().unwrap().counts();
            let th = throttle.snapshot(Instant::now());
            let settled = snap.done + snap.failed;
            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { settled as f64 / elapsed } else { 0.0 };
            let remaining = snap.pending + snap.in_flight;
            let eta = if rate > 0.0 && remaining > 0 {
                format_duration(Duration::from_secs_f64(remaining as f64 / rate))
            } else {
                "n/a".to_string()
            };
            log::info!(
                "progress: {}/{} done, {} failed, {} in flight, {} pending | {} domains cooling | {rate:.2}/s, eta {eta}",
                snap.done,
                snap.total,
                snap.failed,
                snap.in_flight,
                snap.pending,
                th.cooling,
            );
        }
    })
}

pub(crate) fn log_summary(summary: &RunSummary) {
    let snap = &summary.snapshot;
    let settled = snap.done + snap.failed;
    let success_rate = if settled > 0 {
        snap.done as f64 * 100.0 / settled as f64
    } else {
        0.0
    };
    log::info!(
        "run {:?} in {}: {} done, {} failed, {} left over ({success_rate:.1}% success, {} dispatches)",
        summary.state,
        format_duration(summary.elapsed),
        snap.done,
        snap.failed,
        snap.pending + snap.in_flight,
        summary.dispatches,
    );
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;
    let rest = secs % 60;
    if days > 0 {
        format!("{days}d {hours:02}h {mins:02}m {rest:02}s")
    } else if hours > 0 {
        format!("{hours:02}h {mins:02}m {rest:02}s")
    } else {
        format!("{mins:02}m {rest:02}s")
    }
}
