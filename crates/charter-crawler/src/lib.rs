mod backoff;
mod classify;
mod config;
mod fetch;
mod ledger;
mod retry;
mod robots;
mod scheduler;
mod stats;
mod throttle;

pub use classify::{classify, BlockTier, Verdict};
pub use config::CrawlerConfig;
pub use fetch::{FetchOutcome, FetchStatus, Fetcher, HttpFetcher, TransportError};
pub use ledger::{
    ItemState, ProgressDoc, ProgressLedger, ProgressSnapshot, RunStatus, SeedItem, WorkItem,
};
pub use scheduler::{crawl, RunState, RunSummary};
pub use stats::format_duration;
pub use throttle::{DomainThrottle, Refusal, ThrottleSnapshot};

pub use anyhow;
