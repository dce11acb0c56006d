use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// Consecutive checkpoint failures tolerated before the run aborts;
// beyond this, resumability would be lost without anyone noticing.
const MAX_PERSIST_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SeedItem {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    Pending,
    InFlight,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub state: ItemState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retry gate, in-memory only: the scheduler must not dispatch this
    /// item again before the instant passes.
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

impl WorkItem {
    fn from_seed(seed: SeedItem) -> Self {
        let (domain, state, last_error) = match domain_of(&seed.url) {
            Ok(domain) => (domain, ItemState::Pending, None),
            Err(e) => (String::new(), ItemState::Failed, Some(format!("invalid url: {e}"))),
        };
        Self {
            id: seed.id,
            url: seed.url,
            domain,
            state,
            attempts: 0,
            last_attempt_at: None,
            last_error,
            not_before: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ItemState::Done | ItemState::Failed)
    }
}

fn domain_of(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw).with_context(|| format!("cannot parse {raw}"))?;
    let host = url
        .host_str()
        .with_context(|| format!("no host in {raw}"))?;
    Ok(host.to_lowercase())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub done: usize,
    pub failed: usize,
}

/// The on-disk progress document. Written atomically, so an external
/// monitor can re-read it at any point mid-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDoc {
    pub started_at: DateTime<Utc>,
    pub last_write_at: DateTime<Utc>,
    pub status: RunStatus,
    pub counters: ProgressSnapshot,
    pub items: BTreeMap<String, WorkItem>,
}

impl ProgressDoc {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Durable record of every work item's lifecycle. Owns the item set;
/// the scheduler and stats reporter go through it for every transition
/// and snapshot.
pub struct ProgressLedger {
    path: Option<PathBuf>,
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
    started_at: DateTime<Utc>,
    write_failures: u32,
}

impl ProgressLedger {
    /// An in-memory ledger; nothing is persisted until a path is known.
    pub fn new(seeds: Vec<SeedItem>) -> Self {
        let mut items: Vec<WorkItem> = Vec::with_capacity(seeds.len());
        let mut index = HashMap::with_capacity(seeds.len());
        for seed in seeds {
            if index.contains_key(&seed.id) {
                log::warn!("duplicate seed id {} skipped", seed.id);
                continue;
            }
            index.insert(seed.id.clone(), items.len());
            items.push(WorkItem::from_seed(seed));
        }
        Self {
            path: None,
            items,
            index,
            started_at: Utc::now(),
            write_failures: 0,
        }
    }

    /// Build the ledger from the seed list, merged with any progress
    /// already on disk: done and terminally failed items keep their
    /// state, items caught in flight by an unclean shutdown go back to
    /// pending, and file entries missing from the seed list are kept.
    pub fn load(path: &Path, seeds: Vec<SeedItem>) -> Result<Self> {
        let mut ledger = Self::new(seeds);
        ledger.path = Some(path.to_path_buf());

        if !path.exists() {
            return Ok(ledger);
        }
        let doc = match ProgressDoc::read(path) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("ignoring unreadable progress file: {e:#}");
                return Ok(ledger);
            }
        };

        ledger.started_at = doc.started_at;
        for (id, mut prior) in doc.items {
            if prior.state == ItemState::InFlight {
                prior.state = ItemState::Pending;
            }
            if let Some(&i) = ledger.index.get(&id) {
                let item = &mut ledger.items[i];
                item.state = prior.state;
                item.attempts = prior.attempts;
                item.last_attempt_at = prior.last_attempt_at;
                item.last_error = prior.last_error;
            } else {
                // Not in this run's seed list, but progress is never
                // silently dropped.
                ledger.index.insert(id, ledger.items.len());
                ledger.items.push(prior);
            }
        }
        Ok(ledger)
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Ids still worth dispatching, in seed order.
    pub fn pending_ids(&self) -> VecDeque<String> {
        self.items
            .iter()
            .filter(|item| item.state == ItemState::Pending)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn begin_attempt(&mut self, id: &str, at: DateTime<Utc>) {
        if let Some(&i) = self.index.get(id) {
            let item = &mut self.items[i];
            item.state = ItemState::InFlight;
            item.attempts += 1;
            item.last_attempt_at = Some(at);
            item.not_before = None;
        }
    }

    pub fn finish(&mut self, id: &str, state: ItemState, last_error: Option<String>) {
        if let Some(&i) = self.index.get(id) {
            let item = &mut self.items[i];
            item.state = state;
            item.last_error = last_error;
            item.not_before = None;
        }
    }

    pub fn reschedule(&mut self, id: &str, not_before: Instant, last_error: String) {
        if let Some(&i) = self.index.get(id) {
            let item = &mut self.items[i];
            item.state = ItemState::Pending;
            item.last_error = Some(last_error);
            item.not_before = Some(not_before);
        }
    }

    pub fn counts(&self) -> ProgressSnapshot {
        let mut snap = ProgressSnapshot {
            total: self.items.len(),
            ..Default::default()
        };
        for item in &self.items {
            match item.state {
                ItemState::Pending => snap.pending += 1,
                ItemState::InFlight => snap.in_flight += 1,
                ItemState::Done => snap.done += 1,
                ItemState::Failed => snap.failed += 1,
            }
        }
        snap
    }

    pub fn is_complete(&self) -> bool {
        self.items.iter().all(WorkItem::is_terminal)
    }

    /// Persist the current state: serialize the whole document, write a
    /// sibling temp file, then rename over the target so a torn write
    /// can never corrupt the progress file. A few consecutive write
    /// failures are logged and tolerated; past that limit they abort
    /// the run.
    pub fn checkpoint(&mut self, status: RunStatus) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        match self.write_doc(&path, status) {
            Ok(()) => {
                self.write_failures = 0;
                let snap = self.counts();
                log::info!(
                    "checkpoint written: {}/{} done, {} failed",
                    snap.done,
                    snap.total,
                    snap.failed,
                );
                Ok(())
            }
            Err(e) => {
                self.write_failures += 1;
                if self.write_failures > MAX_PERSIST_FAILURES {
                    return Err(e.context("progress file is persistently unwritable"));
                }
                log::error!(
                    "checkpoint failed ({} in a row, keeping going): {e:#}",
                    self.write_failures,
                );
                Ok(())
            }
        }
    }

    fn write_doc(&self, path: &Path, status: RunStatus) -> Result<()> {
        let doc = ProgressDoc {
            started_at: self.started_at,
            last_write_at: Utc::now(),
            status,
            counters: self.counts(),
            items: self
                .items
                .iter()
                .map(|item| (item.id.clone(), item.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}
