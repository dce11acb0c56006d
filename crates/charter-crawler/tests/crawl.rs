use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use charter_crawler::{
    crawl, CrawlerConfig, FetchOutcome, Fetcher, ItemState, ProgressDoc, ProgressLedger, RunState,
    RunStatus, SeedItem, TransportError,
};
use tokio::time::Instant;

#[derive(Clone, Copy)]
enum Step {
    Ok(&'static str),
    Status(u16),
    Transport,
}

/// Plays back a fixed script per URL and records every call, so tests
/// can assert on attempt counts, timing gaps and concurrency windows.
struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
    domain_in_flight: Mutex<HashMap<String, usize>>,
    domain_max: Mutex<HashMap<String, usize>>,
    total_in_flight: AtomicUsize,
    total_max: AtomicUsize,
    robots: Option<&'static str>,
}

impl ScriptedFetcher {
    fn new(latency: Duration) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            latency,
            calls: Mutex::new(Vec::new()),
            domain_in_flight: Mutex::new(HashMap::new()),
            domain_max: Mutex::new(HashMap::new()),
            total_in_flight: AtomicUsize::new(0),
            total_max: AtomicUsize::new(0),
            robots: None,
        }
    }

    fn with(self, url: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().insert(url.to_string(), steps);
        self
    }

    fn with_robots(mut self, body: &'static str) -> Self {
        self.robots = Some(body);
        self
    }

    fn starts_for(&self, url: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.starts_for(url).len()
    }

    fn max_in_flight_for(&self, host: &str) -> usize {
        self.domain_max.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

fn host_of(url: &str) -> String {
    url.split('/').nth(2).expect("test urls are absolute").to_string()
}

impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));

        let host = host_of(url);
        {
            let mut in_flight = self.domain_in_flight.lock().unwrap();
            let n = in_flight.entry(host.clone()).or_insert(0);
            *n += 1;
            let mut max = self.domain_max.lock().unwrap();
            let m = max.entry(host.clone()).or_insert(0);
            *m = (*m).max(*n);
        }
        let total = self.total_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_max.fetch_max(total, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;

        self.total_in_flight.fetch_sub(1, Ordering::SeqCst);
        *self
            .domain_in_flight
            .lock()
            .unwrap()
            .get_mut(&host)
            .unwrap() -= 1;

        let step = {
            let mut scripts = self.scripts.lock().unwrap();
            let steps = scripts
                .get_mut(url)
                .unwrap_or_else(|| panic!("unexpected fetch of {url}"));
            if steps.len() > 1 {
                steps.remove(0)
            } else {
                steps[0]
            }
        };
        match step {
            Step::Ok(body) => FetchOutcome::http(200, body, self.latency),
            Step::Status(status) => FetchOutcome::http(status, "", self.latency),
            Step::Transport => FetchOutcome::transport(TransportError::Timeout, self.latency),
        }
    }

    async fn fetch_robots(&self, _origin: &str) -> Option<String> {
        self.robots.map(|b| b.to_string())
    }
}

fn test_conf() -> CrawlerConfig {
    CrawlerConfig {
        delay_range_secs: [0.0, 0.0],
        retry_base_delay_secs: 0.5,
        retry_max_delay_secs: 2.0,
        checkpoint_interval_secs: 3600.0,
        stats_interval_secs: 3600.0,
        respect_robots_txt: false,
        handle_sigint: false,
        ..Default::default()
    }
}

fn seed(id: &str, url: &str) -> SeedItem {
    SeedItem {
        id: id.into(),
        url: url.into(),
    }
}

fn read_doc(path: &Path) -> ProgressDoc {
    ProgressDoc::read(path).expect("progress file readable")
}

#[tokio::test(start_paused = true)]
async fn mixed_outcomes_land_in_the_expected_end_states() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let alpha = "https://alpha.example.org/";
    let bravo = "https://bravo.example.org/";
    let charlie = "https://charlie.example.org/";
    let fetcher = ScriptedFetcher::new(Duration::from_millis(50))
        .with(alpha, vec![Step::Ok("<html>welcome</html>")])
        .with(bravo, vec![Step::Status(429), Step::Status(429), Step::Ok("fine now")])
        .with(charlie, vec![Step::Status(404)]);

    let seeds = vec![seed("a", alpha), seed("b", bravo), seed("c", charlie)];
    let ledger = ProgressLedger::load(&path, seeds).unwrap();
    let summary = crawl(&test_conf(), &fetcher, ledger).await.unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.snapshot.done, 2);
    assert_eq!(summary.snapshot.failed, 1);

    let doc = read_doc(&path);
    assert_eq!(doc.status, RunStatus::Completed);
    assert_eq!(doc.items["a"].state, ItemState::Done);
    assert_eq!(doc.items["a"].attempts, 1);
    assert_eq!(doc.items["b"].state, ItemState::Done);
    assert_eq!(doc.items["b"].attempts, 3);
    let charlie_item = &doc.items["c"];
    assert_eq!(charlie_item.state, ItemState::Failed);
    assert_eq!(charlie_item.attempts, 1);
    assert_eq!(charlie_item.last_error.as_deref(), Some("fatal: http 404"));

    // The 429 put bravo's whole domain on cooldown: a full rate-limit
    // interval must separate attempts one and two.
    let starts = fetcher.starts_for(bravo);
    assert_eq!(starts.len(), 3);
    assert!(starts[1].duration_since(starts[0]) >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn per_domain_cap_forbids_overlapping_fetches() {
    let one = "https://school.example.org/";
    let two = "https://school.example.org/staff";
    let fetcher = ScriptedFetcher::new(Duration::from_millis(100))
        .with(one, vec![Step::Ok("ok")])
        .with(two, vec![Step::Ok("ok")]);

    let conf = CrawlerConfig {
        domain_concurrency: 1,
        ..test_conf()
    };
    let ledger = ProgressLedger::new(vec![seed("one", one), seed("two", two)]);
    let summary = crawl(&conf, &fetcher, ledger).await.unwrap();

    assert_eq!(summary.snapshot.done, 2);
    assert_eq!(fetcher.max_in_flight_for("school.example.org"), 1);
}

#[tokio::test(start_paused = true)]
async fn global_cap_bounds_total_in_flight() {
    let urls: Vec<String> = (0..6)
        .map(|i| format!("https://s{i}.example.org/"))
        .collect();
    let mut fetcher = ScriptedFetcher::new(Duration::from_millis(100));
    for url in &urls {
        fetcher = fetcher.with(url, vec![Step::Ok("ok")]);
    }

    let conf = CrawlerConfig {
        global_concurrency: 2,
        ..test_conf()
    };
    let seeds = urls
        .iter()
        .enumerate()
        .map(|(i, url)| seed(&format!("s{i}"), url))
        .collect();
    let summary = crawl(&conf, &fetcher, ProgressLedger::new(seeds)).await.unwrap();

    assert_eq!(summary.snapshot.done, 6);
    assert!(fetcher.total_max.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn transport_failures_retry_exactly_max_attempts_times() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let url = "https://flaky.example.org/";
    let fetcher = ScriptedFetcher::new(Duration::from_millis(20)).with(url, vec![Step::Transport]);

    let conf = CrawlerConfig {
        max_attempts: 5,
        ..test_conf()
    };
    let ledger = ProgressLedger::load(&path, vec![seed("f", url)]).unwrap();
    let summary = crawl(&conf, &fetcher, ledger).await.unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(fetcher.fetch_count(url), 5);

    let doc = read_doc(&path);
    assert_eq!(doc.items["f"].state, ItemState::Failed);
    assert_eq!(doc.items["f"].attempts, 5);
    assert!(doc.items["f"].last_error.as_deref().unwrap().starts_with("retryable"));
}

#[tokio::test(start_paused = true)]
async fn rerunning_a_finished_ledger_dispatches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let url = "https://alpha.example.org/";
    let seeds = || vec![seed("a", url)];

    let fetcher = ScriptedFetcher::new(Duration::from_millis(20)).with(url, vec![Step::Ok("ok")]);
    let ledger = ProgressLedger::load(&path, seeds()).unwrap();
    crawl(&test_conf(), &fetcher, ledger).await.unwrap();

    // Second run: any fetch would panic, there is no script.
    let idle_fetcher = ScriptedFetcher::new(Duration::from_millis(20));
    let ledger = ProgressLedger::load(&path, seeds()).unwrap();
    let summary = crawl(&test_conf(), &idle_fetcher, ledger).await.unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.dispatches, 0);
    assert_eq!(summary.snapshot.done, 1);
}

#[tokio::test(start_paused = true)]
async fn resume_skips_done_items_and_requeues_interrupted_ones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let alpha = "https://alpha.example.org/";
    let bravo = "https://bravo.example.org/";
    let seeds = || vec![seed("a", alpha), seed("b", bravo)];

    // Simulated unclean shutdown: one item done, one caught in flight.
    {
        let mut ledger = ProgressLedger::load(&path, seeds()).unwrap();
        ledger.begin_attempt("a", chrono_now());
        ledger.finish("a", ItemState::Done, None);
        ledger.begin_attempt("b", chrono_now());
        ledger.checkpoint(RunStatus::Running).unwrap();
    }

    let fetcher =
        ScriptedFetcher::new(Duration::from_millis(20)).with(bravo, vec![Step::Ok("ok")]);
    let ledger = ProgressLedger::load(&path, seeds()).unwrap();
    let summary = crawl(&test_conf(), &fetcher, ledger).await.unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.dispatches, 1);
    assert_eq!(fetcher.fetch_count(bravo), 1);

    let doc = read_doc(&path);
    assert_eq!(doc.items["a"].attempts, 1);
    assert_eq!(doc.items["b"].state, ItemState::Done);
    // One interrupted attempt plus the resumed one.
    assert_eq!(doc.items["b"].attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn a_blocked_domain_stalls_its_other_urls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let first = "https://school.example.org/";
    let second = "https://school.example.org/contact";
    let fetcher = ScriptedFetcher::new(Duration::from_millis(50))
        .with(first, vec![Step::Status(403), Step::Ok("ok")])
        .with(second, vec![Step::Ok("ok")]);

    let conf = CrawlerConfig {
        domain_concurrency: 1,
        ..test_conf()
    };
    let seeds = vec![seed("one", first), seed("two", second)];
    let ledger = ProgressLedger::load(&path, seeds).unwrap();
    let summary = crawl(&conf, &fetcher, ledger).await.unwrap();

    assert_eq!(summary.snapshot.done, 2);
    let doc = read_doc(&path);
    assert_eq!(doc.items["one"].attempts, 2);

    // The 403 cooldown gates the domain as a whole, so the second URL
    // cannot start until the full denial interval has passed.
    let first_start = fetcher.starts_for(first)[0];
    let second_start = fetcher.starts_for(second)[0];
    assert!(second_start.duration_since(first_start) >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn robots_denial_is_terminal_without_burning_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("progress.json");

    let url = "https://closed.example.org/";
    let fetcher = ScriptedFetcher::new(Duration::from_millis(20))
        .with(url, vec![Step::Ok("never served")])
        .with_robots("User-agent: *\nDisallow: /");

    let conf = CrawlerConfig {
        respect_robots_txt: true,
        ..test_conf()
    };
    let ledger = ProgressLedger::load(&path, vec![seed("x", url)]).unwrap();
    let summary = crawl(&conf, &fetcher, ledger).await.unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(fetcher.fetch_count(url), 0);

    let doc = read_doc(&path);
    assert_eq!(doc.items["x"].state, ItemState::Failed);
    assert_eq!(doc.items["x"].last_error.as_deref(), Some("robots: disallowed"));
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
