use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, io, thread};

use anyhow::{Context, Result};
use charter_crawler::{
    crawl, format_duration, CrawlerConfig, HttpFetcher, ProgressDoc, ProgressLedger,
};
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use tokio::runtime;

mod seed;

/// Polite, resumable crawler for charter school websites
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[clap(name = "crawl")]
    Crawl(CrawlArgs),
    #[clap(name = "status")]
    Status(StatusArgs),
    #[clap(hide = true)]
    Completion,
}

/// Crawl every seeded site, resuming from the progress file
#[derive(Debug, clap::Args)]
pub struct CrawlArgs {
    /// CSV file with one school per row (needs cds_code and website columns)
    #[clap(parse(from_os_str), long, short)]
    pub seeds: PathBuf,
    /// Resumable progress file, created on first run
    #[clap(parse(from_os_str), long, short, default_value = "scraping_progress.json")]
    pub progress_file: PathBuf,
    /// Optional default crawler yaml configuration file
    #[clap(env = "CHARTER_CRAWL_CONFIG", parse(from_os_str), long)]
    pub crawler_config: Option<PathBuf>,
    /// Override crawler's global concurrency cap
    #[clap(long)]
    pub concurrency: Option<usize>,
    /// Override crawler's per-domain concurrency cap
    #[clap(long)]
    pub domain_concurrency: Option<usize>,
    /// Override crawler's maximum fetch attempts per URL
    #[clap(long)]
    pub max_attempts: Option<u32>,
    /// Only crawl the first N seeds
    #[clap(long)]
    pub limit: Option<usize>,
    /// Skip the robots.txt check
    #[clap(long)]
    pub ignore_robots: bool,
    /// No SIGINT handling, the run cannot drain gracefully
    #[clap(long)]
    pub no_sigint: bool,
    /// When quiet no logs are outputted
    #[clap(long, short)]
    pub quiet: bool,
}

impl TryFrom<&CrawlArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CrawlArgs) -> Result<Self, Self::Error> {
        let mut conf = if let Some(file) = args.crawler_config.as_ref().map(File::open) {
            serde_yaml::from_reader(file?)?
        } else {
            CrawlerConfig::default()
        };
        if let Some(concurrency) = args.concurrency {
            conf.global_concurrency = concurrency;
        }
        if let Some(domain_concurrency) = args.domain_concurrency {
            conf.domain_concurrency = domain_concurrency;
        }
        if let Some(max_attempts) = args.max_attempts {
            conf.max_attempts = max_attempts;
        }
        if args.ignore_robots {
            conf.respect_robots_txt = false;
        }
        if args.no_sigint {
            conf.handle_sigint = false;
        }
        Ok(conf)
    }
}

pub fn run_crawl(args: CrawlArgs) -> Result<()> {
    let conf: CrawlerConfig = (&args).try_into()?;
    conf.validate()?;

    let mut seeds = seed::load_seeds(&args.seeds)?;
    if let Some(limit) = args.limit {
        seeds.truncate(limit);
    }
    anyhow::ensure!(
        !seeds.is_empty(),
        "no crawlable rows in {}",
        args.seeds.display()
    );

    let ledger = ProgressLedger::load(&args.progress_file, seeds)?;
    let fetcher = HttpFetcher::new(&conf);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let summary = rt.block_on(crawl(&conf, &fetcher, ledger))?;

    if !summary.fully_done() {
        let snap = summary.snapshot;
        anyhow::bail!(
            "{} of {} items did not finish ({} failed, {} still pending)",
            snap.total - snap.done,
            snap.total,
            snap.failed,
            snap.pending + snap.in_flight,
        );
    }
    Ok(())
}

/// Print a snapshot of a run's progress file
#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Progress file written by the crawl command
    #[clap(parse(from_os_str), long, short, default_value = "scraping_progress.json")]
    pub progress_file: PathBuf,
}

pub fn run_status(args: StatusArgs) -> Result<()> {
    // The crawler may be mid-checkpoint; give one transient failure a
    // second chance before reporting it.
    let doc = ProgressDoc::read(&args.progress_file)
        .or_else(|_| {
            thread::sleep(Duration::from_millis(200));
            ProgressDoc::read(&args.progress_file)
        })
        .with_context(|| format!("cannot read {}", args.progress_file.display()))?;

    let snap = doc.counters;
    println!("status:     {}", format!("{:?}", doc.status).to_lowercase());
    println!("started:    {}", doc.started_at.to_rfc3339());
    println!("last write: {}", doc.last_write_at.to_rfc3339());
    println!(
        "items:      {} total | {} done, {} failed, {} in flight, {} pending",
        snap.total, snap.done, snap.failed, snap.in_flight, snap.pending,
    );

    let settled = snap.done + snap.failed;
    let elapsed = (doc.last_write_at - doc.started_at)
        .to_std()
        .unwrap_or_default();
    if settled > 0 && !elapsed.is_zero() {
        let rate = settled as f64 / elapsed.as_secs_f64();
        println!("elapsed:    {}", format_duration(elapsed));
        let remaining = snap.pending + snap.in_flight;
        if remaining > 0 && rate > 0.0 {
            let eta = Duration::from_secs_f64(remaining as f64 / rate);
            println!("rate:       {rate:.2} items/s, eta {}", format_duration(eta));
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Crawl(args) => {
            if !args.quiet {
                if env::var_os("RUST_LOG").is_none() {
                    env::set_var("RUST_LOG", "charter_crawler=info,charter_crawl=info");
                }
                env_logger::init();
            }
            run_crawl(args)
        }
        SubCommand::Status(args) => run_status(args),
        SubCommand::Completion => {
            generate(
                Shell::Bash,
                &mut Args::command(),
                "charter-crawl",
                &mut io::stdout(),
            );
            Ok(())
        }
    }
}
