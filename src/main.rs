use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::MultiProgress;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subharvest::{
    count_subreddits, fit_compare, ingest_dump, init_tracing_once, parse_timestamp, set_global_multiprogress,
    summarize, write_rollup, ArchiveStore, Credentials, Harvester, HarvestOptions, LookupApi, PushshiftClient,
    RedditClient, RetryPolicy, WriterOptions, DEFAULT_SEARCH_URL,
};

#[derive(Parser)]
#[command(author, version, about = "Harvest Reddit submissions into flat files or a partitioned archive")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Search endpoint base URL
    #[arg(long, global = true, env = "SUBHARVEST_SEARCH_URL", default_value = DEFAULT_SEARCH_URL)]
    search_url: String,

    /// Records requested per page
    #[arg(long, global = true, env = "SUBHARVEST_PAGE_SIZE", default_value_t = 500)]
    page_size: usize,

    /// Pause between attempts of a failing request, in milliseconds
    #[arg(long, global = true, env = "SUBHARVEST_BACKOFF_MS", default_value_t = 1000)]
    backoff_ms: u64,

    /// Give up on a request after this many attempts (retries forever when unset)
    #[arg(long, global = true, env = "SUBHARVEST_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "SUBHARVEST_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// JSON credentials for the authenticated lookup; enrichment is skipped without it
    #[arg(long, global = true, env = "SUBHARVEST_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Writer memory budget in MB
    #[arg(long, global = true, env = "SUBHARVEST_MEMORY_BUDGET_MB", default_value_t = 256.0)]
    memory_budget_mb: f64,

    /// Skip stickied/announcement submissions before buffering
    #[arg(long, global = true, env = "SUBHARVEST_DROP_PINNED")]
    drop_pinned: bool,

    /// Append different partitions concurrently within one flush
    #[arg(long, global = true, env = "SUBHARVEST_PARALLEL_FLUSH")]
    parallel_flush: bool,

    /// Archive zstd level
    #[arg(long, global = true, env = "SUBHARVEST_ZSTD_LEVEL", default_value_t = 3)]
    zstd_level: i32,

    /// Archive append buffer in KiB
    #[arg(long, global = true, env = "SUBHARVEST_WRITE_BUFFER_KB", default_value_t = 256)]
    write_buffer_kb: usize,

    /// Flush early when available RAM drops below this fraction (e.g. 0.1)
    #[arg(long, global = true, env = "SUBHARVEST_LOW_MEMORY_FLUSH")]
    low_memory_flush: Option<f64>,

    /// Disable progress bars (milestones are still logged)
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest one subreddit page by page into a CSV file
    Download {
        #[arg(long)]
        subreddit: String,
        /// Lower bound: YYYY-MM-DD, RFC3339 or unix seconds
        #[arg(long)]
        after: String,
        /// Upper bound (defaults to now)
        #[arg(long)]
        before: Option<String>,
        #[arg(long)]
        out: PathBuf,
    },

    /// Write one CSV per subreddit and year
    Years {
        /// Comma-separated subreddits
        #[arg(long, value_delimiter = ',')]
        subreddits: Vec<String>,
        /// Comma-separated years
        #[arg(long, value_delimiter = ',')]
        years: Vec<i32>,
        #[arg(long, default_value = "data")]
        folder: PathBuf,
    },

    /// Fetch subreddits into the partitioned archive
    Harvest {
        #[arg(long, value_delimiter = ',')]
        subreddits: Vec<String>,
        #[arg(long)]
        after: String,
        #[arg(long)]
        before: Option<String>,
        #[arg(long, env = "SUBHARVEST_ARCHIVE")]
        archive: PathBuf,
    },

    /// Convert a JSON-lines dump (plain or .zst) into the archive
    Ingest {
        #[arg(long)]
        dump: PathBuf,
        #[arg(long, env = "SUBHARVEST_ARCHIVE")]
        archive: PathBuf,
        #[arg(long, default_value_t = 100_000)]
        chunk_size: usize,
    },

    /// Count submissions per subreddit in a dump
    Count {
        #[arg(long)]
        dump: PathBuf,
        #[arg(long, default_value_t = 100_000)]
        chunk_size: usize,
        /// Also write headerless `subreddit,count` rows here
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Recompute per-subreddit totals of the archive
    Rollup {
        #[arg(long, env = "SUBHARVEST_ARCHIVE")]
        archive: PathBuf,
    },

    /// Descriptive statistics of one archived subreddit
    Stats {
        #[arg(long, env = "SUBHARVEST_ARCHIVE")]
        archive: PathBuf,
        #[arg(long)]
        subreddit: String,
    },

    /// Fit heavy-tail distributions to one archived subreddit
    Fit {
        #[arg(long, env = "SUBHARVEST_ARCHIVE")]
        archive: PathBuf,
        #[arg(long)]
        subreddit: String,
        #[arg(long, value_enum, default_value_t = Metric::NumComments)]
        metric: Metric,
        /// Treat values as continuous
        #[arg(long)]
        continuous: bool,
        #[arg(long, default_value_t = 0.05)]
        p_lim: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Metric {
    Score,
    NumComments,
}

impl CommonArgs {
    fn options(&self) -> HarvestOptions {
        let retry = match self.max_attempts {
            Some(n) => RetryPolicy::bounded(Duration::from_millis(self.backoff_ms), n),
            None => RetryPolicy::forever(Duration::from_millis(self.backoff_ms)),
        };
        HarvestOptions::default()
            .with_search_url(self.search_url.clone())
            .with_page_size(self.page_size)
            .with_retry(retry)
            .with_request_timeout(Duration::from_secs(self.timeout_secs))
            .with_memory_budget_mb(self.memory_budget_mb)
            .with_drop_pinned(self.drop_pinned)
            .with_parallel_flush(self.parallel_flush)
            .with_zstd_level(self.zstd_level)
            .with_write_buffer_bytes(self.write_buffer_kb.saturating_mul(1024))
            .with_low_memory_flush(self.low_memory_flush)
            .with_progress(!self.no_progress)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_archive(path: &Path, opts: &HarvestOptions) -> Result<ArchiveStore> {
    Ok(ArchiveStore::open(path, opts.zstd_level)?.with_write_buffer(opts.write_buffer_bytes))
}

fn main() -> Result<()> {
    init_tracing_once();
    let cli = Cli::parse();
    let opts = cli.common.options();
    opts.validate()?;
    if opts.progress {
        set_global_multiprogress(Arc::new(MultiProgress::new()));
    }

    // Credentials are loaded once, up front; a bad file stops the run here.
    let lookup = match &cli.common.credentials {
        Some(path) => Some(RedditClient::new(Credentials::load(path)?, opts.request_timeout)?),
        None => None,
    };
    let search = PushshiftClient::new(opts.search_url.clone(), opts.request_timeout)?;
    let mut harvester = Harvester::new(&search).options(opts.clone());
    if let Some(l) = &lookup {
        harvester = harvester.lookup(l as &dyn LookupApi);
    }

    match cli.command {
        Commands::Download { subreddit, after, before, out } => {
            let lower = parse_timestamp(&after)?;
            let upper = before.as_deref().map(parse_timestamp).transpose()?;
            let written = harvester.download_csv(&subreddit, &out, lower, upper)?;
            print_json(&serde_json::json!({ "subreddit": subreddit, "written": written, "file": out }))
        }
        Commands::Years { subreddits, years, folder } => {
            if subreddits.is_empty() || years.is_empty() {
                bail!("--subreddits and --years must both be non-empty");
            }
            let files = harvester.save_posts_year(&subreddits, &years, &folder)?;
            print_json(&files)
        }
        Commands::Harvest { subreddits, after, before, archive } => {
            let lower = parse_timestamp(&after)?;
            let upper = before.as_deref().map(parse_timestamp).transpose()?;
            let store = open_archive(&archive, &opts)?;
            let stats = harvester.harvest(&subreddits, lower, upper, &store)?;
            print_json(&serde_json::json!({
                "batches": stats.batches,
                "records": stats.records,
                "dropped_pinned": stats.dropped_pinned,
                "flushes": stats.flushes,
                "appends": stats.appends,
            }))
        }
        Commands::Ingest { dump, archive, chunk_size } => {
            let store = open_archive(&archive, &opts)?;
            let stats = ingest_dump(&dump, chunk_size, &store, WriterOptions::from(&opts))?;
            print_json(&serde_json::json!({ "records": stats.records, "flushes": stats.flushes, "appends": stats.appends }))
        }
        Commands::Count { dump, chunk_size, save } => {
            let counts = count_subreddits(&dump, chunk_size, save.as_deref())?;
            print_json(&counts)
        }
        Commands::Rollup { archive } => {
            let store = open_archive(&archive, &opts)?;
            print_json(&write_rollup(&store)?)
        }
        Commands::Stats { archive, subreddit } => {
            let store = open_archive(&archive, &opts)?;
            let records = store.read_subreddit(&subreddit)?;
            if records.is_empty() {
                bail!("r/{subreddit} is not in {}", archive.display());
            }
            print_json(&summarize(&records))
        }
        Commands::Fit { archive, subreddit, metric, continuous, p_lim } => {
            let store = open_archive(&archive, &opts)?;
            let records = store.read_subreddit(&subreddit)?;
            let data: Vec<f64> = records
                .iter()
                .map(|r| match metric {
                    Metric::Score => r.score as f64,
                    Metric::NumComments => r.num_comments as f64,
                })
                .collect();
            print_json(&fit_compare(&data, !continuous, p_lim)?)
        }
    }
}
