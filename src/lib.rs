mod cancel;
mod config;
mod date;
mod error;
mod record;
mod retry;
mod util;
mod mem;
mod progress;

mod search;
mod lookup;
mod fetch;
mod enrich;

mod store;
mod writer;
mod flat;
mod dump;
mod rollup;
mod pipeline;

mod stats;
mod fit;

pub use crate::cancel::CancelToken;
pub use crate::config::{mb_to_bytes, Credentials, HarvestOptions, RetryPolicy, DEFAULT_SEARCH_URL, MAX_LOOKUP_BATCH};
pub use crate::date::{format_day, now_unix, parse_timestamp, year_bounds};
pub use crate::error::{ConfigError, RecordError, RemoteError, RetryError};
pub use crate::record::{estimated_batch_bytes, fullname, parse_records, FieldSelector, Record, RecordBatch, FIELDS, REQUIRED_FIELDS};
pub use crate::retry::{with_retry, Sleeper, ThreadSleeper};

// Remote endpoints and their in-process seams.
pub use crate::search::{parse_search_body, PushshiftClient, SearchApi, SearchQuery};
pub use crate::lookup::{parse_info_body, LiveStats, LookupApi, RedditClient};

// Core stages.
pub use crate::fetch::{BatchSource, CursorFetcher, StreamState};
pub use crate::enrich::{merge_live, EnrichTotals, Enricher};
pub use crate::writer::{write_stream, ChunkedWriter, FlushReport, WriterOptions, WriterStats};

// Storage.
pub use crate::store::{sanitize_key, ArchiveStore, KeyRegistry, PartitionKey, PartitionSink, MANIFEST_FILE, PARTITION_EXT};
pub use crate::flat::{append_records, read_flat_file, write_records};
pub use crate::dump::{count_subreddits, DumpReader};
pub use crate::rollup::{load_rollup, num_comments, subreddit_rollup, write_rollup, SubredditRollup, ROLLUP_FILE};

pub use crate::pipeline::{ingest_dump, load_years, year_file, Harvester};

// Analysis.
pub use crate::stats::{mean, sample_std, summarize, Summary};
pub use crate::fit::{erfc, fit_compare, ln_upper_gamma, Distribution, Fit, FitOptions, FitReport};

// Process setup and progress helpers for the binary.
pub use crate::util::init_tracing_once;
pub use crate::progress::{make_count_progress, make_running_count, set_global_multiprogress, Milestones};
pub use crate::mem::{available_memory_fraction, is_low_memory};
