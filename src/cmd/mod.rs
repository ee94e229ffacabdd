//! Command-line entry points.

use clap::Args;

pub mod backends;
pub mod ocr;
pub mod schema;

/// Common options for subcommands that process batches of documents.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Max number of pages to process at a time. Defaults to `max_workers`
    /// from the config file.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,

    /// What portion of documents should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,
}
