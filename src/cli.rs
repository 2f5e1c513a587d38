use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "gletscher",
    version,
    about = "Incremental, encrypted, deduplicating backup to Amazon Glacier."
)]
pub struct Cli {
    /// Directory holding backup.config, the index, catalogs and scratch space.
    #[arg(long, global = true, default_value = ".gletscher")]
    pub config_dir: PathBuf,

    /// Increase log verbosity (stderr only; the log file always gets debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new, empty backup configuration interactively.
    Init,

    /// Scan one or more directories, upload new data, and record a
    /// catalog for this run.
    Backup {
        /// Name for this backup's catalog snapshot (e.g. "home", "default").
        #[arg(long)]
        catalog: String,

        /// Directories to back up.
        #[arg(required = true)]
        directories: Vec<PathBuf>,

        /// Glob-style path fragments to skip while scanning.
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },

    /// Upload the current index and catalogs as a single kv-pack archive.
    UploadCatalog,

    /// Verify that the catalog, index and remote vault inventory agree.
    Reconcile {
        /// Seconds between inventory-retrieval job polls.
        #[arg(long, default_value_t = 900)]
        poll_interval_secs: u64,

        /// Maximum seconds to wait for a usable inventory before giving up.
        #[arg(long, default_value_t = 6 * 3600)]
        max_wait_secs: u64,
    },

    /// Restore files matching one or more path patterns from a prior
    /// backup run.
    Restore {
        /// Name of the catalog snapshot to restore from (the most recent
        /// run recorded under this name is used).
        #[arg(long)]
        catalog: String,

        /// Regular expressions matched against catalog paths.
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Directory to write restored files into.
        #[arg(long)]
        output_dir: PathBuf,
    },

    /// List pending and completed Glacier jobs for this vault.
    GlacierListJobs,

    /// Download the output of a completed Glacier job to a file.
    GlacierRetrieveJobOutput {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        output_file: PathBuf,
    },

    /// Print catalog entries whose path matches any of the given patterns,
    /// without restoring them.
    SearchCatalog {
        /// Name of the catalog snapshot to search (the most recent run
        /// recorded under this name is used).
        #[arg(long)]
        catalog: String,

        #[arg(required = true)]
        patterns: Vec<String>,
    },
}
