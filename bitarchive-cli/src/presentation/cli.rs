use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "bitarchive node CLI", long_about = None)]
pub struct Cli {
    /// Node settings (JSON). Without it, `--dir` must name the storage roots.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,
    /// Storage root; repeat for several. Overrides the roots in `--settings`.
    #[arg(long = "dir", global = true)]
    pub dirs: Vec<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

/// Batch file selection. With none of the flags every file is selected.
#[derive(Args, Default)]
pub struct FilterArgs {
    /// Exact filename
    #[arg(long, conflicts_with_all = ["names", "regex"])]
    pub name: Option<String>,
    /// Exact filenames, comma separated
    #[arg(long, value_delimiter = ',', conflicts_with = "regex")]
    pub names: Vec<String>,
    /// Whole-name regex; repeat to match any of several
    #[arg(long)]
    pub regex: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a container from files (directories are walked)
    Pack {
        out: PathBuf,
        inputs: Vec<PathBuf>,
        /// Compress record payloads with zstd
        #[arg(long)]
        zstd: bool,
    },
    /// List the records of a container file
    Records { file: PathBuf },
    /// Admit a local file into the store
    Upload {
        src: PathBuf,
        /// Stored name; defaults to the source file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Stream one record's payload to stdout or a file
    Get {
        filename: String,
        /// Record offset; -1 only probes whether the file is stored
        #[arg(allow_negative_numbers = true)]
        offset: i64,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the on-disk path of a stored file
    GetFile { filename: String },
    /// List stored files
    List {
        #[command(flatten)]
        filter: FilterArgs,
        /// Also print per-directory usage
        #[arg(long)]
        report: bool,
    },
    /// Run a registered job over the selected files
    Batch {
        job: String,
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "cli")]
        app_id: String,
    },
    /// Move a stored file to the attic after verifying its checksum
    Remove { filename: String, checksum: String },
    /// Rebuild ledger entries from files found on disk
    Reconcile,
    /// Run a job on every node of a replica and merge the results
    ReplicaBatch {
        /// Cluster settings (JSON)
        cluster: PathBuf,
        replica: String,
        job: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
}
