//! Command-line arguments and runtime configuration.

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::transfer::ProgressRecord;

/// Default number of concurrent range workers.
pub const DEFAULT_PARALLELISM: usize = 8;

/// Default upper bound on a single transferred range (4 MiB, the page blob write limit).
pub const DEFAULT_MAX_RANGE_SIZE: u64 = 4 * 1024 * 1024;

/// Default longest differencing chain accepted by the image builder.
pub const DEFAULT_MAX_PARENT_DEPTH: usize = 32;

/// Default progress sampling interval.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How decoded checksums are compared against recomputed ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ChecksumPolicy {
    /// Do not compare checksums.
    Ignore,
    /// Log mismatches and keep going.
    #[default]
    Warn,
    /// Fail with `ChecksumMismatch`.
    Strict,
}

/// Options for opening an image and its parent chain.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub checksum_policy: ChecksumPolicy,
    /// Directory joined with relative parent locators. When unset the absolute
    /// locator (or stored parent name) is used.
    pub parent_dir: Option<PathBuf>,
    pub max_parent_depth: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            checksum_policy: ChecksumPolicy::default(),
            parent_dir: None,
            max_parent_depth: DEFAULT_MAX_PARENT_DEPTH,
        }
    }
}

impl OpenOptions {
    pub fn with_parent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.parent_dir = Some(dir.into());
        self
    }

    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }
}

/// Callback invoked with periodic progress samples.
pub type ProgressCallback = Arc<dyn Fn(&ProgressRecord) + Send + Sync>;

/// Options for a range transfer.
#[derive(Clone)]
pub struct TransferOptions {
    /// Number of concurrent workers.
    pub parallelism: usize,
    /// Ranges longer than this are split before dispatch.
    pub max_range_size: u64,
    pub progress_interval: Duration,
    pub on_progress: Option<ProgressCallback>,
    /// Checked before each range is started.
    pub cancel: CancellationToken,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            max_range_size: DEFAULT_MAX_RANGE_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            on_progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("parallelism", &self.parallelism)
            .field("max_range_size", &self.max_range_size)
            .field("progress_interval", &self.progress_interval)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TransferOptions {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(&ProgressRecord) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "vhdsync-rs")]
#[command(about = "Inspect VHD images and transfer their data ranges")]
#[command(version)]
pub struct Args {
    /// Enable debug logging.
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,

    /// Enable silent mode (errors only).
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    /// Checksum validation policy.
    #[arg(long, value_enum, default_value_t = ChecksumPolicy::Warn, global = true)]
    pub checksums: ChecksumPolicy,

    /// Longest differencing chain to follow.
    #[arg(long, default_value_t = DEFAULT_MAX_PARENT_DEPTH, global = true)]
    pub max_parent_depth: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print footer, header and parent chain of an image.
    Inspect {
        path: PathBuf,
        /// Directory used to resolve relative parent locators.
        #[arg(long)]
        parent_dir: Option<PathBuf>,
    },
    /// List the data-bearing (or empty) ranges of an image.
    Ranges {
        path: PathBuf,
        #[arg(long)]
        parent_dir: Option<PathBuf>,
        /// List empty ranges instead of data ranges.
        #[arg(long)]
        empty: bool,
        /// Include ranges contributed by parent images.
        #[arg(long)]
        logical: bool,
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// Download a page blob into a local file.
    Download {
        /// Blob URL.
        #[arg(long)]
        url: String,
        /// Storage account name for SharedKey signing.
        #[arg(long, requires = "key")]
        account: Option<String>,
        /// Storage account key (base64).
        #[arg(long, requires = "account")]
        key: Option<String>,
        /// SAS token appended to every request.
        #[arg(long, conflicts_with = "key")]
        sas: Option<String>,
        /// Destination file.
        #[arg(long, short = 'o')]
        out: PathBuf,
        #[arg(long, short = 'p', default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
        /// Verify Content-MD5 of each range.
        #[arg(long)]
        verify_md5: bool,
    },
    /// Write the logical contents of a local image into a raw file.
    Export {
        path: PathBuf,
        out: PathBuf,
        #[arg(long)]
        parent_dir: Option<PathBuf>,
        #[arg(long, short = 'p', default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
    },
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Config {
    pub checksum_policy: ChecksumPolicy,
    pub max_parent_depth: usize,
    pub max_range_size: u64,
    pub progress_interval: Duration,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checksum_policy: ChecksumPolicy::default(),
            max_parent_depth: DEFAULT_MAX_PARENT_DEPTH,
            max_range_size: DEFAULT_MAX_RANGE_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            debug: false,
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            checksum_policy: args.checksums,
            max_parent_depth: args.max_parent_depth,
            debug: args.debug,
            ..Config::default()
        }
    }
}

impl Config {
    /// Returns image open options rooted at `parent_dir`.
    pub fn open_options(&self, parent_dir: Option<PathBuf>) -> OpenOptions {
        OpenOptions {
            checksum_policy: self.checksum_policy,
            parent_dir,
            max_parent_depth: self.max_parent_depth,
        }
    }

    /// Returns transfer options with the given worker count.
    pub fn transfer_options(&self, parallelism: usize) -> TransferOptions {
        TransferOptions {
            parallelism,
            max_range_size: self.max_range_size,
            progress_interval: self.progress_interval,
            ..TransferOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download_args() {
        let args = Args::try_parse_from([
            "vhdsync-rs",
            "--checksums",
            "strict",
            "download",
            "--url",
            "http://127.0.0.1:10000/acct/c/disk.vhd",
            "--sas",
            "sv=2021&sig=x",
            "-o",
            "disk.vhd",
            "-p",
            "4",
        ])
        .unwrap();

        let config = Config::from(&args);
        assert_eq!(config.checksum_policy, ChecksumPolicy::Strict);
        match args.command {
            Command::Download {
                parallelism, sas, ..
            } => {
                assert_eq!(parallelism, 4);
                assert_eq!(sas.as_deref(), Some("sv=2021&sig=x"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_key_requires_account() {
        let result = Args::try_parse_from([
            "vhdsync-rs",
            "download",
            "--url",
            "http://localhost/a/b/c",
            "--key",
            "abc",
            "-o",
            "x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_transfer_options_debug_hides_callback() {
        let options = TransferOptions::default().with_progress(|_| {});
        let debug = format!("{options:?}");
        assert!(debug.contains("on_progress: true"));
    }
}
