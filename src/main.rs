//! vhdsync-rs: inspect VHD images and transfer their data ranges.

use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vhdsync_rs::config::ProgressCallback;
use vhdsync_rs::{
    download, open_image_async, plan_empty_ranges, plan_logical_ranges, plan_ranges, Args,
    BlobHandle, Command, Config, Credential, ImageSource, ImageSummary, ProgressRecord,
    TransferOptions,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from(&args);
    let show_progress = !args.silent;

    match args.command {
        Command::Inspect { path, parent_dir } => {
            let image = open_image_async(&path, &config.open_options(parent_dir)).await?;
            println!("{}", serde_json::to_string_pretty(&ImageSummary::from(&image))?);
        }
        Command::Ranges {
            path,
            parent_dir,
            empty,
            logical,
            json,
        } => {
            let image = open_image_async(&path, &config.open_options(parent_dir)).await?;
            let ranges = match (empty, logical) {
                (true, _) => plan_empty_ranges(&image),
                (false, true) => plan_logical_ranges(&image),
                (false, false) => plan_ranges(&image),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&ranges)?);
            } else {
                for range in &ranges {
                    println!("{}\t{}\t{}", range.start_index, range.end_index(), range.length);
                }
            }
        }
        Command::Download {
            url,
            account,
            key,
            sas,
            out,
            parallelism,
            verify_md5,
        } => {
            let credential = match (account, key, sas) {
                (Some(account), Some(key), _) => Credential::SharedKey { account, key },
                (_, _, Some(sas)) => Credential::Sas(sas),
                _ => Credential::Anonymous,
            };
            let blob = BlobHandle::connect(&url, credential)
                .await?
                .with_md5_verification(verify_md5);
            let options = with_reporting(config.transfer_options(parallelism), show_progress);
            run_transfer(Arc::new(blob), &out, &options).await?;
        }
        Command::Export {
            path,
            out,
            parent_dir,
            parallelism,
        } => {
            let image = open_image_async(&path, &config.open_options(parent_dir)).await?;
            let options = with_reporting(config.transfer_options(parallelism), show_progress);
            run_transfer(Arc::new(ImageSource::new(image)), &out, &options).await?;
        }
    }

    Ok(())
}

fn with_reporting(options: TransferOptions, enabled: bool) -> TransferOptions {
    if !enabled {
        return options;
    }
    let report: ProgressCallback = Arc::new(|record: &ProgressRecord| {
        info!(
            "{:>6.2}% {}/{} bytes, {:.1} MiB/s{}",
            record.percent,
            record.processed,
            record.total,
            record.instant_rate / (1024.0 * 1024.0),
            record
                .eta
                .map(|eta| format!(", eta {}s", eta.as_secs()))
                .unwrap_or_default()
        );
    });
    TransferOptions {
        on_progress: Some(report),
        ..options
    }
}

async fn run_transfer(
    source: Arc<dyn vhdsync_rs::RangeSource>,
    out: &Path,
    options: &TransferOptions,
) -> Result<(), BoxError> {
    // Ctrl+C stops dispatching new ranges; in-flight ranges finish.
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match download(source, out, options).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(e) => {
            for range in e.retry_ranges() {
                eprintln!("not transferred: {range}");
            }
            Err(e.into())
        }
    }
}
