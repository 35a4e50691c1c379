//! stowage command-line entry point.
//!
//! Every command runs against a local-directory object store and a
//! persistent record store, so interrupted transfers can be resumed by
//! a later invocation with `stowage recover`.

mod config;
mod progress;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use stowage_fs_store::FsObjectStore;
use stowage_transfer::{
    CannedAcl, ObjectMetadata, TransferFilter, TransferId, TransferManager, TransferObserver,
    TransferOptions, TransferState, UploadSource,
};
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{ProgressPrinter, format_bytes};

/// Resumable uploads and downloads for object storage
#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Object store directory (overrides the configuration)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Bucket (overrides `default_bucket`)
    #[arg(short, long)]
    bucket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file, or standard input when FILE is `-`
    Upload {
        key: String,
        file: String,

        /// Canned ACL, e.g. `private` or `public-read`
        #[arg(long)]
        acl: Option<CannedAcl>,

        /// Content type stored with the object
        #[arg(long)]
        content_type: Option<String>,

        /// User metadata entry, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },

    /// Download an object into a file
    Download { key: String, file: PathBuf },

    /// List recorded transfers
    List {
        /// Only transfers in this state, e.g. `in_progress`
        #[arg(long)]
        state: Option<TransferState>,
    },

    /// Park a recorded transfer so `recover` leaves it alone
    Pause { id: TransferId },

    /// Re-queue a paused or failed transfer and wait for it
    Resume { id: TransferId },

    /// Cancel a transfer
    Cancel { id: TransferId },

    /// Cancel a transfer if needed and forget it
    Remove { id: TransferId },

    /// Resume transfers interrupted by an earlier run
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref())?;
    let mut transfer_config = config.transfer_config();
    if let Some(bucket) = cli.bucket {
        transfer_config.default_bucket = Some(bucket);
    }
    let root = cli.root.unwrap_or_else(|| config.object_root());
    tracing::debug!(root = %root.display(), "using object store");

    let manager = TransferManager::builder()
        .config(transfer_config)
        .storage(Arc::new(FsObjectStore::new(root)))
        .build()?;

    let result = run(&manager, cli.command).await;
    manager.shutdown().await;
    result
}

async fn run(manager: &TransferManager, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Upload {
            key,
            file,
            acl,
            content_type,
            meta,
        } => {
            let mut metadata = ObjectMetadata::default();
            if let Some(content_type) = content_type {
                metadata = metadata.with_content_type(content_type);
            }
            for (k, v) in meta {
                metadata = metadata.with_user(k, v);
            }
            let mut options = TransferOptions::new()
                .object_metadata(metadata)
                .transfer_listener(Arc::new(ProgressPrinter::new(format!("upload {key}"))));
            if let Some(acl) = acl {
                options = options.canned_acl(acl);
            }

            let source = if file == "-" {
                UploadSource::Stream {
                    reader: Box::new(tokio::io::stdin()),
                    size_hint: None,
                }
            } else {
                UploadSource::File(PathBuf::from(file))
            };
            let observer = manager.upload(&key, source, options).await?;
            wait(manager, &observer).await
        }
        Commands::Download { key, file } => {
            let options = TransferOptions::new()
                .transfer_listener(Arc::new(ProgressPrinter::new(format!("download {key}"))));
            let observer = manager.download(&key, &file, options)?;
            wait(manager, &observer).await
        }
        Commands::List { state } => list(manager, state),
        Commands::Resume { id } => {
            let observer = manager.get_transfer(id)?;
            observer.set_transfer_listener(Arc::new(ProgressPrinter::new(format!(
                "resume {}",
                observer.key()
            ))))?;
            manager.resume(id)?;
            wait(manager, &observer).await
        }
        Commands::Pause { id } => {
            manager.pause(id)?;
            println!("transfer {id} paused");
            Ok(())
        }
        Commands::Cancel { id } => {
            manager.cancel(id)?;
            println!("transfer {id} canceled");
            Ok(())
        }
        Commands::Remove { id } => {
            let removed = manager.remove(id)?;
            println!(
                "transfer {id} removed ({} {}/{})",
                removed.state, removed.bucket, removed.key
            );
            Ok(())
        }
        Commands::Recover => recover(manager).await,
    }
}

/// Waits for `observer` to settle; Ctrl-C leaves it resumable.
async fn wait(manager: &TransferManager, observer: &TransferObserver) -> anyhow::Result<()> {
    let id = observer.id();
    let state = tokio::select! {
        state = observer.wait_until_settled() => state,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            bail!("interrupted; run `stowage recover` to continue transfer {id}");
        }
    };
    manager.flush_notifications().await;
    eprintln!();

    match state {
        TransferState::Completed => {
            println!(
                "{} {}/{} ({})",
                id,
                observer.bucket(),
                observer.key(),
                format_bytes(observer.bytes_transferred())
            );
            Ok(())
        }
        TransferState::Failed => {
            let record = observer.refresh()?;
            bail!(
                "transfer {id} failed: {}",
                record.error.unwrap_or_else(|| "unknown error".into())
            )
        }
        other => bail!("transfer {id} ended {other}"),
    }
}

async fn recover(manager: &TransferManager) -> anyhow::Result<()> {
    let queued = manager.recover()?;
    println!("{queued} transfer(s) queued");

    let mut failures = 0;
    for observer in manager.get_transfers(&TransferFilter::default())? {
        let state = observer.state();
        if !state.is_queued() && !state.is_running() {
            continue;
        }
        observer.set_transfer_listener(Arc::new(ProgressPrinter::new(format!(
            "recover {}",
            observer.key()
        ))))?;
        if let Err(e) = wait(manager, &observer).await {
            eprintln!("{e:#}");
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} transfer(s) did not complete");
    }
    Ok(())
}

fn list(manager: &TransferManager, state: Option<TransferState>) -> anyhow::Result<()> {
    let filter = TransferFilter {
        state,
        direction: None,
    };
    let transfers = manager.get_transfers(&filter)?;
    if transfers.is_empty() {
        println!("no transfers");
        return Ok(());
    }

    println!(
        "{:>5}  {:<8}  {:<26}  {:>21}  OBJECT",
        "ID", "KIND", "STATE", "PROGRESS"
    );
    for observer in transfers {
        let record = observer.refresh()?;
        let total = record
            .total_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "?".into());
        println!(
            "{:>5}  {:<8}  {:<26}  {:>21}  {}/{}",
            record.id,
            format!("{:?}", record.direction).to_lowercase(),
            record.state,
            format!("{} / {total}", format_bytes(record.bytes_transferred)),
            record.bucket,
            record.key
        );
    }
    Ok(())
}

/// Parses `KEY=VALUE`.
fn parse_meta(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty metadata key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
