//! 🚀 s3x-cli: the front door. Parses flags, loads config, wires Ctrl-C to the
//! cancellation token, and hands the real work to the `s3x` library.
//!
//! 🎬 *[narrator voice]* "It all started with a 40 GiB object and a single GET..."

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use s3x::transfers;
use s3x::{Segment, Transport, TransportBackend, TransferOptions};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🪣 Parallel ranged downloads and multipart uploads for S3-compatible stores.
#[derive(Debug, Parser)]
#[command(name = "s3x", version, about)]
struct Cli {
    /// TOML config file, merged over `S3X_*` environment variables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print summaries as JSON and hide the progress bar.
    #[arg(long, global = true)]
    json: bool,

    /// Override `transfer.chunk_size` (bytes).
    #[arg(long, global = true)]
    chunk_size: Option<u64>,

    /// Override `transfer.parallelism`.
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 📥 Download one object.
    Get {
        key: String,
        /// Destination file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Inflate gzip/deflate objects on the way down.
        #[arg(long)]
        decompress: bool,
    },
    /// 📤 Upload a local file as one object.
    Put {
        file: PathBuf,
        key: String,
        /// Gzip the bytes before they leave.
        #[arg(long)]
        gzip: bool,
    },
    /// 📚 Concatenate this segment's share of every object under a prefix.
    CatPrefix {
        prefix: String,
        #[arg(long, default_value_t = 0)]
        segment_id: usize,
        #[arg(long, default_value_t = 1)]
        segment_count: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        decompress: bool,
    },
    /// 🔍 Existence, size, and compression of one key.
    Stat { key: String },
    /// 📋 Non-empty objects under a prefix.
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 logs go to stderr; stdout is for object bytes and summaries
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("dispatch failure")
                || cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: the object store isn't reachable. Check `transport.S3.endpoint` \
                 and that the store (MinIO, S3, whatever you're pointing at) is actually up. ☕"
            );
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config_file = match cli.config.as_deref() {
        Some(path) => Some(validated_config_path(path)?),
        None => None,
    };
    let mut app_config = s3x::load_config(config_file)
        .context("💀 In s3x-cli we couldn't load the configuration. Check the file and the S3X_* variables")?;
    if let Some(chunk_size) = cli.chunk_size {
        app_config.transfer.chunk_size = chunk_size;
    }
    if let Some(parallelism) = cli.parallelism {
        app_config.transfer.parallelism = parallelism;
    }
    if matches!(app_config.transport, s3x::TransportConfig::InMemory) {
        warn!("⚠️ no transport configured; using an empty in-memory store that forgets everything on exit");
    }

    let transport: Arc<dyn Transport> = Arc::new(
        TransportBackend::from_config(&app_config.transport)
            .await
            .context("💀 could not build the transport")?,
    );
    let mut options = TransferOptions::new(app_config.transfer);
    options.show_progress = !cli.json;

    // 🛑 Ctrl-C flips the token; readers and writers unwind on their own
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 interrupt received; cancelling the transfer");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Get {
            key,
            output,
            decompress,
        } => {
            options.codec = decompress;
            let mut out = open_output(output.as_deref()).await?;
            let summary = transfers::download(transport, &key, &mut out, &options, cancel).await?;
            report(&summary, cli.json)?;
        }
        Command::Put { file, key, gzip } => {
            options.codec = gzip;
            let mut source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("💀 could not open '{}' for upload", file.display()))?;
            let size_hint = source.metadata().await.map(|meta| meta.len()).unwrap_or(0);
            let summary =
                transfers::upload(transport, &mut source, size_hint, &key, &options, cancel).await?;
            report(&summary, cli.json)?;
        }
        Command::CatPrefix {
            prefix,
            segment_id,
            segment_count,
            output,
            decompress,
        } => {
            options.codec = decompress;
            let segment = Segment {
                id: segment_id,
                count: segment_count,
            };
            let mut out = open_output(output.as_deref()).await?;
            let summary =
                transfers::download_prefix(transport, &prefix, segment, &mut out, &options, cancel)
                    .await?;
            report(&summary, cli.json)?;
        }
        Command::Stat { key } => {
            let found = transfers::stat(transport, &key).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&found)?);
            } else if let (Some(size), Some(compression)) = (found.size, found.compression) {
                println!("{}\t{size}\t{compression}", found.key);
            } else {
                println!("{}\tmissing", found.key);
            }
        }
        Command::Ls { prefix } => {
            let listing = transfers::list(transport, &prefix).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&listing)?);
            } else {
                for summary in &listing {
                    println!("{}\t{}", summary.size, summary.key);
                }
            }
            info!("📋 {} objects under '{prefix}'", listing.len());
        }
    }
    Ok(())
}

/// 🔒 Figment quietly skips a missing TOML file, so a typo'd path would fall back to
/// env-only config without a word. We'd rather hear about it.
fn validated_config_path(path: &Path) -> Result<&Path> {
    let exists = path.try_exists().with_context(|| {
        format!(
            "💀 couldn't check whether the configuration file exists. If it's a relative path, \
             try an absolute one. Was checking here: '{}'",
            path.display()
        )
    })?;
    if !exists {
        anyhow::bail!("💀 configuration file '{}' does not exist", path.display());
    }
    Ok(path)
}

async fn open_output(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("💀 could not create '{}'", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// 🧾 Summaries go to stderr so they never mix with object bytes on stdout.
fn report(summary: &transfers::TransferSummary, json: bool) -> Result<()> {
    if json {
        eprintln!("{}", summary.to_json()?);
    } else {
        eprintln!("{}", summary.to_table());
    }
    Ok(())
}
