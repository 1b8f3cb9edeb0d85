//! 🚚 transfers.rs: whole-object jobs built on the reader and the writer.
//!
//! 🎬 "One object in, one stream out." Each function here is one CLI verb:
//! `download` streams an object (optionally decompressed) into any async sink,
//! `upload` streams any async source (optionally gzipped) into a multipart upload,
//! `download_prefix` concatenates this segment's share of a listing, and `stat`
//! and `list` answer the small questions.
//!
//! 🧠 Knowledge graph:
//! - The reader is always closed and the writer is always closed or aborted,
//!   whichever way the job ends. Nothing leaks a running worker.
//! - Errors leave here as `anyhow::Error` with context; the typed
//!   `TransferError` is still in the chain for whoever wants to downcast.
//! - Progress is hidden unless asked for, so tests and pipes stay quiet.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use comfy_table::{Cell, Table, presets::NOTHING};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_config::TransferConfig;
use crate::codec::{CompressionType, Compressor, Decompressor};
use crate::progress::{TransferProgress, format_bytes, format_duration, mib_per_sec};
use crate::reader::{ParallelReader, ReaderParams};
use crate::transport::{ObjectSummary, Transport};
use crate::writer::{BufferedMultipartWriter, WriterParams};

// -- 📏 how much we hand the reader (or pull from the source) per call
const IO_BLOCK_SIZE: u64 = 1024 * 1024;

/// 🎛️ Knobs shared by every job.
#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    pub settings: TransferConfig,
    /// Downloads: inflate gzip/deflate objects. Uploads: gzip before sending.
    pub codec: bool,
    pub show_progress: bool,
}

impl TransferOptions {
    pub fn new(settings: TransferConfig) -> Self {
        Self {
            settings,
            codec: false,
            show_progress: false,
        }
    }

    fn io_block_size(&self) -> usize {
        self.settings.chunk_size.clamp(1, IO_BLOCK_SIZE) as usize
    }
}

/// 🍰 Which share of a listing this process owns: every key whose position in
/// the listing satisfies `index % count == id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub id: usize,
    pub count: usize,
}

impl Segment {
    /// The whole pie.
    pub fn whole() -> Self {
        Self { id: 0, count: 1 }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.count == 0 {
            bail!("💀 segment count must be greater than zero");
        }
        if self.id >= self.count {
            bail!(
                "💀 segment id {} is out of range for {} segments (ids start at 0)",
                self.id,
                self.count
            );
        }
        Ok(())
    }

    fn owns(&self, index: usize) -> bool {
        index % self.count == self.id
    }
}

/// 🧾 What a finished job reports, for humans (`to_table`) or machines (`to_json`).
#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub operation: String,
    pub key: String,
    pub objects: usize,
    /// Bytes that crossed the wire.
    pub bytes_transferred: u64,
    /// Bytes on the local side, after (de)compression.
    pub bytes_local: u64,
    pub compression: CompressionType,
    pub elapsed_ms: u64,
    pub mib_per_sec: f64,
}

impl TransferSummary {
    fn new(
        operation: &str,
        key: &str,
        objects: usize,
        bytes_transferred: u64,
        bytes_local: u64,
        compression: CompressionType,
        elapsed: Duration,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            key: key.to_string(),
            objects,
            bytes_transferred,
            bytes_local,
            compression,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            mib_per_sec: mib_per_sec(bytes_transferred, elapsed),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("💀 could not serialize the transfer summary")
    }

    pub fn to_table(&self) -> String {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        let rows = [
            ("operation", self.operation.clone()),
            ("key", self.key.clone()),
            ("objects", self.objects.to_string()),
            ("transferred", format_bytes(self.bytes_transferred)),
            ("local", format_bytes(self.bytes_local)),
            ("compression", self.compression.to_string()),
            (
                "elapsed",
                format_duration(Duration::from_millis(self.elapsed_ms)),
            ),
            ("throughput", format!("{:.2} MiB/s", self.mib_per_sec)),
        ];
        for (name, value) in rows {
            table.add_row(vec![Cell::new(name), Cell::new(value)]);
        }
        table.to_string()
    }
}

/// 🔍 What `stat` finds out about one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectStat {
    pub key: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub compression: Option<CompressionType>,
}

/// 📥 Streams `key` into `out`, inflating it on the way if `options.codec` is set
/// and the first bytes say it's compressed.
pub async fn download<W>(
    transport: Arc<dyn Transport>,
    key: &str,
    out: &mut W,
    options: &TransferOptions,
    cancel: CancellationToken,
) -> anyhow::Result<TransferSummary>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    options.settings.validate()?;
    let object_size = transport
        .object_size(key)
        .await
        .with_context(|| format!("💀 could not size up '{key}' before downloading it"))?;

    let mut progress = TransferProgress::new(format!("get {key}"), object_size, options.show_progress);
    let mut reader = ParallelReader::new(Arc::clone(&transport), cancel);
    let outcome = copy_object(&transport, &mut reader, key, object_size, options, out, &mut progress).await;
    reader.close().await;

    match outcome {
        Ok((bytes_local, compression)) => {
            out.flush().await.context("💀 could not flush the download destination")?;
            progress.finish();
            info!("📥 '{key}' downloaded: {object_size} bytes, {bytes_local} bytes written locally");
            Ok(TransferSummary::new(
                "get",
                key,
                1,
                progress.total_bytes(),
                bytes_local,
                compression,
                progress.elapsed(),
            ))
        }
        Err(error) => {
            progress.abandon();
            Err(error)
        }
    }
}

/// 📚 Lists `prefix`, keeps this segment's share, and streams those objects into
/// `out` back to back, in listing order. One reader is reopened per object.
pub async fn download_prefix<W>(
    transport: Arc<dyn Transport>,
    prefix: &str,
    segment: Segment,
    out: &mut W,
    options: &TransferOptions,
    cancel: CancellationToken,
) -> anyhow::Result<TransferSummary>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    segment.validate()?;
    options.settings.validate()?;
    let listing = transport
        .list_objects(prefix)
        .await
        .with_context(|| format!("💀 could not list objects under '{prefix}'"))?;
    let mine: Vec<ObjectSummary> = listing
        .into_iter()
        .enumerate()
        .filter(|(index, _)| segment.owns(*index))
        .map(|(_, summary)| summary)
        .collect();
    let total_size: u64 = mine.iter().map(|summary| summary.size).sum();
    info!(
        "📚 segment {}/{} of '{prefix}': {} objects, {total_size} bytes",
        segment.id,
        segment.count,
        mine.len()
    );

    let mut progress = TransferProgress::new(format!("cat {prefix}"), total_size, options.show_progress);
    let mut reader = ParallelReader::new(Arc::clone(&transport), cancel);
    let mut bytes_local = 0u64;
    let mut compression = CompressionType::Plain;
    for summary in &mine {
        let outcome = copy_object(
            &transport,
            &mut reader,
            &summary.key,
            summary.size,
            options,
            out,
            &mut progress,
        )
        .await;
        reader.close().await;
        match outcome {
            Ok((written, kind)) => {
                bytes_local += written;
                if kind != CompressionType::Plain {
                    compression = kind;
                }
            }
            Err(error) => {
                progress.abandon();
                return Err(error.context(format!("💀 prefix download stopped at '{}'", summary.key)));
            }
        }
    }
    out.flush().await.context("💀 could not flush the download destination")?;
    progress.finish();

    Ok(TransferSummary::new(
        "cat-prefix",
        prefix,
        mine.len(),
        progress.total_bytes(),
        bytes_local,
        compression,
        progress.elapsed(),
    ))
}

/// 📤 Streams `input` into a multipart upload of `key`, gzipping it on the way when
/// `options.codec` is set. `size_hint` only feeds the progress bar (0 = unknown).
///
/// If reading `input` fails halfway, the upload is aborted rather than completed,
/// so a half-read file never shows up as an object.
pub async fn upload<R>(
    transport: Arc<dyn Transport>,
    input: &mut R,
    size_hint: u64,
    key: &str,
    options: &TransferOptions,
    cancel: CancellationToken,
) -> anyhow::Result<TransferSummary>
where
    R: AsyncRead + Unpin + ?Sized,
{
    options.settings.validate()?;
    let chunk_size = usize::try_from(options.settings.chunk_size)
        .context("💀 chunk_size does not fit in memory on this platform")?;

    let mut progress = TransferProgress::new(format!("put {key}"), size_hint, options.show_progress);
    let mut writer = BufferedMultipartWriter::new(transport, cancel);
    writer
        .open(WriterParams {
            key: key.to_string(),
            chunk_size,
            max_workers: options.settings.parallelism,
        })
        .await
        .with_context(|| format!("💀 could not start an upload for '{key}'"))?;

    let pumped = pump_upload(&mut writer, input, options, &mut progress).await;
    let bytes_local = match pumped {
        Ok(bytes_local) => bytes_local,
        Err(error) => {
            warn!("⚠️ upload of '{key}' failed; aborting it");
            writer.abort().await;
            progress.abandon();
            return Err(error);
        }
    };
    let bytes_sent = writer.bytes_written();
    writer
        .close()
        .await
        .with_context(|| format!("💀 could not finish the upload of '{key}'"))?;
    progress.finish();

    Ok(TransferSummary::new(
        "put",
        key,
        1,
        bytes_sent,
        bytes_local,
        if options.codec {
            CompressionType::Gzip
        } else {
            CompressionType::Plain
        },
        progress.elapsed(),
    ))
}

/// 🔍 Does `key` exist, how big is it, and is it compressed?
pub async fn stat(transport: Arc<dyn Transport>, key: &str) -> anyhow::Result<ObjectStat> {
    let exists = transport
        .key_exists(key)
        .await
        .with_context(|| format!("💀 could not check whether '{key}' exists"))?;
    if !exists {
        return Ok(ObjectStat {
            key: key.to_string(),
            exists,
            size: None,
            compression: None,
        });
    }
    let size = transport.object_size(key).await?;
    let compression = transport.check_compression_type(key).await?;
    Ok(ObjectStat {
        key: key.to_string(),
        exists,
        size: Some(size),
        compression: Some(compression),
    })
}

/// 📋 Every non-empty object under `prefix`, in the store's order.
pub async fn list(transport: Arc<dyn Transport>, prefix: &str) -> anyhow::Result<Vec<ObjectSummary>> {
    transport
        .list_objects(prefix)
        .await
        .with_context(|| format!("💀 could not list objects under '{prefix}'"))
}

/// Reads one object through an already-constructed reader into `out`.
/// The caller closes the reader. Returns (local bytes written, compression seen).
async fn copy_object<W>(
    transport: &Arc<dyn Transport>,
    reader: &mut ParallelReader,
    key: &str,
    object_size: u64,
    options: &TransferOptions,
    out: &mut W,
    progress: &mut TransferProgress,
) -> anyhow::Result<(u64, CompressionType)>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let compression = if options.codec {
        transport
            .check_compression_type(key)
            .await
            .with_context(|| format!("💀 could not sniff the first bytes of '{key}'"))?
    } else {
        CompressionType::Plain
    };

    reader.open(ReaderParams {
        key: key.to_string(),
        object_size,
        chunk_size: options.settings.chunk_size,
        num_workers: options.settings.parallelism,
    })?;

    let mut decoder = Decompressor::new(compression, Vec::new());
    let mut buf = vec![0u8; options.io_block_size()];
    let mut bytes_local = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .await
            .with_context(|| format!("💀 reading '{key}' failed"))?;
        if read == 0 {
            break;
        }
        progress.update(read as u64);
        decoder
            .write_all(&buf[..read])
            .with_context(|| format!("💀 '{key}' does not decode as {compression}"))?;
        let decoded = decoder.get_mut();
        if !decoded.is_empty() {
            out.write_all(decoded)
                .await
                .context("💀 could not write to the download destination")?;
            bytes_local += decoded.len() as u64;
            decoded.clear();
        }
    }

    let tail = decoder
        .finish()
        .with_context(|| format!("💀 '{key}' ended in the middle of a {compression} stream"))?;
    out.write_all(&tail)
        .await
        .context("💀 could not write to the download destination")?;
    bytes_local += tail.len() as u64;
    Ok((bytes_local, compression))
}

/// Moves everything from `input` into the open writer. Returns bytes read locally.
async fn pump_upload<R>(
    writer: &mut BufferedMultipartWriter,
    input: &mut R,
    options: &TransferOptions,
    progress: &mut TransferProgress,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut encoder = Compressor::new(options.codec, Vec::new());
    let mut buf = vec![0u8; options.io_block_size()];
    let mut bytes_local = 0u64;
    loop {
        let read = input
            .read(&mut buf)
            .await
            .context("💀 could not read the upload source")?;
        if read == 0 {
            break;
        }
        bytes_local += read as u64;
        progress.update(read as u64);
        encoder
            .write_all(&buf[..read])
            .context("💀 gzip refused our bytes")?;
        let encoded = encoder.get_mut();
        if !encoded.is_empty() {
            writer.write(encoded).await?;
            encoded.clear();
        }
    }
    let tail = encoder.finish().context("💀 could not finish the gzip stream")?;
    writer.write(&tail).await?;
    Ok(bytes_local)
}
