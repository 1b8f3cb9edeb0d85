//! 📝 BufferedMultipartWriter: turns a stream of `write` calls into numbered
//! parts, uploads up to `max_workers` of them at once, and stitches them back
//! together in order on `close`.
//!
//! 🎬 Bytes pile up in a `chunk_size` buffer. Every time it fills, the buffer is
//! handed to a fresh `PartUploader` along with the next part number, and the
//! writer gets a new empty buffer right away. A semaphore keeps the number of
//! uploads in flight at `max_workers`; the next flush waits for a permit.
//!
//! 🧠 Knowledge graph:
//! - Part numbers are assigned on the caller's task, strictly increasing, never reused.
//! - Uploads finish in any order. The ledger is a `BTreeMap`, so completion is
//!   always sent in ascending part order.
//! - Cancellation (polled at every flush and while waiting for a slot) drains
//!   every uploader, aborts the upload exactly once, and forgets the transfer.
//! - Any other failure leaves the writer open so `close` can clean up: it joins
//!   the uploaders, aborts the upload, and hands back the first error.
//! - An upload that never got a single part is aborted, not completed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abort::{FirstError, ensure_not_cancelled, query_abort};
use crate::errors::{TransferError, TransferResult};
use crate::transport::{CompletedPart, Transport};
use crate::workers::{Worker, join_workers};
use crate::writer::part_uploader::{PartLedger, PartUploader};

/// 🔧 Where to write and how.
#[derive(Debug, Clone)]
pub struct WriterParams {
    pub key: String,
    /// Bytes per part. Every part but the last is exactly this size.
    pub chunk_size: usize,
    /// Parts allowed in flight at once.
    pub max_workers: usize,
}

/// Everything that exists only while an upload id is live.
#[derive(Debug)]
struct WriteSession {
    key: Arc<str>,
    upload_id: Arc<str>,
    chunk_size: usize,
    buffer: Vec<u8>,
    next_part_number: u64,
    slots: Arc<Semaphore>,
    parts: PartLedger,
    shared: Arc<FirstError>,
    in_flight: Vec<JoinHandle<TransferResult<()>>>,
    bytes_written: u64,
}

impl WriteSession {
    /// Copies what fits into the part buffer. Returns how much was taken.
    fn buffer_some(&mut self, data: &[u8]) -> usize {
        let room = self.chunk_size - self.buffer.len();
        let taken = room.min(data.len());
        self.buffer.extend_from_slice(&data[..taken]);
        taken
    }

    fn buffer_is_full(&self) -> bool {
        self.buffer.len() >= self.chunk_size
    }

    /// 🚀 Hands the buffered bytes to a new uploader, waiting for a free slot first.
    async fn flush(
        &mut self,
        transport: &Arc<dyn Transport>,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        ensure_not_cancelled(cancel, "multipart upload")?;
        self.shared.check()?;
        self.in_flight.retain(|handle| !handle.is_finished());

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(query_abort("multipart upload")),
            permit = Arc::clone(&self.slots).acquire_owned() => permit.map_err(|_| {
                TransferError::Setup("the upload slot pool was closed".into())
            })?,
        };
        ensure_not_cancelled(cancel, "multipart upload")?;
        self.shared.check()?;

        let part_number = self.next_part_number;
        self.next_part_number += 1;
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        debug!(
            "🚀 scheduling part {part_number} of '{}' ({} bytes)",
            self.key,
            data.len()
        );

        let uploader = PartUploader {
            key: Arc::clone(&self.key),
            upload_id: Arc::clone(&self.upload_id),
            part_number,
            data,
            transport: Arc::clone(transport),
            cancel: cancel.clone(),
            parts: Arc::clone(&self.parts),
            shared: Arc::clone(&self.shared),
            permit,
        };
        self.in_flight.push(uploader.start());
        Ok(())
    }

    async fn drain(&mut self) {
        let workers = std::mem::take(&mut self.in_flight);
        join_workers(workers, "part uploader").await;
    }

    /// ✅ Final flush, join everything, then complete (or abort an empty upload).
    async fn finish(
        &mut self,
        transport: &Arc<dyn Transport>,
        cancel: &CancellationToken,
    ) -> TransferResult<()> {
        let flushed = self.flush(transport, cancel).await;
        self.drain().await;
        flushed?;
        ensure_not_cancelled(cancel, "multipart upload")?;
        self.shared.check()?;

        let parts: Vec<CompletedPart> = self
            .parts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(part_number, etag)| CompletedPart {
                part_number: *part_number,
                etag: etag.clone(),
            })
            .collect();
        let scheduled = self.next_part_number - 1;
        if parts.len() as u64 != scheduled {
            return Err(TransferError::Transport(format!(
                "{} of {scheduled} parts of '{}' reported back",
                parts.len(),
                self.key
            )));
        }

        if parts.is_empty() {
            info!("📭 nothing was written to '{}'; dropping the upload", self.key);
            if let Err(error) = transport.abort_upload(&self.key, &self.upload_id).await {
                warn!("⚠️ could not abort empty upload {}: {error}", self.upload_id);
            }
            return Ok(());
        }

        transport
            .complete_multipart(&self.key, &self.upload_id, &parts)
            .await?;
        info!(
            "✅ '{}' written: {} bytes in {} parts",
            self.key,
            self.bytes_written,
            parts.len()
        );
        Ok(())
    }

    /// 🗑️ Joins whatever is still running and aborts the upload. Never fails;
    /// a failed abort is logged and left to the store's lifecycle rules.
    async fn discard(mut self, transport: &Arc<dyn Transport>) {
        self.drain().await;
        match transport.abort_upload(&self.key, &self.upload_id).await {
            Ok(()) => info!("🗑️ upload {} of '{}' aborted", self.upload_id, self.key),
            Err(error) => warn!(
                "⚠️ could not abort upload {} of '{}': {error}",
                self.upload_id, self.key
            ),
        }
    }
}

/// 📝 The buffered, bounded-parallel multipart writer.
#[derive(Debug)]
pub struct BufferedMultipartWriter {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    session: Option<WriteSession>,
}

impl BufferedMultipartWriter {
    pub fn new(transport: Arc<dyn Transport>, cancel: CancellationToken) -> Self {
        Self {
            transport,
            cancel,
            session: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn bytes_written(&self) -> u64 {
        self.session.as_ref().map_or(0, |session| session.bytes_written)
    }

    /// 🎟️ Validates the params and starts a multipart upload.
    pub async fn open(&mut self, params: WriterParams) -> TransferResult<()> {
        if params.chunk_size == 0 {
            return Err(TransferError::Setup("chunk size must be greater than zero".into()));
        }
        if params.max_workers == 0 {
            return Err(TransferError::Setup(
                "the writer needs at least one upload worker".into(),
            ));
        }
        if self.session.is_some() {
            return Err(TransferError::Setup(
                "the writer is already open; close it before reopening".into(),
            ));
        }
        ensure_not_cancelled(&self.cancel, "multipart upload")?;

        let upload_id = self
            .transport
            .get_upload_id(&params.key)
            .await
            .map_err(|error| {
                TransferError::Setup(format!(
                    "could not start a multipart upload for '{}': {error}",
                    params.key
                ))
            })?;
        if upload_id.is_empty() {
            return Err(TransferError::Setup(format!(
                "the store returned an empty upload id for '{}'",
                params.key
            )));
        }

        info!(
            "🎟️ upload {upload_id} started for '{}': {} byte parts, {} in flight",
            params.key, params.chunk_size, params.max_workers
        );
        self.session = Some(WriteSession {
            key: Arc::from(params.key.as_str()),
            upload_id: Arc::from(upload_id.as_str()),
            chunk_size: params.chunk_size,
            buffer: Vec::with_capacity(params.chunk_size),
            next_part_number: 1,
            slots: Arc::new(Semaphore::new(params.max_workers)),
            parts: Arc::new(Mutex::new(BTreeMap::new())),
            shared: Arc::new(FirstError::new()),
            in_flight: Vec::new(),
            bytes_written: 0,
        });
        Ok(())
    }

    /// 📝 Buffers `data`, flushing a part every time the buffer fills.
    /// Returns `data.len()`; an empty slice is a no-op that returns 0.
    pub async fn write(&mut self, data: &[u8]) -> TransferResult<usize> {
        let Some(session) = self.session.as_mut() else {
            return Err(TransferError::Setup("write called on a writer that is not open".into()));
        };
        if data.is_empty() {
            return Ok(0);
        }

        let mut consumed = 0;
        while consumed < data.len() {
            consumed += session.buffer_some(&data[consumed..]);
            if session.buffer_is_full() {
                if let Err(error) = session.flush(&self.transport, &self.cancel).await {
                    return Err(self.unwind(error).await);
                }
            }
        }
        session.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    /// 🛑 A query abort tears the upload down right here; anything else waits for `close`.
    async fn unwind(&mut self, error: TransferError) -> TransferError {
        if error.is_query_abort() {
            if let Some(session) = self.session.take() {
                warn!("🛑 upload of '{}' cancelled; aborting", session.key);
                session.discard(&self.transport).await;
            }
        }
        error
    }

    /// 🗑️ Gives up on the current upload: joins the uploaders and aborts it.
    /// For callers whose own input failed halfway. A no-op when nothing is open.
    pub async fn abort(&mut self) {
        if let Some(session) = self.session.take() {
            session.discard(&self.transport).await;
        }
    }

    /// ✅ Uploads the last part, waits for every part, and completes the upload.
    ///
    /// On failure the upload is aborted and the first error is returned. The
    /// writer is reset either way; closing again is a no-op.
    pub async fn close(&mut self) -> TransferResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        match session.finish(&self.transport, &self.cancel).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!("💀 upload of '{}' failed: {error}", session.key);
                session.discard(&self.transport).await;
                Err(error)
            }
        }
    }
}

impl Drop for BufferedMultipartWriter {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        warn!(
            "⚠️ writer for '{}' dropped without close; aborting upload {}",
            session.key, session.upload_id
        );
        match Handle::try_current() {
            Ok(runtime) => {
                let transport = Arc::clone(&self.transport);
                runtime.spawn(async move { session.discard(&transport).await });
            }
            Err(_) => warn!("⚠️ no runtime left to abort upload {}", session.upload_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;
    use std::time::Duration;

    fn params(chunk_size: usize, max_workers: usize) -> WriterParams {
        WriterParams {
            key: "out".into(),
            chunk_size,
            max_workers,
        }
    }

    fn writer_over(transport: &Arc<ScriptedTransport>) -> BufferedMultipartWriter {
        let transport: Arc<dyn Transport> = transport.clone();
        BufferedMultipartWriter::new(transport, CancellationToken::new())
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 253) as u8).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_0x101_bytes_become_two_parts() {
        let the_transport = Arc::new(ScriptedTransport::new());
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(256, 4)).await.unwrap();

        let the_data = pattern(0x101);
        assert_eq!(the_writer.write(&the_data[..0x80]).await.unwrap(), 0x80);
        assert_eq!(the_writer.write(&the_data[0x80..]).await.unwrap(), 0x81);
        assert_eq!(the_writer.bytes_written(), 0x101);
        the_writer.close().await.unwrap();

        assert_eq!(the_transport.completions(), vec![vec![1, 2]]);
        assert_eq!(the_transport.store().object("out"), Some(the_data));
        assert_eq!(the_transport.abort_count(), 0);
        assert!(!the_writer.is_open());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_writing_nothing_uploads_nothing() {
        let the_transport = Arc::new(ScriptedTransport::new());
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(256, 2)).await.unwrap();

        assert_eq!(the_writer.write(&[]).await.unwrap(), 0);
        the_writer.close().await.unwrap();

        assert!(the_transport.uploaded_parts().is_empty());
        assert!(the_transport.completions().is_empty());
        // -- the dangling upload was cleaned up instead of completed
        assert_eq!(the_transport.abort_count(), 1);
        assert_eq!(the_transport.store().pending_uploads(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_bad_params_never_reach_the_store() {
        let the_transport = Arc::new(ScriptedTransport::new());
        let mut the_writer = writer_over(&the_transport);
        assert!(matches!(
            the_writer.open(params(0, 2)).await,
            Err(TransferError::Setup(_))
        ));
        assert!(matches!(
            the_writer.open(params(16, 0)).await,
            Err(TransferError::Setup(_))
        ));
        assert!(matches!(
            the_writer.write(b"nope").await,
            Err(TransferError::Setup(_))
        ));
        assert_eq!(the_transport.store().pending_uploads(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_no_upload_id_means_no_writer() {
        let the_transport = Arc::new(
            ScriptedTransport::new().fail_upload_id(TransferError::Transport("refused".into())),
        );
        let mut the_writer = writer_over(&the_transport);
        let the_error = the_writer.open(params(16, 2)).await.unwrap_err();
        assert!(matches!(the_error, TransferError::Setup(ref message) if message.contains("refused")));
        assert!(!the_writer.is_open());
        the_writer.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_the_pool_never_overflows() {
        let the_transport = Arc::new(
            ScriptedTransport::new().upload_delay(|_| Duration::from_millis(10)),
        );
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(16, 3)).await.unwrap();

        let the_data = pattern(16 * 20 + 5);
        for piece in the_data.chunks(7) {
            the_writer.write(piece).await.unwrap();
            assert!(the_transport.uploads_in_flight() <= 3);
        }
        the_writer.close().await.unwrap();

        assert!(the_transport.peak_uploads() <= 3, "peak {}", the_transport.peak_uploads());
        assert!(the_transport.peak_uploads() > 1);
        assert_eq!(the_transport.completions(), vec![(1..=21).collect::<Vec<u64>>()]);
        assert_eq!(the_transport.store().object("out"), Some(the_data));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_slow_odd_parts_still_complete_in_order() {
        let the_transport = Arc::new(ScriptedTransport::new().upload_delay(|part| {
            if part % 2 == 1 {
                Duration::from_millis(60)
            } else {
                Duration::from_millis(5)
            }
        }));
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(8, 6)).await.unwrap();

        let the_data = pattern(48);
        the_writer.write(&the_data).await.unwrap();
        the_writer.close().await.unwrap();

        assert_ne!(the_transport.uploaded_parts().first(), Some(&1));
        assert_eq!(the_transport.completions(), vec![vec![1, 2, 3, 4, 5, 6]]);
        assert_eq!(the_transport.store().object("out"), Some(the_data));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_part_two_fails_and_close_cleans_up() {
        let the_transport = Arc::new(
            ScriptedTransport::new()
                .upload_delay(|part| Duration::from_millis(if part == 2 { 40 } else { 5 }))
                .fail_part(2, TransferError::Transport("connection reset".into())),
        );
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(100, 3)).await.unwrap();

        the_writer.write(&pattern(300)).await.unwrap();
        let the_error = the_writer.close().await.unwrap_err();

        assert_eq!(the_error, TransferError::Transport("connection reset".into()));
        assert_eq!(the_transport.uploads_in_flight(), 0);
        let mut the_survivors = the_transport.uploaded_parts();
        the_survivors.sort_unstable();
        assert_eq!(the_survivors, vec![1, 3]);
        assert!(the_transport.completions().is_empty());
        assert_eq!(the_transport.abort_count(), 1);
        assert_eq!(the_transport.store().pending_uploads(), 0);

        // -- second close: nothing left to do, nothing to complain about
        the_writer.close().await.unwrap();
        assert_eq!(the_transport.abort_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_a_recorded_failure_stops_the_next_flush() {
        let the_transport = Arc::new(
            ScriptedTransport::new().fail_part(1, TransferError::Transport("boom".into())),
        );
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(4, 1)).await.unwrap();

        // -- one slot: part 2 waits for part 1's permit, then sees its error
        let the_error = the_writer.write(&pattern(12)).await.unwrap_err();
        assert_eq!(the_error, TransferError::Transport("boom".into()));
        assert!(the_writer.is_open());

        assert_eq!(the_writer.close().await.unwrap_err(), the_error);
        assert_eq!(the_transport.abort_count(), 1);
        assert!(the_transport.completions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_cancel_aborts_exactly_once() {
        let the_transport = Arc::new(
            ScriptedTransport::new().upload_delay(|_| Duration::from_millis(50)),
        );
        let the_token = CancellationToken::new();
        let transport: Arc<dyn Transport> = the_transport.clone();
        let mut the_writer = BufferedMultipartWriter::new(transport, the_token.clone());
        the_writer.open(params(16, 2)).await.unwrap();

        let canceller = the_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let the_piece = pattern(16);
        let the_error = loop {
            if let Err(error) = the_writer.write(&the_piece).await {
                break error;
            }
        };
        assert!(the_error.is_query_abort(), "{the_error}");
        assert!(!the_writer.is_open());
        assert_eq!(the_transport.uploads_in_flight(), 0);
        assert_eq!(the_transport.abort_count(), 1);
        assert!(the_transport.completions().is_empty());

        the_writer.close().await.unwrap();
        the_writer.close().await.unwrap();
        assert_eq!(the_transport.abort_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_cancel_lands_between_the_last_write_and_close() {
        // -- one full part already shipped, a tail still sitting in the buffer
        let the_transport = Arc::new(ScriptedTransport::new());
        let the_token = CancellationToken::new();
        let transport: Arc<dyn Transport> = the_transport.clone();
        let mut the_writer = BufferedMultipartWriter::new(transport, the_token.clone());
        the_writer.open(params(4, 2)).await.unwrap();
        assert_eq!(the_writer.write(&pattern(6)).await.unwrap(), 6);

        the_token.cancel();
        let the_error = the_writer.close().await.unwrap_err();
        assert!(the_error.is_query_abort(), "{the_error}");
        assert!(!the_writer.is_open());
        assert_eq!(the_transport.uploads_in_flight(), 0);
        assert_eq!(the_transport.abort_count(), 1);
        assert!(the_transport.completions().is_empty());
        assert_eq!(the_transport.store().object("out"), None);

        the_writer.close().await.unwrap();
        assert_eq!(the_transport.abort_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_cancel_after_an_exact_fit_still_refuses_to_complete() {
        // -- nothing buffered, so close goes straight to joining and completing
        let the_transport = Arc::new(ScriptedTransport::new());
        let the_token = CancellationToken::new();
        let transport: Arc<dyn Transport> = the_transport.clone();
        let mut the_writer = BufferedMultipartWriter::new(transport, the_token.clone());
        the_writer.open(params(4, 2)).await.unwrap();
        assert_eq!(the_writer.write(&pattern(8)).await.unwrap(), 8);

        the_token.cancel();
        let the_error = the_writer.close().await.unwrap_err();
        assert!(the_error.is_query_abort(), "{the_error}");
        assert_eq!(the_transport.uploads_in_flight(), 0);
        assert_eq!(the_transport.abort_count(), 1);
        assert!(the_transport.completions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_the_caller_bails_and_nothing_gets_completed() {
        let the_transport = Arc::new(ScriptedTransport::new());
        let mut the_writer = writer_over(&the_transport);
        the_writer.open(params(4, 2)).await.unwrap();
        the_writer.write(b"half of something").await.unwrap();

        the_writer.abort().await;
        the_writer.abort().await;
        assert!(!the_writer.is_open());
        assert_eq!(the_transport.abort_count(), 1);
        assert!(the_transport.completions().is_empty());
        assert_eq!(the_transport.store().object("out"), None);
        the_writer.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_one_where_a_closed_writer_takes_another_job() {
        let the_transport = Arc::new(ScriptedTransport::new());
        let mut the_writer = writer_over(&the_transport);

        the_writer.open(params(10, 2)).await.unwrap();
        the_writer.write(b"first object").await.unwrap();
        the_writer.close().await.unwrap();

        the_writer.open(params(3, 2)).await.unwrap();
        the_writer.write(b"second").await.unwrap();
        the_writer.close().await.unwrap();

        assert_eq!(the_transport.store().object("out"), Some(b"second".to_vec()));
        assert_eq!(the_transport.completions(), vec![vec![1, 2], vec![1, 2]]);
    }
}
