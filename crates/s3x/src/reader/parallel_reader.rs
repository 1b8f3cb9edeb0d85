//! 📖 ParallelReader: reads one object with N ranged GETs in flight, hands the
//! bytes back in order.
//!
//! 🎬 The object is cut into `chunk_size` ranges. N slots each hold one range's
//! worth of bytes, each fed by its own filler task. The caller drains the slots
//! strictly round-robin in creation order, and since each slot's next range is
//! claimed the moment it is drained, the ranges come out in object order.
//! Order preserved, parallelism achieved, nobody had to sort anything.
//!
//! 🧠 Knowledge graph:
//! - `open` is synchronous and fails fast on zero chunk size or zero workers.
//! - `read` fills the caller's buffer across chunk boundaries and returns `0`
//!   only once every byte of the object has been delivered.
//! - `close` stops the fillers, joins them, and resets. Safe to call twice,
//!   safe to call on a reader that was never opened.
//! - Cancellation is the caller's token; we only observe it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::abort::{FirstError, query_abort};
use crate::errors::{TransferError, TransferResult};
use crate::reader::chunk_buffer::{ChunkBuffer, ChunkRead, FillerContext};
use crate::reader::range_allocator::RangeAllocator;
use crate::transport::Transport;
use crate::workers::{Worker, join_workers};

/// 🔧 What to read and how hard to try.
#[derive(Debug, Clone)]
pub struct ReaderParams {
    pub key: String,
    pub object_size: u64,
    pub chunk_size: u64,
    pub num_workers: usize,
}

/// Everything that exists only between `open` and `close`.
#[derive(Debug)]
struct ReadSession {
    key: Arc<str>,
    object_size: u64,
    allocator: RangeAllocator,
    buffers: Vec<ChunkBuffer>,
    workers: Vec<JoinHandle<TransferResult<()>>>,
    current: usize,
    delivered: u64,
    shared: Arc<FirstError>,
    stop: CancellationToken,
}

/// 📖 The chunked, parallel, order-preserving object reader.
#[derive(Debug)]
pub struct ParallelReader {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    session: Option<ReadSession>,
}

impl ParallelReader {
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

    /// Bytes handed to the caller since `open`.
    pub fn bytes_delivered(&self) -> u64 {
        self.session.as_ref().map_or(0, |session| session.delivered)
    }

    /// 🚀 Claims the first range for every slot and starts one filler per slot.
    pub fn open(&mut self, params: ReaderParams) -> TransferResult<()> {
        if params.chunk_size == 0 {
            return Err(TransferError::Setup("chunk size must be greater than zero".into()));
        }
        if params.num_workers == 0 {
            return Err(TransferError::Setup(
                "the reader needs at least one worker".into(),
            ));
        }
        if self.session.is_some() {
            return Err(TransferError::Setup(
                "the reader is already open; close it before reopening".into(),
            ));
        }

        let key: Arc<str> = Arc::from(params.key.as_str());
        let allocator = RangeAllocator::new(params.object_size, params.chunk_size);
        let shared = Arc::new(FirstError::new());
        let stop = self.cancel.child_token();
        let context = FillerContext {
            key: Arc::clone(&key),
            transport: Arc::clone(&self.transport),
            cancel: self.cancel.clone(),
            stop: stop.clone(),
        };

        let mut buffers = Vec::with_capacity(params.num_workers);
        let mut workers = Vec::with_capacity(params.num_workers);
        for index in 0..params.num_workers {
            let (buffer, filler) =
                ChunkBuffer::new(index, &allocator, Arc::clone(&shared), context.clone());
            buffers.push(buffer);
            workers.push(filler.start());
        }

        info!(
            "📖 reading '{key}': {} bytes in {} byte chunks across {} workers",
            params.object_size, params.chunk_size, params.num_workers
        );
        self.session = Some(ReadSession {
            key,
            object_size: params.object_size,
            allocator,
            buffers,
            workers,
            current: 0,
            delivered: 0,
            shared,
            stop,
        });
        Ok(())
    }

    /// 📖 Fills `buf` with the next bytes of the object, in order.
    ///
    /// Returns the number of bytes written, which is less than `buf.len()` only at
    /// the very end of the object. `Ok(0)` means the object has been fully read and
    /// nothing else. An empty `buf` is a setup error, so it can't pass for end of object.
    /// The first worker error is returned on every call after it happened.
    pub async fn read(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        if self.cancel.is_cancelled() && self.session.is_some() {
            return Err(self.abort().await);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(TransferError::Setup("read called on a reader that is not open".into()));
        };
        session.shared.check()?;
        if buf.is_empty() {
            return Err(TransferError::Setup(
                "read called with an empty buffer; a zero-byte read only means end of object".into(),
            ));
        }

        let mut filled = 0;
        let mut interrupted = false;
        while filled < buf.len() && session.delivered < session.object_size {
            let index = session.current;
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                step = session.buffers[index].read(&mut buf[filled..], &session.allocator) => Some(step),
            };
            let Some(step) = step else {
                interrupted = true;
                break;
            };
            match step? {
                ChunkRead::Partial(copied) => {
                    filled += copied;
                    session.delivered += copied as u64;
                }
                ChunkRead::Drained(copied) => {
                    filled += copied;
                    session.delivered += copied as u64;
                    session.current = (index + 1) % session.buffers.len();
                }
                ChunkRead::ObjectEnded => {
                    // -- ranges add up to object_size, so this means the store lied about it
                    warn!(
                        "⚠️ '{}' ended after {} of {} bytes",
                        session.key, session.delivered, session.object_size
                    );
                    let short = TransferError::PartialResponse {
                        expected: session.object_size,
                        actual: session.delivered,
                    };
                    session.shared.record(short);
                    return session.shared.check().map(|_| filled);
                }
            }
        }

        if interrupted {
            return Err(self.abort().await);
        }
        Ok(filled)
    }

    /// 🛑 Cancellation observed: drain the fillers, mark the shared error, unwind.
    /// There is nothing to undo for a read.
    async fn abort(&mut self) -> TransferError {
        let error = query_abort("parallel read");
        if let Some(session) = self.session.as_mut() {
            session.stop.cancel();
            let workers = std::mem::take(&mut session.workers);
            join_workers(workers, "chunk filler").await;
            session.shared.record(error.clone());
            warn!(
                "🛑 read of '{}' aborted after {} bytes",
                session.key, session.delivered
            );
        }
        error
    }

    /// 🗑️ Stops every filler, waits for all of them, and forgets the transfer.
    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.stop.cancel();
        let workers = std::mem::take(&mut session.workers);
        let (key, delivered) = (Arc::clone(&session.key), session.delivered);
        // -- dropping the slots closes the channels, so idle fillers see it too
        drop(session);
        join_workers(workers, "chunk filler").await;
        debug!("🗑️ reader for '{key}' closed after {delivered} bytes");
    }
}

impl Drop for ParallelReader {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_ref() {
            session.stop.cancel();
        }
    }
}
