//! 🧺 ChunkBuffer: one slot of the parallel reader, and the task that keeps it fed.
//!
//! Each slot is a little two-channel handshake:
//!
//! ```text
//!   reader ──(Range)──▶ ChunkFiller ──GET──▶ store
//!   reader ◀──(Fill)─── ChunkFiller
//! ```
//!
//! Both channels are bounded(1). The reader only sends the next range after it
//! has fully drained the previous chunk, so at most one chunk per slot is ever
//! held in memory. That is the "ReadyToFill / ReadyToRead" dance, minus the
//! condition variable.
//!
//! 🧠 Knowledge graph:
//! - The first range of every slot is claimed at construction, in slot order.
//! - A zero-length range is the end-of-object marker; the filler answers it with
//!   `Fill::End` and clocks out.
//! - Any failure goes into the shared `FirstError` *before* `Fill::Failed` is sent,
//!   so the reader can always find out what went wrong.

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::abort::{FirstError, query_abort};
use crate::errors::{TransferError, TransferResult};
use crate::reader::range_allocator::{Range, RangeAllocator};
use crate::transport::Transport;
use crate::workers::Worker;

/// 📦 A fetched range and its bytes.
#[derive(Debug)]
pub(crate) struct FilledChunk {
    range: Range,
    data: Vec<u8>,
}

/// What a filler hands back for one claimed range.
#[derive(Debug)]
pub(crate) enum Fill {
    Chunk(FilledChunk),
    /// The slot was given the end marker. Nothing more will come.
    End,
    /// Something broke. The reason is in the shared error cell.
    Failed,
}

/// 🚦 The outcome of one read from a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkRead {
    /// The caller's buffer filled up first; the chunk still has bytes.
    Partial(usize),
    /// The chunk is used up; its memory is released and the slot's next range is claimed.
    Drained(usize),
    /// This slot reached the end of the object.
    ObjectEnded,
}

/// 🧺 The reader's side of a slot.
#[derive(Debug)]
pub(crate) struct ChunkBuffer {
    index: usize,
    assign_tx: Sender<Range>,
    filled_rx: Receiver<Fill>,
    shared: Arc<FirstError>,
    current: Option<FilledChunk>,
    consume_offset: usize,
    ended: bool,
}

impl ChunkBuffer {
    /// Builds a slot and its filler. The slot's first range is claimed right here.
    pub(crate) fn new(
        index: usize,
        allocator: &RangeAllocator,
        shared: Arc<FirstError>,
        filler: FillerContext,
    ) -> (Self, ChunkFiller) {
        let (assign_tx, assign_rx) = async_channel::bounded(1);
        let (filled_tx, filled_rx) = async_channel::bounded(1);

        // -- a fresh bounded(1) channel always has room for its first message
        let _ = assign_tx.try_send(allocator.next_range());

        let buffer = Self {
            index,
            assign_tx,
            filled_rx,
            shared: Arc::clone(&shared),
            current: None,
            consume_offset: 0,
            ended: false,
        };
        let filler = ChunkFiller {
            index,
            context: filler,
            shared,
            ranges: assign_rx,
            filled: filled_tx,
        };
        (buffer, filler)
    }

    fn failure(&self) -> TransferError {
        self.shared.get().unwrap_or_else(|| {
            TransferError::Transport(format!(
                "chunk filler {} stopped without reporting why",
                self.index
            ))
        })
    }

    /// 📖 Copies as much of the current chunk as fits into `buf`, waiting for the
    /// filler if the chunk hasn't arrived yet.
    ///
    /// When the chunk is fully consumed (`buf.len() >= available`), its storage is
    /// dropped and the next range is claimed from `allocator` for this slot.
    pub(crate) async fn read(
        &mut self,
        buf: &mut [u8],
        allocator: &RangeAllocator,
    ) -> TransferResult<ChunkRead> {
        if self.ended {
            return Ok(ChunkRead::ObjectEnded);
        }
        if self.current.is_none() {
            match self.filled_rx.recv().await {
                Ok(Fill::Chunk(chunk)) => {
                    trace!(
                        "🧺 slot {} received {} bytes at offset {}",
                        self.index,
                        chunk.data.len(),
                        chunk.range.offset
                    );
                    self.current = Some(chunk);
                    self.consume_offset = 0;
                }
                Ok(Fill::End) => {
                    self.ended = true;
                    return Ok(ChunkRead::ObjectEnded);
                }
                Ok(Fill::Failed) | Err(_) => return Err(self.failure()),
            }
        }

        let Some(chunk) = self.current.as_ref() else {
            return Err(self.failure());
        };
        let available = &chunk.data[self.consume_offset..];
        let copied = buf.len().min(available.len());
        buf[..copied].copy_from_slice(&available[..copied]);

        if buf.len() < available.len() {
            self.consume_offset += copied;
            return Ok(ChunkRead::Partial(copied));
        }

        self.current = None;
        self.consume_offset = 0;
        let next = allocator.next_range();
        if self.assign_tx.try_send(next).is_err() {
            // -- the filler is gone; the next read on this slot reports why
            debug!("🧺 slot {} could not hand range {next:?} to its filler", self.index);
        }
        Ok(ChunkRead::Drained(copied))
    }
}

/// What every filler of one reader shares.
#[derive(Debug, Clone)]
pub(crate) struct FillerContext {
    pub(crate) key: Arc<str>,
    pub(crate) transport: Arc<dyn Transport>,
    /// The caller's token. Seeing it cancelled means "query abort".
    pub(crate) cancel: CancellationToken,
    /// Child of `cancel`, also cancelled when the reader closes.
    pub(crate) stop: CancellationToken,
}

/// 🚚 Fetches ranges for one slot until the end marker, an error, or a stop.
#[derive(Debug)]
pub(crate) struct ChunkFiller {
    index: usize,
    context: FillerContext,
    shared: Arc<FirstError>,
    ranges: Receiver<Range>,
    filled: Sender<Fill>,
}

impl Worker for ChunkFiller {
    fn start(self) -> JoinHandle<TransferResult<()>> {
        tokio::spawn(self.run())
    }
}

impl ChunkFiller {
    fn fail(&self, error: TransferError) -> TransferError {
        if !self.shared.record(error.clone()) {
            trace!("🚚 filler {} error lost the race: {error}", self.index);
        }
        let _ = self.filled.try_send(Fill::Failed);
        error
    }

    async fn run(self) -> TransferResult<()> {
        loop {
            let range = tokio::select! {
                biased;
                _ = self.context.stop.cancelled() => break,
                next = self.ranges.recv() => match next {
                    Ok(range) => range,
                    Err(_) => break,
                },
            };

            // -- fill entry: abort first, then somebody else's error
            if self.context.cancel.is_cancelled() {
                return Err(self.fail(query_abort("chunk fill")));
            }
            if let Some(earlier) = self.shared.get() {
                let _ = self.filled.try_send(Fill::Failed);
                return Err(earlier);
            }

            if range.is_end_marker() {
                let _ = self.filled.send(Fill::End).await;
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = self.context.stop.cancelled() => {
                    if self.context.cancel.is_cancelled() {
                        return Err(self.fail(query_abort("chunk fill")));
                    }
                    break;
                }
                fetched = self.context.transport.get_object_range(&self.context.key, range) => fetched,
            };

            let data = match fetched {
                Ok(data) if data.len() as u64 == range.length => data,
                Ok(short) => {
                    return Err(self.fail(TransferError::PartialResponse {
                        expected: range.length,
                        actual: short.len() as u64,
                    }));
                }
                Err(error) => return Err(self.fail(error)),
            };

            debug!(
                "🚚 filler {} fetched [{}, {}) of '{}'",
                self.index,
                range.offset,
                range.end(),
                self.context.key
            );
            if self
                .filled
                .send(Fill::Chunk(FilledChunk { range, data }))
                .await
                .is_err()
            {
                // -- the reader closed while we were fetching
                break;
            }
        }
        Ok(())
    }
}
