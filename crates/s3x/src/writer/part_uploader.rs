//! 📤 PartUploader: one task, one part, one PUT, then it clocks out.
//!
//! It carries the pool permit for its whole life. Whichever way the upload ends
//! (etag, error, cancel), dropping the permit is what frees the slot for the
//! next flush, so a failed part can never wedge a blocked writer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::abort::{FirstError, query_abort};
use crate::errors::TransferResult;
use crate::transport::Transport;
use crate::workers::Worker;

/// Completion tokens by part number. Ordered, because completion must be.
pub(crate) type PartLedger = Arc<Mutex<BTreeMap<u64, String>>>;

#[derive(Debug)]
pub(crate) struct PartUploader {
    pub(crate) key: Arc<str>,
    pub(crate) upload_id: Arc<str>,
    pub(crate) part_number: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cancel: CancellationToken,
    pub(crate) parts: PartLedger,
    pub(crate) shared: Arc<FirstError>,
    pub(crate) permit: OwnedSemaphorePermit,
}

impl Worker for PartUploader {
    fn start(self) -> JoinHandle<TransferResult<()>> {
        tokio::spawn(self.run())
    }
}

impl PartUploader {
    async fn run(self) -> TransferResult<()> {
        let Self {
            key,
            upload_id,
            part_number,
            data,
            transport,
            cancel,
            parts,
            shared,
            permit,
        } = self;
        let size = data.len();

        let uploaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(query_abort("part upload")),
            uploaded = transport.upload_part(&key, &upload_id, part_number, data) => uploaded,
        };

        let outcome = match uploaded {
            Ok(etag) => {
                debug!("📤 part {part_number} of '{key}' uploaded ({size} bytes, etag {etag})");
                parts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(part_number, etag);
                Ok(())
            }
            Err(error) => {
                warn!("💀 part {part_number} of '{key}' failed: {error}");
                shared.record(error.clone());
                Err(error)
            }
        };
        drop(permit);
        outcome
    }
}
