//! 🧵 Workers: the tasks that actually move bytes while the reader and writer
//! take all the credit in the sprint retro.
//!
//! Two kinds clock in here:
//! - `ChunkFiller` (reader side): one per chunk buffer, lives as long as the transfer.
//! - `PartUploader` (writer side): one per in-flight part, clocks out after a single PUT.
//!
//! Both report failures twice: once into the transfer's shared first-error cell
//! (so blocked callers wake up with it) and once through their `JoinHandle`.

use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::TransferResult;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    /// 🚀 Spawn onto the runtime. The handle is how the owner joins us on close.
    fn start(self) -> JoinHandle<TransferResult<()>>;
}

/// 🧹 Join every handle, however it ended. Errors were already recorded in the
/// shared cell by the worker itself; panics get logged here because nobody else saw them.
pub(crate) async fn join_workers(handles: Vec<JoinHandle<TransferResult<()>>>, crew: &str) {
    for outcome in futures::future::join_all(handles).await {
        if let Err(join_error) = outcome {
            warn!("⚠️ a {crew} worker did not exit cleanly: {join_error}");
        }
    }
}
