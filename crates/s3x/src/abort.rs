//! 🛑 Abort plumbing shared by the reader and the writer.
//!
//! Two tiny pieces of glue live here:
//! - [`FirstError`]: a set-once error cell. The first worker to fail writes its error,
//!   everybody after that reads the same one. Deterministic failure messages, even
//!   when twelve tasks explode at once.
//! - [`ensure_not_cancelled`]: the cooperative cancellation poll. The token is handed in
//!   by whoever opened the transfer; we never cancel it ourselves.
//!
//! 🧠 Knowledge graph: the mutex in `FirstError` is std, not tokio. It is only ever held
//! for a clone or a swap, never across an `.await`.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::errors::{TransferError, TransferResult};

/// 🥇 First-error-wins cell. Later errors are dropped on the floor (and logged by the caller).
#[derive(Debug, Default)]
pub(crate) struct FirstError {
    slot: Mutex<Option<TransferError>>,
}

impl FirstError {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // -- a poisoned lock only means some task panicked mid-clone; the Option inside is still fine
    fn lock(&self) -> MutexGuard<'_, Option<TransferError>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records `error` if nothing was recorded yet. Returns `true` when this call won.
    pub(crate) fn record(&self, error: TransferError) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        true
    }

    pub(crate) fn get(&self) -> Option<TransferError> {
        self.lock().clone()
    }

    /// Re-raises the recorded error, if any.
    pub(crate) fn check(&self) -> TransferResult<()> {
        match self.get() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

}

/// 🛑 Polls the cancellation token. `what` ends up in the abort message so the
/// logs say *which* transfer got interrupted.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken, what: &str) -> TransferResult<()> {
    if cancel.is_cancelled() {
        return Err(query_abort(what));
    }
    Ok(())
}

pub(crate) fn query_abort(what: &str) -> TransferError {
    TransferError::QueryAbort(format!("{what} was interrupted by cancellation"))
}
