//! 💀 Errors: six flavours of chunked transfer apocalypse.
//!
//! 🎬 Setup went wrong, the store lied about a byte count, the network coughed,
//! or somebody upstairs pressed cancel. Those are the plot lines. Every failure
//! a reader or writer can hit ends up as exactly one of these.
//!
//! 🧠 Knowledge graph:
//! - `TransferError` is `Clone` on purpose: the first error recorded by any worker
//!   is stored in a shared cell and handed to *every* caller that asks afterwards.
//! - The library speaks `TransferError`. The orchestration layer and the CLI wrap it
//!   in `anyhow` with context, same as the rest of the stack.
//! - `QueryAbort` outranks everything else once observed.
//!
//! 🦆 The duck reviewed this taxonomy and asked for a fifth horseman. Denied.

use thiserror::Error;

/// 📦 The library-wide result alias. Short, sweet, typed.
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// 💀 Everything that can go sideways while moving an object in chunks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// 🔧 Invalid configuration or a transfer that could not even start
    /// (zero chunk size, zero workers, no upload id, not opened).
    #[error("💀 transfer setup failed: {0}")]
    Setup(String),

    /// 📏 The store handed back a different number of bytes than the range asked for.
    #[error("💀 partial response: expected {expected} bytes, got {actual}")]
    PartialResponse { expected: u64, actual: u64 },

    /// 📡 Network or HTTP failure surfaced by a worker.
    #[error("💀 transport error: {0}")]
    Transport(String),

    /// 🔄 We asked politely, several times. The network declined every time.
    #[error("💀 request to '{url}' failed after {attempts} attempt(s): {message}")]
    FailedAfterRetry {
        url: String,
        attempts: u32,
        message: String,
    },

    /// 🧾 The store answered, but with an error document instead of data.
    #[error("💀 object store replied {status} {code}: {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    /// 🛑 Cancellation observed; the transfer unwound and drained its workers.
    #[error("🛑 query aborted: {0}")]
    QueryAbort(String),
}

impl TransferError {
    /// 🛑 Is this the "somebody pressed cancel" flavour of doom?
    pub fn is_query_abort(&self) -> bool {
        matches!(self, TransferError::QueryAbort(_))
    }

    /// 🔄 Would trying the same request again plausibly help?
    ///
    /// Only the transport layer acts on this; the reader and writer never retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport(_) => true,
            TransferError::Remote { status, .. } => *status >= 500,
            TransferError::Setup(_)
            | TransferError::PartialResponse { .. }
            | TransferError::FailedAfterRetry { .. }
            | TransferError::QueryAbort(_) => false,
        }
    }
}
