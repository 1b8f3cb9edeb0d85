//! 🪣 s3x: chunked, parallel, in-order object reads and bounded-parallel multipart writes.
//!
//! 🎬 "Some objects are too big to fetch in one GET." So we don't.
//!
//! 🏗️ Layout:
//! - `reader` splits an object into fixed-size ranges and keeps `num_workers` of
//!   them in flight while the caller consumes bytes strictly in order.
//! - `writer` buffers writes into parts and uploads up to `max_workers` at once,
//!   completing (or aborting) the multipart upload at the end.
//! - `transport` is the object-store seam: an S3 SDK client or an in-memory stand-in.
//! - `transfers` glues them into whole jobs for the CLI.

pub mod app_config;
pub mod codec;
pub mod errors;
pub mod reader;
pub mod transfers;
pub mod transport;
pub mod writer;

pub(crate) mod abort;
pub(crate) mod progress;
pub(crate) mod workers;

pub use app_config::{AppConfig, TransferConfig, load_config};
pub use codec::CompressionType;
pub use errors::{TransferError, TransferResult};
pub use reader::{ParallelReader, ReaderParams};
pub use transfers::{ObjectStat, Segment, TransferOptions, TransferSummary};
pub use transport::{InMemoryStore, ObjectSummary, Transport, TransportBackend, TransportConfig};
pub use writer::{BufferedMultipartWriter, WriterParams};
