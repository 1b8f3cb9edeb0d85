//! 🔌 Transport: the thing that actually talks to the object store.
//!
//! 🚰 The reader asks for byte ranges, the writer ships numbered parts, and
//! neither of them knows (or cares) whether the bytes come from a real S3-ish
//! endpoint through the AWS SDK or from a `BTreeMap` in RAM. That's this module's job.
//!
//! 🎭 Same casting agency as always: one trait, a couple of concrete backends,
//! and an enum that dispatches to whichever one the config picked.
//!
//! 🧠 Knowledge graph:
//! - `Transport` is consumed as `Arc<dyn Transport>` by `ParallelReader` and
//!   `BufferedMultipartWriter`; workers clone the `Arc` into their tasks.
//! - Retries belong here and only here. The reader and writer never retry.
//! - `check_compression_type` has a default body: two magic bytes, one sniff.
//!
//! 🦆 The duck asked whether S3 is a filesystem. We asked the duck to leave.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::{CompressionType, MAGIC_BYTES_NUM, sniff_compression};
use crate::errors::TransferResult;
use crate::reader::Range;

pub(crate) mod in_mem;
pub(crate) mod s3;
#[cfg(test)]
pub(crate) mod scripted;

pub use in_mem::InMemoryStore;
pub use s3::{S3Transport, S3TransportConfig};

/// 📋 One entry of a listing. Zero-sized keys never make it this far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// 🧾 A finished part, as it goes into the completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based, strictly ascending within one completion request.
    pub part_number: u64,
    /// The completion token (ETag) the store handed back for this part.
    pub etag: String,
}

/// 🔌 The object-store contract.
///
/// # Contract
/// - `get_object_range` returns exactly `range.length` bytes unless the range runs past the
///   end of the object. Callers validate the length; implementations don't pad.
/// - `upload_part` returns the completion token the store assigned to that part.
/// - `complete_multipart` expects `parts` in strictly ascending `part_number` order.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// 📏 Object size in bytes (HEAD, Content-Length).
    async fn object_size(&self, key: &str) -> TransferResult<u64>;

    /// 🔍 Does the key exist? Missing and forbidden both read as `false`.
    async fn key_exists(&self, key: &str) -> TransferResult<bool>;

    /// 📋 Every non-empty key under `prefix`, across all listing pages.
    async fn list_objects(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>>;

    /// 📦 Bytes `[range.offset, range.offset + range.length)` of `key`.
    async fn get_object_range(&self, key: &str, range: Range) -> TransferResult<Vec<u8>>;

    /// 🫁 Peeks at the first two bytes. Objects shorter than that are plain.
    async fn check_compression_type(&self, key: &str) -> TransferResult<CompressionType> {
        let object_size = self.object_size(key).await?;
        if object_size < MAGIC_BYTES_NUM {
            return Ok(CompressionType::Plain);
        }
        let magic = self
            .get_object_range(key, Range::new(0, MAGIC_BYTES_NUM))
            .await?;
        Ok(sniff_compression(&magic))
    }

    /// 🎟️ Starts a multipart upload and returns its id.
    async fn get_upload_id(&self, key: &str) -> TransferResult<String>;

    /// 📤 Uploads one part and returns its completion token.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u64,
        data: Vec<u8>,
    ) -> TransferResult<String>;

    /// ✅ Assembles the uploaded parts into the final object.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransferResult<()>;

    /// 🗑️ Throws away a multipart upload and every part uploaded under it.
    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransferResult<()>;
}

/// 🔧 Which transport to build. Externally tagged, so the TOML reads
/// `[transport.S3]` or `transport = "InMemory"`.
#[derive(Debug, Deserialize, Clone, Default)]
pub enum TransportConfig {
    #[serde(alias = "s3")]
    S3(S3TransportConfig),
    /// RAM-only store. Starts empty and forgets everything on exit.
    #[default]
    #[serde(alias = "in_memory")]
    InMemory,
}

/// 🎭 The many faces of a Transport.
#[derive(Debug)]
pub enum TransportBackend {
    S3(S3Transport),
    InMemory(InMemoryStore),
}

impl TransportBackend {
    /// Async because the S3 client resolves its credential chain while it's built.
    pub async fn from_config(config: &TransportConfig) -> TransferResult<Self> {
        match config {
            TransportConfig::S3(s3_config) => {
                Ok(TransportBackend::S3(S3Transport::new(s3_config.clone()).await?))
            }
            TransportConfig::InMemory => Ok(TransportBackend::InMemory(InMemoryStore::new())),
        }
    }
}

#[async_trait]
impl Transport for TransportBackend {
    async fn object_size(&self, key: &str) -> TransferResult<u64> {
        match self {
            TransportBackend::S3(t) => t.object_size(key).await,
            TransportBackend::InMemory(t) => t.object_size(key).await,
        }
    }

    async fn key_exists(&self, key: &str) -> TransferResult<bool> {
        match self {
            TransportBackend::S3(t) => t.key_exists(key).await,
            TransportBackend::InMemory(t) => t.key_exists(key).await,
        }
    }

    async fn list_objects(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>> {
        match self {
            TransportBackend::S3(t) => t.list_objects(prefix).await,
            TransportBackend::InMemory(t) => t.list_objects(prefix).await,
        }
    }

    async fn get_object_range(&self, key: &str, range: Range) -> TransferResult<Vec<u8>> {
        match self {
            TransportBackend::S3(t) => t.get_object_range(key, range).await,
            TransportBackend::InMemory(t) => t.get_object_range(key, range).await,
        }
    }

    async fn check_compression_type(&self, key: &str) -> TransferResult<CompressionType> {
        match self {
            TransportBackend::S3(t) => t.check_compression_type(key).await,
            TransportBackend::InMemory(t) => t.check_compression_type(key).await,
        }
    }

    async fn get_upload_id(&self, key: &str) -> TransferResult<String> {
        match self {
            TransportBackend::S3(t) => t.get_upload_id(key).await,
            TransportBackend::InMemory(t) => t.get_upload_id(key).await,
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u64,
        data: Vec<u8>,
    ) -> TransferResult<String> {
        match self {
            TransportBackend::S3(t) => t.upload_part(key, upload_id, part_number, data).await,
            TransportBackend::InMemory(t) => {
                t.upload_part(key, upload_id, part_number, data).await
            }
        }
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransferResult<()> {
        match self {
            TransportBackend::S3(t) => t.complete_multipart(key, upload_id, parts).await,
            TransportBackend::InMemory(t) => t.complete_multipart(key, upload_id, parts).await,
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransferResult<()> {
        match self {
            TransportBackend::S3(t) => t.abort_upload(key, upload_id).await,
            TransportBackend::InMemory(t) => t.abort_upload(key, upload_id).await,
        }
    }
}
