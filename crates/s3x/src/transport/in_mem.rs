//! # Previously, on S3X...
//!
//! 🎬 The bucket was far away, the network was flaky, and the tests wanted to
//! run on a plane. So somebody built an object store out of a `BTreeMap`.
//!
//! `InMemoryStore` keeps whole objects plus pending multipart uploads behind one
//! mutex. It is strict where the real thing is strict: parts must be completed
//! in ascending order, each etag must match what was handed out, and a range
//! that starts past the end of the object is a 416.
//!
//! ✅ No network calls. No disk I/O. Clone it freely; clones share the same store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::errors::{TransferError, TransferResult};
use crate::reader::Range;
use crate::transport::{CompletedPart, ObjectSummary, Transport};

// -- the store's own rule, same as the real thing
const MAX_PART_NUMBER: u64 = 10_000;

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u64, UploadedPart>,
}

#[derive(Debug)]
struct UploadedPart {
    etag: String,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
}

/// 📦 A bucket that lives and dies with the process.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

fn no_such_key(key: &str) -> TransferError {
    TransferError::Remote {
        status: 404,
        code: "NoSuchKey".into(),
        message: format!("the key '{key}' does not exist"),
    }
}

fn no_such_upload(upload_id: &str) -> TransferError {
    TransferError::Remote {
        status: 404,
        code: "NoSuchUpload".into(),
        message: format!("upload '{upload_id}' does not exist"),
    }
}

fn bad_request(code: &str, message: String) -> TransferError {
    TransferError::Remote {
        status: 400,
        code: code.into(),
        message,
    }
}

/// 🏷️ FNV-1a over the part bytes, quoted the way stores quote ETags.
fn etag_for(data: &[u8]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("\"{hash:016x}\"")
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- a panicked test thread can poison this; the maps are still coherent
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Builder-style seeding, for tests and benches.
    pub fn with_object(self, key: &str, data: Vec<u8>) -> Self {
        self.put_object(key, data);
        self
    }

    pub fn put_object(&self, key: &str, data: Vec<u8>) {
        self.lock().objects.insert(key.to_string(), data);
    }

    /// A copy of the stored object, if any.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().objects.get(key).cloned()
    }

    /// How many multipart uploads were started and neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }
}

#[async_trait]
impl Transport for InMemoryStore {
    async fn object_size(&self, key: &str) -> TransferResult<u64> {
        self.lock()
            .objects
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| no_such_key(key))
    }

    async fn key_exists(&self, key: &str) -> TransferResult<bool> {
        Ok(self.lock().objects.contains_key(key))
    }

    async fn list_objects(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>> {
        let state = self.lock();
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, data)| !data.is_empty())
            .map(|(key, data)| ObjectSummary {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn get_object_range(&self, key: &str, range: Range) -> TransferResult<Vec<u8>> {
        let state = self.lock();
        let data = state.objects.get(key).ok_or_else(|| no_such_key(key))?;
        let size = data.len() as u64;
        if range.offset >= size {
            return Err(TransferError::Remote {
                status: 416,
                code: "InvalidRange".into(),
                message: format!("range starts at {} but '{key}' is {size} bytes", range.offset),
            });
        }
        // -- clamp at the end of the object, same as a real ranged GET
        let end = range.end().min(size);
        Ok(data[range.offset as usize..end as usize].to_vec())
    }

    async fn get_upload_id(&self, key: &str) -> TransferResult<String> {
        let mut state = self.lock();
        state.next_upload_id += 1;
        let upload_id = format!("mem-upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        debug!("🎟️ in-memory upload {upload_id} started for '{key}'");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u64,
        data: Vec<u8>,
    ) -> TransferResult<String> {
        if part_number == 0 || part_number > MAX_PART_NUMBER {
            return Err(bad_request(
                "InvalidArgument",
                format!("part number must be within 1..={MAX_PART_NUMBER}, got {part_number}"),
            ));
        }
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let etag = etag_for(&data);
        upload.parts.insert(
            part_number,
            UploadedPart {
                etag: etag.clone(),
                data,
            },
        );
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransferResult<()> {
        let mut state = self.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|upload| upload.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        if parts.is_empty() {
            return Err(bad_request(
                "MalformedXML",
                "a completion needs at least one part".into(),
            ));
        }
        if parts.windows(2).any(|pair| pair[0].part_number >= pair[1].part_number) {
            return Err(bad_request(
                "InvalidPartOrder",
                "parts must be listed in ascending part-number order".into(),
            ));
        }

        let mut assembled = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some(stored) if stored.etag == part.etag => {
                    assembled.extend_from_slice(&stored.data)
                }
                _ => {
                    return Err(bad_request(
                        "InvalidPart",
                        format!("part {} is missing or its etag does not match", part.part_number),
                    ));
                }
            }
        }

        state.uploads.remove(upload_id);
        debug!(
            "✅ in-memory upload {upload_id} completed: {} parts, {} bytes into '{key}'",
            parts.len(),
            assembled.len()
        );
        state.objects.insert(key.to_string(), assembled);
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransferResult<()> {
        let mut state = self.lock();
        match state.uploads.get(upload_id) {
            Some(upload) if upload.key == key => {
                state.uploads.remove(upload_id);
                debug!("🗑️ in-memory upload {upload_id} aborted");
                Ok(())
            }
            _ => Err(no_such_upload(upload_id)),
        }
    }
}
