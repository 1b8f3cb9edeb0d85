//! 🎬 ScriptedTransport: an `InMemoryStore` with a director's chair.
//!
//! Tests tell it which range should blow up, which part should fail, how slow
//! each upload should be, and afterwards ask it what happened: how many uploads
//! overlapped at the worst moment, which part orders reached completion, how
//! many times somebody pulled the abort cord.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{TransferError, TransferResult};
use crate::reader::Range;
use crate::transport::{CompletedPart, InMemoryStore, ObjectSummary, Transport};

/// Counts itself in on creation and out on drop, so a cancelled future still clocks out.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: Option<&AtomicUsize>) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(peak) = peak {
            peak.fetch_max(now, Ordering::SeqCst);
        }
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    store: InMemoryStore,
    range_failures: HashMap<u64, TransferError>,
    range_truncations: HashMap<u64, u64>,
    part_failures: HashMap<u64, TransferError>,
    upload_id_failure: Option<TransferError>,
    fetch_delay: Duration,
    upload_delay: Option<fn(u64) -> Duration>,
    fetches_in_flight: AtomicUsize,
    uploads_in_flight: AtomicUsize,
    peak_uploads: AtomicUsize,
    uploaded_parts: Mutex<Vec<u64>>,
    completions: Mutex<Vec<Vec<u64>>>,
    aborts: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_object(self, key: &str, data: Vec<u8>) -> Self {
        self.store.put_object(key, data);
        self
    }

    /// The range starting at `offset` fails with `error`.
    pub(crate) fn fail_range_at(mut self, offset: u64, error: TransferError) -> Self {
        self.range_failures.insert(offset, error);
        self
    }

    /// The range starting at `offset` comes back `missing` bytes short.
    pub(crate) fn truncate_range_at(mut self, offset: u64, missing: u64) -> Self {
        self.range_truncations.insert(offset, missing);
        self
    }

    pub(crate) fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub(crate) fn fail_part(mut self, part_number: u64, error: TransferError) -> Self {
        self.part_failures.insert(part_number, error);
        self
    }

    /// How long the upload of each part number takes.
    pub(crate) fn upload_delay(mut self, delay: fn(u64) -> Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    pub(crate) fn fail_upload_id(mut self, error: TransferError) -> Self {
        self.upload_id_failure = Some(error);
        self
    }

    pub(crate) fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub(crate) fn fetches_in_flight(&self) -> usize {
        self.fetches_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn uploads_in_flight(&self) -> usize {
        self.uploads_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn peak_uploads(&self) -> usize {
        self.peak_uploads.load(Ordering::SeqCst)
    }

    /// Part numbers in the order their uploads finished.
    pub(crate) fn uploaded_parts(&self) -> Vec<u64> {
        locked(&self.uploaded_parts).clone()
    }

    /// Part-number sequences of every completion request, in call order.
    pub(crate) fn completions(&self) -> Vec<Vec<u64>> {
        locked(&self.completions).clone()
    }

    pub(crate) fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn object_size(&self, key: &str) -> TransferResult<u64> {
        self.store.object_size(key).await
    }

    async fn key_exists(&self, key: &str) -> TransferResult<bool> {
        self.store.key_exists(key).await
    }

    async fn list_objects(&self, prefix: &str) -> TransferResult<Vec<ObjectSummary>> {
        self.store.list_objects(prefix).await
    }

    async fn get_object_range(&self, key: &str, range: Range) -> TransferResult<Vec<u8>> {
        let _in_flight = InFlight::enter(&self.fetches_in_flight, None);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if let Some(error) = self.range_failures.get(&range.offset) {
            return Err(error.clone());
        }
        let mut data = self.store.get_object_range(key, range).await?;
        if let Some(missing) = self.range_truncations.get(&range.offset) {
            let keep = data.len().saturating_sub(*missing as usize);
            data.truncate(keep);
        }
        Ok(data)
    }

    async fn get_upload_id(&self, key: &str) -> TransferResult<String> {
        if let Some(error) = &self.upload_id_failure {
            return Err(error.clone());
        }
        self.store.get_upload_id(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u64,
        data: Vec<u8>,
    ) -> TransferResult<String> {
        let _in_flight = InFlight::enter(&self.uploads_in_flight, Some(&self.peak_uploads));
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay(part_number)).await;
        }
        if let Some(error) = self.part_failures.get(&part_number) {
            return Err(error.clone());
        }
        let etag = self
            .store
            .upload_part(key, upload_id, part_number, data)
            .await?;
        locked(&self.uploaded_parts).push(part_number);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransferResult<()> {
        locked(&self.completions).push(parts.iter().map(|part| part.part_number).collect());
        self.store.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransferResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.store.abort_upload(key, upload_id).await
    }
}
