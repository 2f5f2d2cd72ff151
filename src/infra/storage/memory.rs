//! Concurrent in-memory storage with access counters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::application::backends::{BackendError, StorageBackend, checked_path};
use crate::domain::Fingerprint;

#[derive(Debug)]
pub struct MemoryStorage {
    name: &'static str,
    objects: DashMap<String, Bytes>,
    reads: DashMap<String, usize>,
    total_reads: AtomicUsize,
    writes: AtomicUsize,
    available: AtomicBool,
}

impl MemoryStorage {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            objects: DashMap::new(),
            reads: DashMap::new(),
            total_reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_object(self, path: &str, bytes: impl Into<Bytes>) -> Self {
        self.insert(path, bytes);
        self
    }

    /// Seed an object without counting it as a write.
    pub fn insert(&self, path: &str, bytes: impl Into<Bytes>) {
        self.objects
            .insert(path.trim_start_matches('/').to_string(), bytes.into());
    }

    pub fn remove(&self, path: &str) {
        self.objects.remove(path.trim_start_matches('/'));
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path.trim_start_matches('/'))
    }

    /// Simulate an outage: every operation fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reads_of(&self, path: &str) -> usize {
        self.reads
            .get(path.trim_start_matches('/'))
            .map(|count| *count)
            .unwrap_or_default()
    }

    pub fn total_reads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), BackendError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::unavailable(self.name, "offline"))
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn read(&self, path: &str) -> Result<Option<Bytes>, BackendError> {
        self.ensure_available()?;
        let path = checked_path(path)?;
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        *self.reads.entry(path.to_string()).or_default() += 1;
        Ok(self.objects.get(path).map(|entry| entry.value().clone()))
    }

    async fn stat(&self, path: &str) -> Result<Option<Fingerprint>, BackendError> {
        self.ensure_available()?;
        let path = checked_path(path)?;
        Ok(self
            .objects
            .get(path)
            .map(|entry| Fingerprint::of_content(entry.value())))
    }

    async fn write(&self, path: &str, bytes: Bytes) -> Result<(), BackendError> {
        self.ensure_available()?;
        let path = checked_path(path)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(path.to_string(), bytes);
        Ok(())
    }
}
