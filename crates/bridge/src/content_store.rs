//! Content-addressed blob storage for gradients and model weights

use async_trait::async_trait;
use dashmap::DashMap;
use fedchain_types::ContentRef;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("content {0} not found")]
    NotFound(ContentRef),

    #[error("content store request timed out")]
    Timeout,

    #[error("content store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}

/// Blob storage keyed by content reference
///
/// Implementations must be content-addressed: storing the same bytes twice
/// yields the same reference.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef, StoreError>;

    async fn get(&self, reference: &ContentRef) -> Result<Arc<Vec<u8>>, StoreError>;
}

/// In-memory content store
///
/// Uses DashMap so participant uploads and coordinator fetches can run
/// concurrently.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: DashMap<ContentRef, Arc<Vec<u8>>>,
    /// Number of puts that stored a new blob
    uploads: AtomicU64,
    /// Next N gets fail with `Unavailable`
    failing_gets: AtomicU32,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs stored
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn contains(&self, reference: &ContentRef) -> bool {
        self.blobs.contains_key(reference)
    }

    /// Number of puts that actually stored new content
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Drop a blob (simulates unpinned content)
    pub fn remove(&self, reference: &ContentRef) -> bool {
        self.blobs.remove(reference).is_some()
    }

    /// Make the next `count` gets fail with a transient error
    pub fn inject_get_failures(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, data: Vec<u8>) -> Result<ContentRef, StoreError> {
        let reference = ContentRef::for_bytes(&data);
        if !self.blobs.contains_key(&reference) {
            self.blobs
                .entry(reference.clone())
                .or_insert_with(|| {
                    self.uploads.fetch_add(1, Ordering::SeqCst);
                    Arc::new(data)
                });
        }
        Ok(reference)
    }

    async fn get(&self, reference: &ContentRef) -> Result<Arc<Vec<u8>>, StoreError> {
        let injected = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        self.blobs
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }
}
