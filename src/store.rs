//! Collaborator interfaces consumed by the core: the block store that holds
//! manifest blobs and an optional byte-buffer pool. Both are process-wide
//! services constructed once at startup and passed by reference.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Mutex;

use crate::error::{Result, SearchError};

// ---------------------------------------------------------------------------
// Block store
// ---------------------------------------------------------------------------

/// Opaque content-addressed block storage.
pub trait BlockStore: Send + Sync {
    /// Store a blob, returning its content ID.
    fn put(&self, bytes: &[u8]) -> Result<String>;
    /// Fetch a blob by content ID.
    fn get(&self, cid: &str) -> Result<Vec<u8>>;
}

/// In-memory block store used by the server binary and tests.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: DashMap<String, Vec<u8>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let cid = format!("bv1{}", hex::encode(Sha256::digest(bytes)));
        self.blocks.insert(cid.clone(), bytes.to_vec());
        Ok(cid)
    }

    fn get(&self, cid: &str) -> Result<Vec<u8>> {
        self.blocks
            .get(cid)
            .map(|b| b.clone())
            .ok_or_else(|| SearchError::Internal(format!("unknown block cid {cid}")))
    }
}

// ---------------------------------------------------------------------------
// Memory pool
// ---------------------------------------------------------------------------

/// Optional byte-buffer recycling service.
pub trait MemoryPool: Send + Sync {
    /// A buffer with at least `n` bytes of capacity, cleared.
    fn get_byte_buffer(&self, n: usize) -> Vec<u8>;
    /// Return a buffer for reuse.
    fn return_byte_buffer(&self, buf: Vec<u8>);
}

/// Bounded free-list pool.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self { free: Mutex::new(Vec::new()), max_pooled }
    }
}

impl MemoryPool for BufferPool {
    fn get_byte_buffer(&self, n: usize) -> Vec<u8> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        match free.iter().position(|b| b.capacity() >= n) {
            Some(i) => {
                let mut buf = free.swap_remove(i);
                buf.clear();
                buf
            }
            None => Vec::with_capacity(n),
        }
    }

    fn return_byte_buffer(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"manifest bytes").unwrap();
        assert!(cid.starts_with("bv1"));
        assert_eq!(store.get(&cid).unwrap(), b"manifest bytes");
    }

    #[test]
    fn identical_blobs_share_a_cid() {
        let store = MemoryBlockStore::new();
        let a = store.put(b"same").unwrap();
        let b = store.put(b"same").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_cid_errors() {
        let store = MemoryBlockStore::new();
        assert!(store.get("bv1missing").is_err());
    }

    #[test]
    fn pool_recycles_buffers() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get_byte_buffer(128);
        buf.extend_from_slice(b"scratch");
        pool.return_byte_buffer(buf);
        let again = pool.get_byte_buffer(64);
        assert!(again.is_empty());
        assert!(again.capacity() >= 64);
    }
}
