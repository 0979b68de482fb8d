//! Hierarchical encrypted-path index.
//!
//! Directory paths are encrypted with a keyed hash: the full path maps to one
//! 32-byte key and each component maps to a chained segment digest, so a
//! segment can only be recomputed with the whole prefix. A path-segment Bloom
//! filter screens lookups before the hierarchy walk, and resolved manifests
//! sit in a TTL-bounded LRU cache.
//!
//! Hierarchy nodes live in an arena table keyed by encrypted segment;
//! children are key lists and the parent is an optional key, so the graph
//! has no raw back-pointers.

use lru::LruCache;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::bloom::SaltedBloom;
use crate::error::{Result, SearchError};
use crate::store::{BlockStore, MemoryPool};
use crate::types::{BloomConfig, ManifestConfig};

/// Encrypted path or segment digest.
pub type SegmentKey = [u8; 32];

// ---------------------------------------------------------------------------
// Path encryption
// ---------------------------------------------------------------------------

/// Deterministic, salt-free keyed path encryption. One key per index
/// instance; the same path always encrypts to the same bytes.
pub struct PathCipher {
    key: [u8; 32],
}

impl PathCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Primary path digest: SHA-256(key || path).
    pub fn encrypt_path(&self, path: &str) -> SegmentKey {
        let mut h = Sha256::new();
        h.update(self.key);
        h.update(path.as_bytes());
        h.finalize().into()
    }

    /// Normalized path components (empty segments collapsed).
    pub fn components(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    /// Chained segment digests: segment_i = SHA-256(key || component_i ||
    /// i_be64 || segment_{i-1}), with an empty zeroth predecessor.
    pub fn segments(&self, path: &str) -> Vec<SegmentKey> {
        let mut segments = Vec::new();
        let mut prev: Vec<u8> = Vec::new();
        for (i, component) in Self::components(path).iter().enumerate() {
            let mut h = Sha256::new();
            h.update(self.key);
            h.update(component.as_bytes());
            h.update((i as u64).to_be_bytes());
            h.update(&prev);
            let seg: SegmentKey = h.finalize().into();
            prev = seg.to_vec();
            segments.push(seg);
        }
        segments
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

/// One directory level in the encrypted hierarchy.
pub struct HierarchyNode {
    pub segment: SegmentKey,
    pub depth: usize,
    pub children: Vec<SegmentKey>,
    pub parent: Option<SegmentKey>,
    /// CIDs of manifests recorded at this node.
    pub manifest_cids: Vec<String>,
    pub access_count: u64,
    pub last_accessed: Instant,
}

#[derive(Default)]
struct Hierarchy {
    nodes: HashMap<SegmentKey, HierarchyNode>,
    roots: Vec<SegmentKey>,
    node_counter: u64,
}

impl Hierarchy {
    /// Create nodes for every segment of the path on demand, maintaining
    /// parent/child keys and de-duplicating siblings.
    fn insert_path(&mut self, segments: &[SegmentKey]) {
        let mut parent: Option<SegmentKey> = None;
        for (depth, seg) in segments.iter().enumerate() {
            if !self.nodes.contains_key(seg) {
                self.nodes.insert(
                    *seg,
                    HierarchyNode {
                        segment: *seg,
                        depth,
                        children: Vec::new(),
                        parent,
                        manifest_cids: Vec::new(),
                        access_count: 0,
                        last_accessed: Instant::now(),
                    },
                );
                self.node_counter += 1;
                match parent {
                    None => {
                        if !self.roots.contains(seg) {
                            self.roots.push(*seg);
                        }
                    }
                    Some(p) => {
                        let parent_node =
                            self.nodes.get_mut(&p).expect("parent inserted earlier in this walk");
                        if !parent_node.children.contains(seg) {
                            parent_node.children.push(*seg);
                        }
                    }
                }
            }
            parent = Some(*seg);
        }
    }

    /// Walk root to leaf along the segment chain. Returns the leaf node.
    fn walk<'a>(&'a self, segments: &[SegmentKey]) -> Option<&'a HierarchyNode> {
        let (first, rest) = segments.split_first()?;
        if !self.roots.contains(first) {
            return None;
        }
        let mut node = self.nodes.get(first)?;
        for seg in rest {
            if !node.children.contains(seg) {
                return None;
            }
            node = self.nodes.get(seg)?;
        }
        Some(node)
    }

    fn touch(&mut self, segment: &SegmentKey) {
        if let Some(node) = self.nodes.get_mut(segment) {
            node.access_count += 1;
            node.last_accessed = Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest cache
// ---------------------------------------------------------------------------

struct CacheEntry {
    data: Vec<u8>,
    created: Instant,
    access_count: u64,
}

/// TTL-bounded LRU over resolved manifests. Reads mutate recency, so both
/// paths take the exclusive lock.
struct ManifestCache {
    entries: Mutex<LruCache<SegmentKey, CacheEntry>>,
    ttl: Duration,
}

impl ManifestCache {
    fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is nonzero");
        Self { entries: Mutex::new(LruCache::new(cap)), ttl }
    }

    fn get(&self, key: &SegmentKey) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired = match entries.get_mut(key) {
            None => return None,
            Some(entry) => {
                if entry.created.elapsed() <= self.ttl {
                    entry.access_count += 1;
                    return Some(entry.data.clone());
                }
                true
            }
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    fn set(&self, key: SegmentKey, data: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.put(key, CacheEntry { data, created: Instant::now(), access_count: 0 });
    }

    fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<SegmentKey> = entries
            .iter()
            .filter(|(_, e)| e.created.elapsed() > self.ttl)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

// ---------------------------------------------------------------------------
// Manifest index
// ---------------------------------------------------------------------------

/// A filename tag resolved from a directory manifest blob.
#[derive(Clone, Debug)]
pub struct ManifestMatch {
    pub file_id: String,
    pub filename: String,
    pub relevance: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ManifestIndexStats {
    pub nodes: u64,
    pub roots: usize,
    pub cached_manifests: usize,
    pub filter_set_bits: u64,
}

/// Encrypted directory index: path filter + hierarchy + manifest cache.
pub struct ManifestIndex {
    cipher: PathCipher,
    path_filter: SaltedBloom,
    hierarchy: Option<RwLock<Hierarchy>>,
    cache: ManifestCache,
    store: Arc<dyn BlockStore>,
    pool: Arc<dyn MemoryPool>,
}

impl ManifestIndex {
    pub fn new(
        cfg: &ManifestConfig,
        bloom: &BloomConfig,
        store: Arc<dyn BlockStore>,
        pool: Arc<dyn MemoryPool>,
    ) -> Result<Self> {
        let key = match &cfg.path_key {
            Some(hex_key) => {
                let bytes = hex::decode(hex_key)
                    .map_err(|e| SearchError::Internal(format!("bad path_key hex: {e}")))?;
                bytes.try_into().map_err(|_| {
                    SearchError::Internal("path_key must decode to 32 bytes".into())
                })?
            }
            None => {
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                key
            }
        };
        Ok(Self {
            cipher: PathCipher::new(key),
            path_filter: SaltedBloom::new(
                bloom.expected_items,
                0.5 * bloom.false_positive_rate,
                bloom.privacy_level,
            )?,
            hierarchy: cfg.hierarchy_enabled.then(|| RwLock::new(Hierarchy::default())),
            cache: ManifestCache::new(cfg.cache_max_entries, Duration::from_secs(cfg.cache_ttl_secs)),
            store,
            pool,
        })
    }

    /// Index a directory: encrypt, register every segment with the path
    /// filter, update the hierarchy, store the manifest blob, and cache it.
    pub fn index_directory(&self, path: &str, manifest: &[u8]) -> Result<()> {
        if path.trim().is_empty() {
            return Err(SearchError::InvalidQuery("empty directory path".into()));
        }
        let enc_path = self.cipher.encrypt_path(path);
        let segments = self.cipher.segments(path);

        self.path_filter.add(&enc_path)?;
        for seg in &segments {
            self.path_filter.add(seg)?;
        }

        let cid = self.store.put(manifest)?;

        if let Some(hierarchy) = &self.hierarchy {
            let mut h = hierarchy.write().map_err(|_| lock_poisoned())?;
            h.insert_path(&segments);
            if let Some(leaf) = segments.last() {
                let node = h.nodes.get_mut(leaf).expect("leaf inserted above");
                if !node.manifest_cids.contains(&cid) {
                    node.manifest_cids.push(cid.clone());
                }
            }
        }

        let mut buf = self.pool.get_byte_buffer(manifest.len());
        buf.extend_from_slice(manifest);
        self.cache.set(enc_path, buf);
        Ok(())
    }

    /// Resolve a directory's manifest. Cache first, then the path-filter
    /// screen (any absent segment is a definite miss), then the hierarchy
    /// walk.
    pub fn lookup_directory(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let enc_path = self.cipher.encrypt_path(path);
        if let Some(data) = self.cache.get(&enc_path) {
            return Ok(Some(data));
        }

        let segments = self.cipher.segments(path);
        if segments.is_empty() {
            return Ok(None);
        }
        for seg in &segments {
            if !self.path_filter.contains(seg)? {
                return Ok(None);
            }
        }

        let Some(hierarchy) = &self.hierarchy else { return Ok(None) };
        let cid = {
            let h = hierarchy.read().map_err(|_| lock_poisoned())?;
            match h.walk(&segments) {
                Some(leaf) => leaf.manifest_cids.last().cloned(),
                None => None,
            }
        };
        if cid.is_some() {
            let mut h = hierarchy.write().map_err(|_| lock_poisoned())?;
            if let Some(leaf) = segments.last() {
                h.touch(leaf);
            }
        }

        match cid {
            Some(cid) => {
                let data = self.store.get(&cid)?;
                self.cache.set(enc_path, data.clone());
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Scan recorded manifest tags for filename terms. Tag blobs have the
    /// shape `filename:file_id`; relevance is the matched-term fraction.
    pub fn search_tags(&self, terms: &[String], max_results: usize) -> Result<Vec<ManifestMatch>> {
        let Some(hierarchy) = &self.hierarchy else { return Ok(Vec::new()) };
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let cids: Vec<String> = {
            let h = hierarchy.read().map_err(|_| lock_poisoned())?;
            h.nodes.values().flat_map(|n| n.manifest_cids.iter().cloned()).collect()
        };

        let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let mut matches = Vec::new();
        for cid in cids {
            let blob = self.store.get(&cid)?;
            let Ok(text) = std::str::from_utf8(&blob) else { continue };
            // The ID follows the last colon, so filenames may contain one.
            let Some((filename, file_id)) = text.rsplit_once(':') else { continue };
            let filename_lower = filename.to_lowercase();
            let matched = lowered.iter().filter(|t| filename_lower.contains(t.as_str())).count();
            if matched > 0 {
                matches.push(ManifestMatch {
                    file_id: file_id.to_string(),
                    filename: filename.to_string(),
                    relevance: matched as f64 / lowered.len() as f64,
                });
                if matches.len() >= max_results {
                    break;
                }
            }
        }
        Ok(matches)
    }

    /// Expose the cipher for callers that need the same path transformation.
    pub fn cipher(&self) -> &PathCipher {
        &self.cipher
    }

    /// Purge expired cache entries.
    pub fn maintenance(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn stats(&self) -> ManifestIndexStats {
        let (nodes, roots) = match &self.hierarchy {
            Some(h) => {
                let h = h.read().unwrap_or_else(|p| p.into_inner());
                (h.node_counter, h.roots.len())
            }
            None => (0, 0),
        };
        ManifestIndexStats {
            nodes,
            roots,
            cached_manifests: self.cache.len(),
            filter_set_bits: self.path_filter.stats().set_bits,
        }
    }
}

fn lock_poisoned() -> SearchError {
    SearchError::Internal("manifest index lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BufferPool, MemoryBlockStore};

    fn index() -> ManifestIndex {
        let cfg = ManifestConfig {
            path_key: Some(hex::encode([9u8; 32])),
            ..ManifestConfig::default()
        };
        ManifestIndex::new(
            &cfg,
            &BloomConfig { expected_items: 1000, ..BloomConfig::default() },
            Arc::new(MemoryBlockStore::new()),
            Arc::new(BufferPool::new(16)),
        )
        .unwrap()
    }

    #[test]
    fn path_encryption_is_deterministic() {
        let cipher = PathCipher::new([1u8; 32]);
        assert_eq!(cipher.encrypt_path("/home/user/docs"), cipher.encrypt_path("/home/user/docs"));
        assert_eq!(cipher.segments("/home/user/docs"), cipher.segments("/home/user/docs"));
        assert_eq!(cipher.segments("/a/b/c").len(), 3);
    }

    #[test]
    fn segments_chain_on_prefix() {
        let cipher = PathCipher::new([1u8; 32]);
        let ab = cipher.segments("/a/b");
        let cb = cipher.segments("/c/b");
        // Same component at the same depth under a different parent differs.
        assert_ne!(ab[1], cb[1]);
        // Shared prefix produces identical leading segments.
        let abc = cipher.segments("/a/b/c");
        assert_eq!(ab[..2], abc[..2]);
    }

    #[test]
    fn index_then_lookup_roundtrip() {
        let index = index();
        index.index_directory("/home/user/documents", b"M1").unwrap();
        let found = index.lookup_directory("/home/user/documents").unwrap();
        assert_eq!(found.as_deref(), Some(b"M1".as_ref()));
        assert_eq!(index.lookup_directory("/nonexistent/path").unwrap(), None);
    }

    #[test]
    fn lookup_survives_cache_expiry_via_hierarchy() {
        let cfg = ManifestConfig {
            cache_ttl_secs: 0,
            path_key: Some(hex::encode([9u8; 32])),
            ..ManifestConfig::default()
        };
        let index = ManifestIndex::new(
            &cfg,
            &BloomConfig { expected_items: 1000, ..BloomConfig::default() },
            Arc::new(MemoryBlockStore::new()),
            Arc::new(BufferPool::new(16)),
        )
        .unwrap();
        index.index_directory("/a/b", b"deep").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Cache entry is expired; the hierarchy walk still resolves it.
        assert_eq!(index.lookup_directory("/a/b").unwrap().as_deref(), Some(b"deep".as_ref()));
    }

    #[test]
    fn sibling_directories_do_not_collide() {
        let index = index();
        index.index_directory("/srv/alpha", b"A").unwrap();
        index.index_directory("/srv/beta", b"B").unwrap();
        assert_eq!(index.lookup_directory("/srv/alpha").unwrap().as_deref(), Some(b"A".as_ref()));
        assert_eq!(index.lookup_directory("/srv/beta").unwrap().as_deref(), Some(b"B".as_ref()));
        let stats = index.stats();
        assert_eq!(stats.roots, 1);
        assert_eq!(stats.nodes, 3);
    }

    #[test]
    fn reindex_replaces_manifest() {
        let index = index();
        index.index_directory("/data", b"old").unwrap();
        index.index_directory("/data", b"new").unwrap();
        assert_eq!(index.lookup_directory("/data").unwrap().as_deref(), Some(b"new".as_ref()));
    }

    #[test]
    fn tag_search_finds_filenames() {
        let index = index();
        index.index_directory("/docs", b"quarterly_report.pdf:file-17").unwrap();
        index.index_directory("/pics", b"holiday.jpg:file-42").unwrap();

        let hits = index.search_tags(&["report".to_string()], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_id, "file-17");
        assert!(hits[0].relevance > 0.99);
    }

    #[test]
    fn maintenance_purges_expired_entries() {
        let cfg = ManifestConfig {
            cache_ttl_secs: 0,
            path_key: Some(hex::encode([9u8; 32])),
            ..ManifestConfig::default()
        };
        let index = ManifestIndex::new(
            &cfg,
            &BloomConfig { expected_items: 100, ..BloomConfig::default() },
            Arc::new(MemoryBlockStore::new()),
            Arc::new(BufferPool::new(16)),
        )
        .unwrap();
        index.index_directory("/tmp/a", b"x").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(index.maintenance(), 1);
        assert_eq!(index.stats().cached_manifests, 0);
    }
}
