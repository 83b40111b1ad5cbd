//! Optional workspace capabilities.
//!
//! Capabilities are injected at construction and exposed through narrow
//! interfaces; a workspace without them behaves identically except for the
//! missing feature. In-memory implementations back tests and local use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Binary attachment storage keyed by minted ids.
pub trait BlobStore: Send + Sync {
    /// Store a blob and return its key.
    fn put(&self, bytes: Vec<u8>) -> String;
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> bool;
}

/// Full-text lookup over document content.
pub trait DocIndexer: Send + Sync {
    fn index(&self, doc_id: &str, text: &str);
    fn search(&self, query: &str) -> Vec<String>;
    fn evict(&self, doc_id: &str);
}

/// Process-local blob storage.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, bytes: Vec<u8>) -> String {
        let key = Uuid::new_v4().to_string();
        self.blobs.lock().unwrap().insert(key.clone(), bytes);
        key
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    fn delete(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().remove(key).is_some()
    }
}

/// Naive substring indexer, sufficient for tests and small workspaces.
#[derive(Default)]
pub struct MemoryIndexer {
    texts: Mutex<HashMap<String, String>>,
}

impl MemoryIndexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DocIndexer for MemoryIndexer {
    fn index(&self, doc_id: &str, text: &str) {
        self.texts
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), text.to_lowercase());
    }

    fn search(&self, query: &str) -> Vec<String> {
        let needle = query.to_lowercase();
        let texts = self.texts.lock().unwrap();
        let mut hits: Vec<String> = texts
            .iter()
            .filter(|(_, text)| text.contains(&needle))
            .map(|(id, _)| id.clone())
            .collect();
        hits.sort();
        hits
    }

    fn evict(&self, doc_id: &str) {
        self.texts.lock().unwrap().remove(doc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let blobs = MemoryBlobStore::new();
        let key = blobs.put(vec![1, 2, 3]);
        assert_eq!(blobs.get(&key), Some(vec![1, 2, 3]));
        assert!(blobs.delete(&key));
        assert!(!blobs.delete(&key));
        assert!(blobs.get(&key).is_none());
    }

    #[test]
    fn test_indexer_search_and_evict() {
        let indexer = MemoryIndexer::new();
        indexer.index("d1", "The quick brown fox");
        indexer.index("d2", "lazy dog");

        assert_eq!(indexer.search("QUICK"), vec!["d1".to_string()]);
        assert!(indexer.search("cat").is_empty());

        indexer.evict("d1");
        assert!(indexer.search("quick").is_empty());
    }
}
