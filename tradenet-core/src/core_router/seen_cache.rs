//! Bounded memory of envelopes already handled, for loop prevention

use hashlink::LruCache;
use tokio::sync::Mutex;

pub struct SeenCache {
    entries: Mutex<LruCache<[u8; 32], ()>>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity.max(1))),
        }
    }

    /// Remember a digest. Returns false if it was already present.
    pub async fn insert(&self, digest: [u8; 32]) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&digest) {
            return false;
        }
        entries.insert(digest, ());
        true
    }

    pub async fn contains(&self, digest: &[u8; 32]) -> bool {
        self.entries.lock().await.contains_key(digest)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_insert_wins() {
        let cache = SeenCache::new(10);
        assert!(cache.insert([1; 32]).await);
        assert!(!cache.insert([1; 32]).await);
        assert!(cache.contains(&[1; 32]).await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = SeenCache::new(3);
        for n in 0..4u8 {
            cache.insert([n; 32]).await;
        }

        assert_eq!(cache.len().await, 3);
        assert!(!cache.contains(&[0; 32]).await);
        assert!(cache.contains(&[3; 32]).await);
    }
}
