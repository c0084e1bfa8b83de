//! In-memory repository.

use crate::{ObjectId, ObjectStore, RawObject, RefStore, Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Thread-safe repository kept entirely in memory.
///
/// Objects are stored in their loose encoding, keyed by id. Refs are kept
/// sorted so listings are deterministic.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    objects: RwLock<HashMap<ObjectId, Bytes>>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
    metadata: RwLock<HashMap<String, Bytes>>,
}

impl MemoryRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its id.
    pub fn insert(&self, object: &RawObject) -> ObjectId {
        let id = object.id();
        self.objects.write().insert(id, object.encode());
        id
    }

    /// Points a ref at an object without going through the async trait.
    pub fn insert_ref(&self, name: &str, id: ObjectId) {
        self.refs.write().insert(name.to_string(), id);
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Retrieves and decodes an object.
    pub fn object(&self, id: &ObjectId) -> Result<Option<RawObject>> {
        self.objects
            .read()
            .get(id)
            .map(|raw| RawObject::decode(raw))
            .transpose()
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the store holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Lists all object ids.
    pub fn list_objects(&self) -> Vec<ObjectId> {
        self.objects.read().keys().copied().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryRepository {
    async fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.contains(id))
    }

    async fn save_raw(&self, id: &ObjectId, body: Bytes) -> Result<()> {
        let actual = ObjectId::hash_raw(&body);
        if actual != *id {
            return Err(StorageError::Corruption(format!(
                "object {} hashes to {}",
                id, actual
            )));
        }
        self.objects.write().entry(*id).or_insert(body);
        Ok(())
    }

    async fn load_raw(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        Ok(self.objects.read().get(id).cloned())
    }

    async fn load_metadata(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.metadata.read().get(key).cloned())
    }

    async fn save_metadata(&self, key: &str, contents: Bytes) -> Result<()> {
        self.metadata.write().insert(key.to_string(), contents);
        Ok(())
    }
}

#[async_trait]
impl RefStore for MemoryRepository {
    async fn list_refs(&self) -> Result<Vec<String>> {
        Ok(self.refs.read().keys().cloned().collect())
    }

    async fn get_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        Ok(self.refs.read().get(name).copied())
    }

    async fn set_ref(&self, name: &str, id: ObjectId) -> Result<()> {
        self.insert_ref(name, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_roundtrip() {
        let repo = MemoryRepository::new();
        let blob = RawObject::blob(b"Hello, World!".to_vec());
        let id = blob.id();

        assert!(!repo.has_object(&id).await.unwrap());
        repo.save_raw(&id, blob.encode()).await.unwrap();
        assert!(repo.has_object(&id).await.unwrap());

        let loaded = repo.load_raw(&id).await.unwrap().unwrap();
        assert_eq!(RawObject::decode(&loaded).unwrap(), blob);
        assert_eq!(repo.object(&id).unwrap(), Some(blob));
    }

    #[tokio::test]
    async fn test_save_raw_is_idempotent() {
        let repo = MemoryRepository::new();
        let blob = RawObject::blob(b"same".to_vec());
        let id = blob.id();

        repo.save_raw(&id, blob.encode()).await.unwrap();
        repo.save_raw(&id, blob.encode()).await.unwrap();
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_save_raw_rejects_wrong_id() {
        let repo = MemoryRepository::new();
        let blob = RawObject::blob(b"content".to_vec());
        let wrong = ObjectId::from_bytes([9u8; 20]);

        let result = repo.save_raw(&wrong, blob.encode()).await;
        assert!(matches!(result, Err(StorageError::Corruption(_))));
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_refs_are_sorted() {
        let repo = MemoryRepository::new();
        let id = ObjectId::from_bytes([1u8; 20]);

        repo.set_ref("refs/remotes/origin/main", id).await.unwrap();
        repo.set_ref("refs/heads/feature", id).await.unwrap();

        assert_eq!(
            repo.list_refs().await.unwrap(),
            vec!["refs/heads/feature", "refs/remotes/origin/main"]
        );
        assert_eq!(repo.get_ref("refs/heads/feature").await.unwrap(), Some(id));
        assert_eq!(repo.get_ref("refs/heads/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metadata() {
        let repo = MemoryRepository::new();
        assert!(repo.load_metadata("shallow").await.unwrap().is_none());

        repo.save_metadata("shallow", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(
            repo.load_metadata("shallow").await.unwrap().unwrap().as_ref(),
            b"abc"
        );
    }
}
