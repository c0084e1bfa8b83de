//! Store traits.
//!
//! The fetch client is written against these capabilities rather than a
//! concrete repository type, so any backend that can answer object presence,
//! accept raw object writes and read/update refs can be fetched into.

use crate::{ObjectId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Content-addressed raw object storage plus small metadata blobs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Checks if an object exists.
    async fn has_object(&self, id: &ObjectId) -> Result<bool>;

    /// Stores an object's loose encoding under its id.
    ///
    /// Saving an id that already exists is a no-op.
    async fn save_raw(&self, id: &ObjectId, body: Bytes) -> Result<()>;

    /// Loads an object's loose encoding.
    async fn load_raw(&self, id: &ObjectId) -> Result<Option<Bytes>>;

    /// Loads a metadata blob such as `shallow`.
    async fn load_metadata(&self, key: &str) -> Result<Option<Bytes>>;

    /// Replaces a metadata blob.
    async fn save_metadata(&self, key: &str, contents: Bytes) -> Result<()>;
}

/// Named references to objects.
#[async_trait]
pub trait RefStore: Send + Sync {
    /// Lists all ref names.
    async fn list_refs(&self) -> Result<Vec<String>>;

    /// Resolves a ref to the object it points at.
    async fn get_ref(&self, name: &str) -> Result<Option<ObjectId>>;

    /// Points a ref at an object, creating it if needed.
    async fn set_ref(&self, name: &str, id: ObjectId) -> Result<()>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn has_object(&self, id: &ObjectId) -> Result<bool> {
        (**self).has_object(id).await
    }

    async fn save_raw(&self, id: &ObjectId, body: Bytes) -> Result<()> {
        (**self).save_raw(id, body).await
    }

    async fn load_raw(&self, id: &ObjectId) -> Result<Option<Bytes>> {
        (**self).load_raw(id).await
    }

    async fn load_metadata(&self, key: &str) -> Result<Option<Bytes>> {
        (**self).load_metadata(key).await
    }

    async fn save_metadata(&self, key: &str, contents: Bytes) -> Result<()> {
        (**self).save_metadata(key, contents).await
    }
}

#[async_trait]
impl<T: RefStore + ?Sized> RefStore for Arc<T> {
    async fn list_refs(&self) -> Result<Vec<String>> {
        (**self).list_refs().await
    }

    async fn get_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        (**self).get_ref(name).await
    }

    async fn set_ref(&self, name: &str, id: ObjectId) -> Result<()> {
        (**self).set_ref(name, id).await
    }
}
