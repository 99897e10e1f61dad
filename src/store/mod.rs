//! Object store abstraction
//!
//! The store is a versioned document store with optimistic concurrency: every
//! write bumps `metadata.resourceVersion`, and updates succeed only if the
//! caller's expected version still matches. Conflicts are returned to the
//! caller, never retried here.

mod kubernetes;
mod memory;

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::document::{Document, ObjectKey};
use crate::Error;

pub use self::kubernetes::{build_api_resource, KubeObjectStore};
pub use self::memory::InMemoryStore;

/// Trait abstracting the object store
///
/// This trait allows the reconcilers to run against the Kubernetes API in
/// production and against an in-memory store (or a mock) in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one object; [`Error::NotFound`] if absent
    async fn get(&self, key: &ObjectKey) -> Result<Document, Error>;

    /// List objects of a kind in a namespace whose labels include `labels`
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, Error>;

    /// Create an object; [`Error::AlreadyExists`] on collision
    async fn create(&self, doc: &Document) -> Result<Document, Error>;

    /// Replace an object if its version still equals `expected_version`;
    /// [`Error::Conflict`] otherwise. Status is left as stored.
    async fn update(&self, doc: &Document, expected_version: &str) -> Result<Document, Error>;

    /// Replace only the status of an object, conditioned like [`ObjectStore::update`]
    async fn update_status(
        &self,
        doc: &Document,
        expected_version: &str,
    ) -> Result<Document, Error>;

    /// Delete an object; [`Error::NotFound`] if absent
    async fn delete(&self, key: &ObjectKey) -> Result<(), Error>;
}

/// Store handle bound to one reconcile pass's cancellation token.
///
/// Every call races the token; once cancelled, calls return
/// [`Error::Cancelled`] without waiting for the store.
#[derive(Clone, Copy)]
pub struct ScopedStore<'a> {
    store: &'a dyn ObjectStore,
    cancel: &'a CancellationToken,
}

impl<'a> ScopedStore<'a> {
    /// Bind `store` to `cancel`
    pub fn new(store: &'a dyn ObjectStore, cancel: &'a CancellationToken) -> Self {
        Self { store, cancel }
    }

    /// The cancellation token of this pass
    pub fn cancel_token(&self) -> &CancellationToken {
        self.cancel
    }

    /// Run any future under this pass's cancellation
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    /// See [`ObjectStore::get`]
    pub async fn get(&self, key: &ObjectKey) -> Result<Document, Error> {
        self.guard(self.store.get(key)).await
    }

    /// Like [`ScopedStore::get`], mapping absence to `None`
    pub async fn get_optional(&self, key: &ObjectKey) -> Result<Option<Document>, Error> {
        match self.get(key).await {
            Ok(doc) => Ok(Some(doc)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// See [`ObjectStore::list`]
    pub async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, Error> {
        self.guard(self.store.list(api_version, kind, namespace, labels))
            .await
    }

    /// See [`ObjectStore::create`]
    pub async fn create(&self, doc: &Document) -> Result<Document, Error> {
        self.guard(self.store.create(doc)).await
    }

    /// See [`ObjectStore::update`]
    pub async fn update(&self, doc: &Document, expected_version: &str) -> Result<Document, Error> {
        self.guard(self.store.update(doc, expected_version)).await
    }

    /// See [`ObjectStore::update_status`]
    pub async fn update_status(
        &self,
        doc: &Document,
        expected_version: &str,
    ) -> Result<Document, Error> {
        self.guard(self.store.update_status(doc, expected_version))
            .await
    }

    /// See [`ObjectStore::delete`]
    pub async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        self.guard(self.store.delete(key)).await
    }
}
