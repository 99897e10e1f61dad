//! In-memory versioned store
//!
//! Behaves like the API server for the operations the reconcilers use:
//! monotonically increasing resource versions, conditional updates, and a
//! status subresource that plain updates cannot change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::ObjectStore;
use crate::document::{Document, FieldPath, ObjectKey};
use crate::Error;

type StoreKey = (String, String, String);

fn store_key(kind: &str, namespace: &str, name: &str) -> StoreKey {
    (kind.to_string(), namespace.to_string(), name.to_string())
}

/// Versioned document store held in memory
#[derive(Default)]
pub struct InMemoryStore {
    objects: RwLock<BTreeMap<StoreKey, Document>>,
    version: AtomicU64,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, assigning a version and uid; existing objects are replaced
    pub fn insert(&self, mut doc: Document) -> Document {
        self.stamp(&mut doc, true);
        self.objects.write().insert(
            store_key(doc.kind(), doc.namespace(), doc.name()),
            doc.clone(),
        );
        doc
    }

    /// Read an object without going through the async trait
    pub fn snapshot(&self, kind: &str, namespace: &str, name: &str) -> Option<Document> {
        self.objects
            .read()
            .get(&store_key(kind, namespace, name))
            .cloned()
    }

    /// All objects of a kind
    pub fn objects_of_kind(&self, kind: &str) -> Vec<Document> {
        self.objects
            .read()
            .iter()
            .filter(|((k, _, _), _)| k == kind)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Number of successful writes (create, update, update_status, delete)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, doc: &mut Document, assign_uid: bool) {
        doc.set_resource_version(&self.next_version());
        if assign_uid && doc.uid().is_none() {
            doc.set(
                &FieldPath::parse("metadata.uid"),
                Value::from(uuid::Uuid::new_v4().to_string()),
            );
        }
    }

    fn conditional_replace(
        &self,
        doc: &Document,
        expected_version: &str,
        keep_from_stored: &[&str],
    ) -> Result<Document, Error> {
        let key = store_key(doc.kind(), doc.namespace(), doc.name());
        let mut objects = self.objects.write();
        let stored = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(doc.kind(), doc.namespace(), doc.name()))?;

        if stored.resource_version() != Some(expected_version) {
            return Err(Error::conflict(
                doc.kind(),
                doc.namespace(),
                doc.name(),
                expected_version,
            ));
        }

        let mut updated = doc.clone();
        for field in keep_from_stored {
            let path = FieldPath::parse(field);
            match stored.get(&path) {
                Some(value) => updated.set(&path, value.clone()),
                None => {
                    updated.remove(&path);
                }
            }
        }
        self.stamp(&mut updated, false);
        objects.insert(key, updated.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, Error> {
        self.snapshot(&key.kind, &key.namespace, &key.name)
            .ok_or_else(|| Error::not_found(&key.kind, &key.namespace, &key.name))
    }

    async fn list(
        &self,
        _api_version: &str,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, Error> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((k, ns, _), _)| k == kind && ns == namespace)
            .filter(|(_, doc)| {
                let object_labels = doc.labels();
                labels
                    .iter()
                    .all(|(key, value)| object_labels.get(key) == Some(value))
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn create(&self, doc: &Document) -> Result<Document, Error> {
        let key = store_key(doc.kind(), doc.namespace(), doc.name());
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(Error::already_exists(
                doc.kind(),
                doc.namespace(),
                doc.name(),
            ));
        }
        let mut created = doc.clone();
        created.clear_server_fields();
        self.stamp(&mut created, true);
        objects.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn update(&self, doc: &Document, expected_version: &str) -> Result<Document, Error> {
        self.conditional_replace(doc, expected_version, &["status", "metadata.uid"])
    }

    async fn update_status(
        &self,
        doc: &Document,
        expected_version: &str,
    ) -> Result<Document, Error> {
        let key = store_key(doc.kind(), doc.namespace(), doc.name());
        let mut merged = self
            .snapshot(&key.0, &key.1, &key.2)
            .ok_or_else(|| Error::not_found(doc.kind(), doc.namespace(), doc.name()))?;
        let status = FieldPath::parse("status");
        match doc.get(&status) {
            Some(value) => merged.set(&status, value.clone()),
            None => {
                merged.remove(&status);
            }
        }
        self.conditional_replace(&merged, expected_version, &[])
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        self.objects
            .write()
            .remove(&store_key(&key.kind, &key.namespace, &key.name))
            .map(|_| {
                self.writes.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or_else(|| Error::not_found(&key.kind, &key.namespace, &key.name))
    }
}
