//! Object store backed by the Kubernetes API server
//!
//! Objects are handled as `DynamicObject`s; the API resource is derived from
//! the apiVersion and kind without discovery, using the known Cluster API
//! pluralizations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use super::ObjectStore;
use crate::contract::{parse_api_version, pluralize_kind};
use crate::document::{Document, ObjectKey};
use crate::Error;

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Real object store using the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }

    fn api_for(&self, doc: &Document) -> Api<DynamicObject> {
        self.api(doc.api_version(), doc.kind(), doc.namespace())
    }
}

fn to_dynamic(doc: &Document) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(doc.to_value())?)
}

fn from_dynamic(obj: DynamicObject) -> Result<Document, Error> {
    Document::from_value(serde_json::to_value(obj)?)
}

/// Map API status codes onto the store's error taxonomy
fn map_api_error(err: kube::Error, key: &ObjectKey, expected_version: Option<&str>) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => {
            Error::not_found(&key.kind, &key.namespace, &key.name)
        }
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(&key.kind, &key.namespace, &key.name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(
            &key.kind,
            &key.namespace,
            &key.name,
            expected_version.unwrap_or_default(),
        ),
        kube::Error::Api(ae) if ae.code >= 500 => Error::store(ae.message),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, Error> {
        let api = self.api(&key.api_version, &key.kind, &key.namespace);
        let obj = api
            .get(&key.name)
            .await
            .map_err(|e| map_api_error(e, key, None))?;
        from_dynamic(obj)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, Error> {
        let selector = labels
            .iter()
            .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{}={}", k, v) })
            .collect::<Vec<_>>()
            .join(",");
        let key = ObjectKey::new(api_version, kind, namespace, "");
        let list = self
            .api(api_version, kind, namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| map_api_error(e, &key, None))?;
        debug!(kind, namespace, selector = %selector, count = list.items.len(), "listed objects");
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create(&self, doc: &Document) -> Result<Document, Error> {
        let mut doc = doc.clone();
        doc.clear_server_fields();
        let obj = to_dynamic(&doc)?;
        let created = self
            .api_for(&doc)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_api_error(e, &doc.key(), None))?;
        from_dynamic(created)
    }

    async fn update(&self, doc: &Document, expected_version: &str) -> Result<Document, Error> {
        let mut doc = doc.clone();
        doc.set_resource_version(expected_version);
        let obj = to_dynamic(&doc)?;
        let replaced = self
            .api_for(&doc)
            .replace(doc.name(), &PostParams::default(), &obj)
            .await
            .map_err(|e| map_api_error(e, &doc.key(), Some(expected_version)))?;
        from_dynamic(replaced)
    }

    async fn update_status(
        &self,
        doc: &Document,
        expected_version: &str,
    ) -> Result<Document, Error> {
        let mut doc = doc.clone();
        doc.set_resource_version(expected_version);
        let body = serde_json::to_vec(&doc)?;
        let replaced = self
            .api_for(&doc)
            .replace_status(doc.name(), &PostParams::default(), body)
            .await
            .map_err(|e| map_api_error(e, &doc.key(), Some(expected_version)))?;
        from_dynamic(replaced)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), Error> {
        self.api(&key.api_version, &key.kind, &key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| map_api_error(e, key, None))?;
        Ok(())
    }
}
