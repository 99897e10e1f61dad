//! Schema-agnostic object model
//!
//! A [`Document`] is the JSON object form of any Kubernetes resource: a mapping
//! of string keys to mappings, sequences and scalars. The engine never assumes a
//! concrete schema beyond the top-level `kind`, `apiVersion`, `metadata`,
//! `spec` and `status` fields; everything else is addressed through
//! [`FieldPath`]s.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Top-level fields every valid object carries
const REQUIRED_FIELDS: &[&str] = &["kind", "apiVersion", "spec", "status"];

/// Dotted path addressing a field inside a document (e.g. `spec.machineTemplate.metadata`)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parse a dotted path. Empty segments are dropped.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// The root path (addresses the whole document)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Path segments
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True for the root path
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of a child field
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    /// True if `self` is `other` or one of its ancestors
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// Coordinates of an object in the store
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// apiVersion, needed to resolve the API resource
    pub api_version: String,
    /// Object kind
    pub kind: String,
    /// Namespace (empty for cluster-scoped objects)
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create a key from its parts
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Resolve an object reference, defaulting the namespace to `default_namespace`
    pub fn from_reference(reference: &ObjectReference, default_namespace: &str) -> Result<Self, Error> {
        let field = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::invalid_object(format!("object reference has no {}", name)))
        };
        Ok(Self {
            api_version: field(&reference.api_version, "apiVersion")?,
            kind: field(&reference.kind, "kind")?,
            namespace: reference
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| default_namespace.to_string()),
            name: field(&reference.name, "name")?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Generic object: a JSON mapping with field-path accessors
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Wrap a JSON value; fails unless it is a mapping
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::invalid_object(format!(
                "document must be a mapping, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Parse a YAML (or JSON) document
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let value: Value =
            serde_yaml::from_str(yaml).map_err(|e| Error::serialization(e.to_string()))?;
        Self::from_value(value)
    }

    /// Underlying mapping
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into a JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrow as a JSON value (clones)
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Value at `path`, if present
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        rest.iter()
            .try_fold(self.0.get(first)?, |value, segment| value.as_object()?.get(segment))
    }

    /// String value at `path`
    pub fn get_str(&self, path: &FieldPath) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Integer value at `path`
    pub fn get_i64(&self, path: &FieldPath) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// Boolean value at `path`
    pub fn get_bool(&self, path: &FieldPath) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Set the value at `path`, creating (or replacing non-mapping) intermediates
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            if let Value::Object(map) = value {
                self.0 = map;
            }
            return;
        };
        let mut map = &mut self.0;
        for segment in parents {
            let entry = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(inner) = entry else {
                return;
            };
            map = inner;
        }
        map.insert(last.clone(), value);
    }

    /// Remove and return the value at `path`
    pub fn remove(&mut self, path: &FieldPath) -> Option<Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut map = &mut self.0;
        for segment in parents {
            map = map.get_mut(segment)?.as_object_mut()?;
        }
        map.remove(last)
    }

    /// Object kind
    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(Value::as_str).unwrap_or_default()
    }

    /// Object apiVersion
    pub fn api_version(&self) -> &str {
        self.0
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// metadata.name
    pub fn name(&self) -> &str {
        self.get_str(&FieldPath::parse("metadata.name"))
            .unwrap_or_default()
    }

    /// Set metadata.name
    pub fn set_name(&mut self, name: &str) {
        self.set(&FieldPath::parse("metadata.name"), Value::from(name));
    }

    /// metadata.namespace
    pub fn namespace(&self) -> &str {
        self.get_str(&FieldPath::parse("metadata.namespace"))
            .unwrap_or_default()
    }

    /// metadata.uid
    pub fn uid(&self) -> Option<&str> {
        self.get_str(&FieldPath::parse("metadata.uid"))
    }

    /// metadata.resourceVersion, the optimistic-concurrency token
    pub fn resource_version(&self) -> Option<&str> {
        self.get_str(&FieldPath::parse("metadata.resourceVersion"))
    }

    /// Set metadata.resourceVersion
    pub fn set_resource_version(&mut self, version: &str) {
        self.set(
            &FieldPath::parse("metadata.resourceVersion"),
            Value::from(version),
        );
    }

    /// Drop server-assigned identity so the document can be created
    pub fn clear_server_fields(&mut self) {
        for field in ["resourceVersion", "uid", "creationTimestamp", "generation"] {
            self.remove(&FieldPath::parse("metadata").child(field));
        }
    }

    /// metadata.labels as a map (non-string values skipped)
    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.get(&FieldPath::parse("metadata.labels")))
    }

    /// A single metadata.labels entry
    pub fn label(&self, key: &str) -> Option<&str> {
        self.get(&FieldPath::parse("metadata.labels"))?
            .get(key)?
            .as_str()
    }

    /// A single metadata.annotations entry
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get(&FieldPath::parse("metadata.annotations"))?
            .get(key)?
            .as_str()
    }

    /// Set a single metadata.annotations entry
    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set(
            &FieldPath::parse("metadata.annotations").child(key),
            Value::from(value),
        );
    }

    /// Object coordinates
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.api_version(), self.kind(), self.namespace(), self.name())
    }

    /// Reference to this object
    pub fn object_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version().to_string()),
            kind: Some(self.kind().to_string()),
            name: Some(self.name().to_string()),
            namespace: Some(self.namespace().to_string()).filter(|ns| !ns.is_empty()),
            uid: self.uid().map(str::to_string),
            resource_version: self.resource_version().map(str::to_string),
            ..Default::default()
        }
    }

    /// metadata.ownerReferences (malformed entries skipped)
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.get(&FieldPath::parse("metadata.ownerReferences"))
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add an owner reference to `owner` unless one with the same uid (or kind/name) exists
    pub fn ensure_owner_reference(&mut self, owner: &Document) -> Result<(), Error> {
        let reference = OwnerReference {
            api_version: owner.api_version().to_string(),
            kind: owner.kind().to_string(),
            name: owner.name().to_string(),
            uid: owner.uid().unwrap_or_default().to_string(),
            ..Default::default()
        };
        let mut refs = self.owner_references();
        let exists = refs.iter().any(|r| {
            r.kind == reference.kind
                && r.name == reference.name
                && (r.uid.is_empty() || reference.uid.is_empty() || r.uid == reference.uid)
        });
        if !exists {
            refs.push(reference);
            self.set(
                &FieldPath::parse("metadata.ownerReferences"),
                serde_json::to_value(refs)?,
            );
        }
        Ok(())
    }

    /// True if metadata.deletionTimestamp is set
    pub fn is_deleting(&self) -> bool {
        self.get(&FieldPath::parse("metadata.deletionTimestamp"))
            .is_some_and(|v| !v.is_null())
    }

    /// Check the shape every object handled by the engine must have
    pub fn validate(&self) -> Result<(), Error> {
        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| self.0.get(*field).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(Error::invalid_object(format!(
                "{} {:?} is missing required fields: {}",
                if self.kind().is_empty() { "object" } else { self.kind() },
                self.name(),
                missing.join(", ")
            )));
        }
        for field in ["spec", "status"] {
            if !self.0[field].is_object() {
                return Err(Error::invalid_object(format!(
                    "{} {:?}: {} must be a mapping",
                    self.kind(),
                    self.name(),
                    field
                )));
            }
        }
        Ok(())
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn control_plane() -> Document {
        Document::from_yaml(
            r#"
apiVersion: controlplane.cluster.x-k8s.io/v1beta1
kind: KubeadmControlPlane
metadata:
  name: cp1
  namespace: ns1
  resourceVersion: "7"
spec:
  version: v1.20.0
  replicas: 3
  machineTemplate:
    metadata:
      labels:
        tier: control-plane
status: {}
"#,
        )
        .unwrap()
    }

    #[test]
    fn field_path_parsing_and_prefixes() {
        let path = FieldPath::parse("spec.machineTemplate.metadata");
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.to_string(), "spec.machineTemplate.metadata");
        assert!(FieldPath::parse("spec").is_prefix_of(&path));
        assert!(path.is_prefix_of(&path));
        assert!(!FieldPath::parse("spec.machine").is_prefix_of(&path));
        assert!(FieldPath::root().is_prefix_of(&path));
        assert_eq!(FieldPath::parse("spec..version"), FieldPath::parse("spec.version"));
    }

    #[test]
    fn reads_nested_values() {
        let doc = control_plane();
        assert_eq!(doc.kind(), "KubeadmControlPlane");
        assert_eq!(doc.name(), "cp1");
        assert_eq!(doc.namespace(), "ns1");
        assert_eq!(doc.resource_version(), Some("7"));
        assert_eq!(doc.get_str(&"spec.version".into()), Some("v1.20.0"));
        assert_eq!(doc.get_i64(&"spec.replicas".into()), Some(3));
        assert_eq!(
            doc.get(&"spec.machineTemplate.metadata.labels.tier".into()),
            Some(&json!("control-plane"))
        );
        assert_eq!(doc.get(&"spec.missing.deep".into()), None);
        // Cannot descend through a scalar
        assert_eq!(doc.get(&"spec.version.major".into()), None);
    }

    #[test]
    fn set_creates_and_replaces_intermediates() {
        let mut doc = control_plane();
        doc.set(&"spec.machineTemplate.infrastructureRef.name".into(), json!("tmpl-1"));
        assert_eq!(
            doc.get_str(&"spec.machineTemplate.infrastructureRef.name".into()),
            Some("tmpl-1")
        );

        doc.set(&"spec.version.major".into(), json!(1));
        assert_eq!(doc.get(&"spec.version".into()), Some(&json!({"major": 1})));
    }

    #[test]
    fn remove_returns_old_value() {
        let mut doc = control_plane();
        assert_eq!(doc.remove(&"spec.replicas".into()), Some(json!(3)));
        assert_eq!(doc.remove(&"spec.replicas".into()), None);
        assert_eq!(doc.remove(&"spec.nothing.here".into()), None);
    }

    #[test]
    fn validate_reports_missing_fields() {
        assert!(control_plane().validate().is_ok());

        let doc = Document::from_value(json!({"kind": "Foo", "spec": {}})).unwrap();
        let err = doc.validate().unwrap_err();
        assert!(err.is_terminal());
        let msg = err.to_string();
        assert!(msg.contains("apiVersion"));
        assert!(msg.contains("status"));
        assert!(!msg.contains("kind,"));

        let doc = Document::from_value(
            json!({"kind": "Foo", "apiVersion": "v1", "spec": "oops", "status": {}}),
        )
        .unwrap();
        assert!(doc.validate().unwrap_err().to_string().contains("spec must be a mapping"));
    }

    #[test]
    fn from_value_rejects_non_mappings() {
        assert!(Document::from_value(json!([1, 2])).is_err());
        assert!(Document::from_yaml("just a string").is_err());
        assert!(Document::from_yaml("a: [unclosed").is_err());
    }

    #[test]
    fn owner_references_are_not_duplicated() {
        let owner = Document::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": "c1", "namespace": "ns1", "uid": "uid-1"}
        }))
        .unwrap();
        let mut doc = control_plane();
        doc.ensure_owner_reference(&owner).unwrap();
        doc.ensure_owner_reference(&owner).unwrap();
        let refs = doc.owner_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "Cluster");
        assert_eq!(refs[0].name, "c1");
        assert_eq!(refs[0].uid, "uid-1");
    }

    #[test]
    fn object_key_from_reference_defaults_namespace() {
        let reference = ObjectReference {
            api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".into()),
            kind: Some("DockerCluster".into()),
            name: Some("infra".into()),
            ..Default::default()
        };
        let key = ObjectKey::from_reference(&reference, "ns1").unwrap();
        assert_eq!(key.namespace, "ns1");
        assert_eq!(key.to_string(), "DockerCluster ns1/infra");

        let broken = ObjectReference {
            kind: Some("DockerCluster".into()),
            ..Default::default()
        };
        assert!(ObjectKey::from_reference(&broken, "ns1").is_err());
    }

    #[test]
    fn clear_server_fields_strips_identity() {
        let mut doc = control_plane();
        doc.set(&"metadata.uid".into(), json!("abc"));
        doc.clear_server_fields();
        assert_eq!(doc.resource_version(), None);
        assert_eq!(doc.uid(), None);
        assert_eq!(doc.name(), "cp1");
    }
}
