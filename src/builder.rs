//! Builders for topology objects
//!
//! Used to assemble fixtures and desired state without writing raw JSON.
//! Every built object passes [`Document::validate`].
//!
//! ```
//! use lattice_topology::builder;
//!
//! let cp = builder::control_plane("ns1", "cp1")
//!     .with_version("v1.21.2")
//!     .with_replicas(3)
//!     .build();
//! assert_eq!(cp.kind(), "KubeadmControlPlane");
//! ```

use serde_json::{json, Map, Value};

use crate::contract::{
    self, CLUSTER_API_VERSION, CLUSTER_KIND, CLUSTER_NAME_LABEL, DEPLOYMENT_NAME_LABEL,
    MACHINE_DEPLOYMENT_KIND, MACHINE_HEALTH_CHECK_KIND, TOPOLOGY_OWNED_LABEL,
};
use crate::document::{Document, FieldPath};

/// apiVersion of the built control plane objects
pub const CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";
/// Kind of the built control plane objects
pub const CONTROL_PLANE_KIND: &str = "KubeadmControlPlane";
/// apiVersion of the built infrastructure objects
pub const INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
/// Kind of the built infrastructure cluster objects
pub const INFRASTRUCTURE_CLUSTER_KIND: &str = "DockerCluster";
/// Kind of the built infrastructure machine templates
pub const INFRASTRUCTURE_MACHINE_TEMPLATE_KIND: &str = "DockerMachineTemplate";

/// Builder for any topology object
#[derive(Clone, Debug)]
pub struct ObjectBuilder {
    doc: Document,
}

impl ObjectBuilder {
    /// Object of an arbitrary kind with empty spec and status
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut doc = Document::from(Map::new());
        doc.set(&FieldPath::parse("apiVersion"), Value::from(api_version));
        doc.set(&FieldPath::parse("kind"), Value::from(kind));
        doc.set(&FieldPath::parse("metadata.name"), Value::from(name));
        doc.set(&FieldPath::parse("metadata.namespace"), Value::from(namespace));
        doc.set(&FieldPath::parse("spec"), json!({}));
        doc.set(&FieldPath::parse("status"), json!({}));
        Self { doc }
    }

    /// Set any field
    pub fn with_field(mut self, path: &str, value: Value) -> Self {
        self.doc.set(&FieldPath::parse(path), value);
        self
    }

    /// Set a label
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.doc.set(
            &FieldPath::parse("metadata.labels").child(key),
            Value::from(value),
        );
        self
    }

    /// Set an annotation
    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.doc.set_annotation(key, value);
        self
    }

    /// Set metadata.uid
    pub fn with_uid(self, uid: &str) -> Self {
        self.with_field("metadata.uid", Value::from(uid))
    }

    /// Set spec.version
    pub fn with_version(self, version: &str) -> Self {
        self.with_field("spec.version", Value::from(version))
    }

    /// Set spec.replicas
    pub fn with_replicas(self, replicas: i64) -> Self {
        self.with_field("spec.replicas", Value::from(replicas))
    }

    /// Label the object as managed for `cluster_name`, under `topology_name`
    /// when it belongs to one machine deployment
    pub fn for_topology(self, cluster_name: &str, topology_name: Option<&str>) -> Self {
        let builder = self
            .with_label(CLUSTER_NAME_LABEL, cluster_name)
            .with_label(TOPOLOGY_OWNED_LABEL, "");
        match topology_name {
            Some(name) => builder.with_label(DEPLOYMENT_NAME_LABEL, name),
            None => builder,
        }
    }

    /// Set spec.topology of a cluster
    pub fn with_topology(self, class: &str, version: &str) -> Self {
        self.with_field(
            "spec.topology",
            json!({"class": class, "version": version}),
        )
    }

    /// Point spec.infrastructureRef of a cluster at `infrastructure_cluster`
    pub fn with_infrastructure_cluster(self, infrastructure_cluster: &Document) -> Self {
        self.with_reference(&contract::cluster::infrastructure_ref(), infrastructure_cluster)
    }

    /// Point spec.controlPlaneRef of a cluster at `control_plane`
    pub fn with_control_plane(self, control_plane: &Document) -> Self {
        self.with_reference(&contract::cluster::control_plane_ref(), control_plane)
    }

    /// Point spec.machineTemplate.infrastructureRef of a control plane at `template`
    pub fn with_infrastructure_machine_template(self, template: &Document) -> Self {
        self.with_reference(
            &contract::control_plane::machine_template_infrastructure_ref(),
            template,
        )
    }

    /// Set a label in spec.machineTemplate.metadata of a control plane
    pub fn with_machine_template_label(mut self, key: &str, value: &str) -> Self {
        self.doc.set(
            &contract::control_plane::machine_template_metadata()
                .child("labels")
                .child(key),
            Value::from(value),
        );
        self
    }

    /// Set the observed status of a control plane
    pub fn with_control_plane_status(self, ready: bool, version: &str, replicas: i64) -> Self {
        self.with_field("status.ready", Value::from(ready))
            .with_field("status.version", Value::from(version))
            .with_field("status.replicas", Value::from(replicas))
            .with_field("status.readyReplicas", Value::from(if ready { replicas } else { 0 }))
            .with_field("status.updatedReplicas", Value::from(replicas))
            .with_field("status.unavailableReplicas", Value::from(if ready { 0 } else { replicas }))
    }

    /// Mark the object paused (clusters only)
    pub fn paused(self) -> Self {
        self.with_field("spec.paused", Value::from(true))
    }

    /// Finish the object
    pub fn build(self) -> Document {
        self.doc
    }

    fn with_reference(mut self, path: &FieldPath, target: &Document) -> Self {
        let mut reference = Map::new();
        reference.insert("apiVersion".into(), Value::from(target.api_version()));
        reference.insert("kind".into(), Value::from(target.kind()));
        reference.insert("name".into(), Value::from(target.name()));
        reference.insert("namespace".into(), Value::from(target.namespace()));
        self.doc.set(path, Value::Object(reference));
        self
    }
}

/// A Cluster
pub fn cluster(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(CLUSTER_API_VERSION, CLUSTER_KIND, namespace, name)
}

/// A control plane (KubeadmControlPlane)
pub fn control_plane(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(CONTROL_PLANE_API_VERSION, CONTROL_PLANE_KIND, namespace, name)
}

/// An infrastructure cluster (DockerCluster)
pub fn infrastructure_cluster(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(
        INFRASTRUCTURE_API_VERSION,
        INFRASTRUCTURE_CLUSTER_KIND,
        namespace,
        name,
    )
}

/// An infrastructure machine template (DockerMachineTemplate)
pub fn infrastructure_machine_template(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(
        INFRASTRUCTURE_API_VERSION,
        INFRASTRUCTURE_MACHINE_TEMPLATE_KIND,
        namespace,
        name,
    )
}

/// A MachineDeployment
pub fn machine_deployment(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(CLUSTER_API_VERSION, MACHINE_DEPLOYMENT_KIND, namespace, name)
}

/// A MachineHealthCheck
pub fn machine_health_check(namespace: &str, name: &str) -> ObjectBuilder {
    ObjectBuilder::new(
        CLUSTER_API_VERSION,
        MACHINE_HEALTH_CHECK_KIND,
        namespace,
        name,
    )
}
