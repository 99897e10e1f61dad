//! Cluster API object contract
//!
//! Field paths, labels and annotations the topology controller reads and
//! writes on objects whose concrete schema it does not otherwise assume.

use crate::document::FieldPath;

/// API version of core Cluster API types
pub const CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";
/// Kind of the top-level cluster object
pub const CLUSTER_KIND: &str = "Cluster";
/// Kind of machine deployment objects
pub const MACHINE_DEPLOYMENT_KIND: &str = "MachineDeployment";
/// Kind of machine health check objects
pub const MACHINE_HEALTH_CHECK_KIND: &str = "MachineHealthCheck";

/// Label carrying the owning cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
/// Label marking objects managed by the topology controller
pub const TOPOLOGY_OWNED_LABEL: &str = "topology.cluster.x-k8s.io/owned";
/// Label carrying the machine deployment topology name
pub const DEPLOYMENT_NAME_LABEL: &str = "topology.cluster.x-k8s.io/deployment-name";
/// Annotation pausing reconciliation of a cluster
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Topology key used for the control plane's machine health check
pub const CONTROL_PLANE_TOPOLOGY_NAME: &str = "control-plane";

/// Paths on the top-level cluster object
pub mod cluster {
    use super::FieldPath;

    /// spec.topology: present only on topology-managed clusters
    pub fn topology() -> FieldPath {
        FieldPath::parse("spec.topology")
    }

    /// spec.paused
    pub fn paused() -> FieldPath {
        FieldPath::parse("spec.paused")
    }

    /// spec.infrastructureRef
    pub fn infrastructure_ref() -> FieldPath {
        FieldPath::parse("spec.infrastructureRef")
    }

    /// spec.controlPlaneRef
    pub fn control_plane_ref() -> FieldPath {
        FieldPath::parse("spec.controlPlaneRef")
    }

    /// status.controlPlaneReady
    pub fn control_plane_ready() -> FieldPath {
        FieldPath::parse("status.controlPlaneReady")
    }

    /// status.controlPlane: replica and version summary copied from the control plane
    pub fn control_plane_status() -> FieldPath {
        FieldPath::parse("status.controlPlane")
    }

    /// status.conditions
    pub fn conditions() -> FieldPath {
        FieldPath::parse("status.conditions")
    }
}

/// Paths on control plane objects (e.g. KubeadmControlPlane)
pub mod control_plane {
    use super::FieldPath;

    /// spec.replicas
    pub fn replicas() -> FieldPath {
        FieldPath::parse("spec.replicas")
    }

    /// spec.version
    pub fn version() -> FieldPath {
        FieldPath::parse("spec.version")
    }

    /// spec.machineTemplate.metadata
    pub fn machine_template_metadata() -> FieldPath {
        FieldPath::parse("spec.machineTemplate.metadata")
    }

    /// spec.machineTemplate.infrastructureRef
    pub fn machine_template_infrastructure_ref() -> FieldPath {
        FieldPath::parse("spec.machineTemplate.infrastructureRef")
    }

    /// status.ready
    pub fn status_ready() -> FieldPath {
        FieldPath::parse("status.ready")
    }

    /// status.version
    pub fn status_version() -> FieldPath {
        FieldPath::parse("status.version")
    }

    /// Replica counters mirrored onto the cluster status
    pub const STATUS_REPLICA_FIELDS: &[&str] = &[
        "replicas",
        "readyReplicas",
        "updatedReplicas",
        "unavailableReplicas",
    ];
}

/// Paths on infrastructure cluster objects (e.g. DockerCluster)
pub mod infrastructure_cluster {
    use super::FieldPath;

    /// spec.controlPlaneEndpoint, filled in by the infrastructure provider
    pub fn control_plane_endpoint() -> FieldPath {
        FieldPath::parse("spec.controlPlaneEndpoint")
    }
}

/// Name prefix for rotated control plane infrastructure machine templates
pub fn control_plane_template_name_prefix(cluster_name: &str) -> String {
    format!("{}-control-plane-", cluster_name)
}

/// Known Cluster API resource pluralizations.
///
/// Kubernetes plurals are lowercase with no separators; kinds not listed fall
/// back to the usual English rules in [`pluralize_kind`].
const KIND_PLURALS: &[(&str, &str)] = &[
    ("cluster", "clusters"),
    ("clusterclass", "clusterclasses"),
    ("machine", "machines"),
    ("machinedeployment", "machinedeployments"),
    ("machineset", "machinesets"),
    ("machinepool", "machinepools"),
    ("machinehealthcheck", "machinehealthchecks"),
    ("kubeadmcontrolplane", "kubeadmcontrolplanes"),
    ("kubeadmcontrolplanetemplate", "kubeadmcontrolplanetemplates"),
    ("kubeadmconfigtemplate", "kubeadmconfigtemplates"),
    ("dockercluster", "dockerclusters"),
    ("dockermachinetemplate", "dockermachinetemplates"),
    ("awscluster", "awsclusters"),
    ("awsmachinetemplate", "awsmachinetemplates"),
    ("openstackcluster", "openstackclusters"),
    ("openstackmachinetemplate", "openstackmachinetemplates"),
    ("proxmoxcluster", "proxmoxclusters"),
    ("proxmoxmachinetemplate", "proxmoxmachinetemplates"),
];

/// Pluralize a resource kind for the REST path
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Split an apiVersion into (group, version); the core group is empty
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
