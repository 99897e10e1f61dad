//! State of one reconcile pass
//!
//! A [`Scope`] holds the blueprint and the current and desired
//! [`ClusterState`] of one cluster. It is built fresh for every pass and
//! dropped at the end of it; nothing here outlives the pass.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ObjectReference;
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::Error;

/// Resolved class definition driving the desired topology
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    /// The cluster's class, if it could be resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_class: Option<ClusterClass>,
}

/// Class definition the topology is expanded from
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterClass {
    /// Class name
    pub name: String,
    /// Control plane part of the class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneClass>,
}

/// Control plane part of a class
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneClass {
    /// Template the control plane object is built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<ObjectReference>,
    /// Infrastructure machine template for control plane machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_infrastructure: Option<ObjectReference>,
    /// True if control plane machines are provisioned by an infrastructure provider
    #[serde(default)]
    pub requires_machine_infrastructure: bool,
}

impl Blueprint {
    /// Check the blueprint can drive a reconcile pass.
    ///
    /// A blueprint needs a control plane class and, when control plane
    /// machines are externally provisioned, their infrastructure template.
    pub fn validate(&self) -> Result<(), Error> {
        let class = self
            .cluster_class
            .as_ref()
            .ok_or_else(|| Error::validation("blueprint has no cluster class"))?;
        let control_plane = class.control_plane.as_ref().ok_or_else(|| {
            Error::validation(format!("cluster class {:?} has no control plane", class.name))
        })?;
        if control_plane.requires_machine_infrastructure
            && control_plane.machine_infrastructure.is_none()
        {
            return Err(Error::validation(format!(
                "cluster class {:?} requires control plane machine infrastructure but has no template",
                class.name
            )));
        }
        Ok(())
    }

    /// True if control plane machines use an infrastructure machine template
    pub fn has_control_plane_infrastructure_machine(&self) -> bool {
        self.cluster_class
            .as_ref()
            .and_then(|class| class.control_plane.as_ref())
            .is_some_and(|cp| cp.requires_machine_infrastructure && cp.machine_infrastructure.is_some())
    }
}

/// Control plane object and its infrastructure machine template
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlPlaneState {
    /// The control plane object
    pub object: Option<Document>,
    /// Template referenced by `spec.machineTemplate.infrastructureRef`
    pub infrastructure_machine_template: Option<Document>,
}

/// One machine deployment of the topology
#[derive(Clone, Debug, PartialEq)]
pub struct MachineDeploymentState {
    /// The machine deployment object
    pub object: Document,
}

/// Snapshot of a cluster's topology-managed objects
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterState {
    /// The cluster object itself
    pub cluster: Document,
    /// Infrastructure cluster (e.g. DockerCluster)
    pub infrastructure_cluster: Option<Document>,
    /// Control plane
    pub control_plane: ControlPlaneState,
    /// Machine deployments keyed by topology name
    pub machine_deployments: BTreeMap<String, MachineDeploymentState>,
    /// Machine health checks keyed by topology name; absent keys have none
    pub machine_health_checks: BTreeMap<String, Document>,
}

impl ClusterState {
    /// State holding only the cluster object
    pub fn new(cluster: Document) -> Self {
        Self {
            cluster,
            infrastructure_cluster: None,
            control_plane: ControlPlaneState::default(),
            machine_deployments: BTreeMap::new(),
            machine_health_checks: BTreeMap::new(),
        }
    }
}

/// Current and desired machine health check of one topology unit
#[derive(Clone, Debug, PartialEq)]
pub struct MachineHealthCheckState {
    /// Live object, if any
    pub current: Option<Document>,
    /// Object the topology asks for, if any
    pub desired: Option<Document>,
}

/// Everything one reconcile pass works on
#[derive(Clone, Debug)]
pub struct Scope {
    /// Resolved class definition
    pub blueprint: Blueprint,
    /// State read from the store
    pub current: ClusterState,
    /// State computed from the blueprint
    pub desired: ClusterState,
}

impl Scope {
    /// Create a scope; fails if current and desired describe different clusters
    pub fn new(blueprint: Blueprint, current: ClusterState, desired: ClusterState) -> Result<Self, Error> {
        if current.cluster.namespace() != desired.cluster.namespace()
            || current.cluster.name() != desired.cluster.name()
        {
            return Err(Error::validation(format!(
                "desired state is for cluster {}/{}, not {}/{}",
                desired.cluster.namespace(),
                desired.cluster.name(),
                current.cluster.namespace(),
                current.cluster.name()
            )));
        }
        Ok(Self {
            blueprint,
            current,
            desired,
        })
    }

    /// Machine deployment topology names in current or desired state, sorted
    pub fn machine_deployment_names(&self) -> BTreeSet<String> {
        self.current
            .machine_deployments
            .keys()
            .chain(self.desired.machine_deployments.keys())
            .cloned()
            .collect()
    }

    /// Pair current and desired machine health checks by topology name
    pub fn machine_health_checks(&self) -> BTreeMap<String, MachineHealthCheckState> {
        self.current
            .machine_health_checks
            .keys()
            .chain(self.desired.machine_health_checks.keys())
            .map(|name| {
                (
                    name.clone(),
                    MachineHealthCheckState {
                        current: self.current.machine_health_checks.get(name).cloned(),
                        desired: self.desired.machine_health_checks.get(name).cloned(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster(name: &str) -> Document {
        Document::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": name, "namespace": "ns1"},
            "spec": {},
            "status": {}
        }))
        .unwrap()
    }

    fn mhc(name: &str) -> Document {
        Document::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "MachineHealthCheck",
            "metadata": {"name": name, "namespace": "ns1"},
            "spec": {},
            "status": {}
        }))
        .unwrap()
    }

    fn template_ref() -> ObjectReference {
        ObjectReference {
            api_version: Some("infrastructure.cluster.x-k8s.io/v1beta1".into()),
            kind: Some("DockerMachineTemplate".into()),
            name: Some("cp-template".into()),
            ..Default::default()
        }
    }

    #[test]
    fn blueprint_validation() {
        assert!(Blueprint::default().validate().unwrap_err().is_terminal());

        let mut blueprint = Blueprint {
            cluster_class: Some(ClusterClass {
                name: "quick-start".into(),
                control_plane: None,
            }),
        };
        assert!(blueprint
            .validate()
            .unwrap_err()
            .to_string()
            .contains("has no control plane"));

        blueprint.cluster_class = Some(ClusterClass {
            name: "quick-start".into(),
            control_plane: Some(ControlPlaneClass {
                requires_machine_infrastructure: true,
                ..Default::default()
            }),
        });
        assert!(blueprint.validate().is_err());
        assert!(!blueprint.has_control_plane_infrastructure_machine());

        if let Some(cp) = blueprint
            .cluster_class
            .as_mut()
            .and_then(|c| c.control_plane.as_mut())
        {
            cp.machine_infrastructure = Some(template_ref());
        }
        assert!(blueprint.validate().is_ok());
        assert!(blueprint.has_control_plane_infrastructure_machine());
    }

    #[test]
    fn blueprint_deserializes_from_camel_case_yaml() {
        let blueprint: Blueprint = serde_yaml::from_str(
            r#"
clusterClass:
  name: quick-start
  controlPlane:
    requiresMachineInfrastructure: true
    machineInfrastructure:
      apiVersion: infrastructure.cluster.x-k8s.io/v1beta1
      kind: DockerMachineTemplate
      name: cp-template
"#,
        )
        .unwrap();
        assert!(blueprint.validate().is_ok());
        assert!(blueprint.has_control_plane_infrastructure_machine());
    }

    #[test]
    fn scope_rejects_mismatched_clusters() {
        let err = Scope::new(
            Blueprint::default(),
            ClusterState::new(cluster("a")),
            ClusterState::new(cluster("b")),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ns1/b"));
    }

    #[test]
    fn machine_health_checks_pair_by_topology_name() {
        let mut current = ClusterState::new(cluster("a"));
        let mut desired = ClusterState::new(cluster("a"));
        current.machine_health_checks.insert("md-0".into(), mhc("old"));
        current.machine_health_checks.insert("control-plane".into(), mhc("cp"));
        desired.machine_health_checks.insert("control-plane".into(), mhc("cp"));
        desired.machine_health_checks.insert("md-1".into(), mhc("new"));

        let scope = Scope::new(Blueprint::default(), current, desired).unwrap();
        let pairs = scope.machine_health_checks();
        let names: Vec<&str> = pairs.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["control-plane", "md-0", "md-1"]);
        assert!(pairs["md-0"].desired.is_none());
        assert!(pairs["md-1"].current.is_none());
        assert!(pairs["control-plane"].current.is_some() && pairs["control-plane"].desired.is_some());
    }
}
