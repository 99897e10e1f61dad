//! Reading the current state of a cluster's topology from the store

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use tracing::{debug, warn};

use crate::contract::{
    cluster, control_plane, CLUSTER_API_VERSION, CLUSTER_NAME_LABEL, CONTROL_PLANE_TOPOLOGY_NAME,
    DEPLOYMENT_NAME_LABEL, MACHINE_DEPLOYMENT_KIND, MACHINE_HEALTH_CHECK_KIND,
    TOPOLOGY_OWNED_LABEL,
};
use crate::document::{Document, FieldPath, ObjectKey};
use crate::scope::{Blueprint, ClusterState, ControlPlaneState, MachineDeploymentState};
use crate::store::ScopedStore;
use crate::Error;

/// Current state of a cluster plus the managed objects that could not be
/// keyed by topology name
#[derive(Debug)]
pub struct CurrentState {
    /// Objects read back, keyed as the pass expects
    pub state: ClusterState,
    /// One [`Error::InvalidObject`] per object left out of `state`
    pub rejected: Vec<Error>,
}

/// Read every topology-managed object of `cluster_doc`.
///
/// Objects referenced but missing are reported as absent; they are recreated
/// by the pass. Listed objects that cannot be keyed land in
/// [`CurrentState::rejected`] so the rest of the topology still converges.
pub async fn get_current_state(
    store: &ScopedStore<'_>,
    blueprint: &Blueprint,
    cluster_doc: Document,
) -> Result<CurrentState, Error> {
    let mut state = ClusterState::new(cluster_doc);
    let mut rejected = Vec::new();
    state.infrastructure_cluster =
        get_referenced(store, &state.cluster, &cluster::infrastructure_ref()).await?;
    state.control_plane = get_control_plane(store, blueprint, &state.cluster).await?;

    let selector = owned_selector(state.cluster.name());
    state.machine_deployments = list_by_topology_name(
        store,
        MACHINE_DEPLOYMENT_KIND,
        state.cluster.namespace(),
        &selector,
        None,
        &mut rejected,
    )
    .await?
    .into_iter()
    .map(|(name, object)| (name, MachineDeploymentState { object }))
    .collect();
    state.machine_health_checks = list_by_topology_name(
        store,
        MACHINE_HEALTH_CHECK_KIND,
        state.cluster.namespace(),
        &selector,
        Some(CONTROL_PLANE_TOPOLOGY_NAME),
        &mut rejected,
    )
    .await?;

    debug!(
        infrastructure_cluster = state.infrastructure_cluster.is_some(),
        control_plane = state.control_plane.object.is_some(),
        machine_deployments = state.machine_deployments.len(),
        machine_health_checks = state.machine_health_checks.len(),
        rejected = rejected.len(),
        "read current state"
    );
    Ok(CurrentState { state, rejected })
}

async fn get_control_plane(
    store: &ScopedStore<'_>,
    blueprint: &Blueprint,
    cluster_doc: &Document,
) -> Result<ControlPlaneState, Error> {
    let object = get_referenced(store, cluster_doc, &cluster::control_plane_ref()).await?;
    let infrastructure_machine_template = match &object {
        Some(cp) if blueprint.has_control_plane_infrastructure_machine() => {
            get_referenced(store, cp, &control_plane::machine_template_infrastructure_ref()).await?
        }
        _ => None,
    };
    Ok(ControlPlaneState {
        object,
        infrastructure_machine_template,
    })
}

/// Follow the object reference at `path` on `from`
async fn get_referenced(
    store: &ScopedStore<'_>,
    from: &Document,
    path: &FieldPath,
) -> Result<Option<Document>, Error> {
    let Some(value) = from.get(path).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let reference: ObjectReference = serde_json::from_value(value.clone())?;
    let key = ObjectKey::from_reference(&reference, from.namespace())?;
    let object = store.get_optional(&key).await?;
    if object.is_none() {
        warn!(
            object = %key,
            referenced_by = %from.key(),
            "referenced object not found"
        );
    }
    Ok(object)
}

fn owned_selector(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
        (TOPOLOGY_OWNED_LABEL.to_string(), String::new()),
    ])
}

/// List objects of `kind` keyed by their deployment-name label.
///
/// Objects without the label key as `unlabeled` when given. Unkeyable objects
/// and later claimants of an already-taken key are pushed to `rejected`.
async fn list_by_topology_name(
    store: &ScopedStore<'_>,
    kind: &str,
    namespace: &str,
    selector: &BTreeMap<String, String>,
    unlabeled: Option<&str>,
    rejected: &mut Vec<Error>,
) -> Result<BTreeMap<String, Document>, Error> {
    let mut keyed: BTreeMap<String, Document> = BTreeMap::new();
    for object in store.list(CLUSTER_API_VERSION, kind, namespace, selector).await? {
        let name = match (object.label(DEPLOYMENT_NAME_LABEL), unlabeled) {
            (Some(name), _) => name.to_string(),
            (None, Some(fallback)) => fallback.to_string(),
            (None, None) => {
                warn!(object = %object.key(), "managed object has no topology name");
                rejected.push(Error::invalid_object(format!(
                    "{} has no {} label",
                    object.key(),
                    DEPLOYMENT_NAME_LABEL
                )));
                continue;
            }
        };
        if let Some(existing) = keyed.get(&name) {
            warn!(object = %object.key(), topology = %name, "duplicate topology name");
            rejected.push(Error::invalid_object(format!(
                "{} and {} both claim topology {:?}",
                existing.key(),
                object.key(),
                name
            )));
            continue;
        }
        keyed.insert(name, object);
    }
    Ok(keyed)
}
