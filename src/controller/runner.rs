//! Controller runner - drives [`Reconciler`] from kube watches
//!
//! The kube `Controller` is the work queue: it serializes passes per cluster
//! key and runs distinct clusters concurrently. Besides Clusters it watches
//! every kind a topology manages, so drift and status changes on those
//! objects requeue the owning cluster.

use std::sync::Arc;

use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use crate::config::{ReconcilerConfig, WatchedKind};
use crate::contract::{
    CLUSTER_API_VERSION, CLUSTER_KIND, CLUSTER_NAME_LABEL, MACHINE_DEPLOYMENT_KIND,
    MACHINE_HEALTH_CHECK_KIND,
};
use crate::document::ObjectKey;
use crate::events::KubeEventSink;
use crate::store::{build_api_resource, KubeObjectStore};
use crate::Error;

use super::topology::{Reconciler, TopologyProvider};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Shared state handed to every controller callback
struct RunnerContext {
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
}

/// Run the topology controller until `shutdown` is cancelled or the process
/// receives a termination signal.
///
/// Objects are read and written through the API server, and events are
/// reported as `config.controller_name`. In-flight passes observe a child of
/// `shutdown` and abort their store calls once it is cancelled.
pub async fn run(
    client: Client,
    topology: Arc<dyn TopologyProvider>,
    config: ReconcilerConfig,
    shutdown: CancellationToken,
) {
    let watched = watched_kinds(&config);
    let events = Arc::new(KubeEventSink::new(client.clone(), &config.controller_name));
    let reconciler = Reconciler::builder(Arc::new(KubeObjectStore::new(client.clone())), topology)
        .events(events)
        .config(config)
        .build();

    let cluster_resource = build_api_resource(CLUSTER_API_VERSION, CLUSTER_KIND);
    let clusters: Api<DynamicObject> = Api::all_with(client.clone(), &cluster_resource);
    let ctx = Arc::new(RunnerContext {
        reconciler: Arc::new(reconciler),
        shutdown: shutdown.clone(),
    });

    let mut controller = Controller::new_with(
        clusters,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        cluster_resource.clone(),
    );
    for kind in watched {
        let resource = build_api_resource(&kind.api_version, &kind.kind);
        let objects: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        let clusters = cluster_resource.clone();
        controller = controller.watches_with(
            objects,
            resource,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |object| owning_cluster(&object, &clusters),
        );
        tracing::debug!(api_version = %kind.api_version, kind = %kind.kind, "watching managed kind");
    }

    tracing::info!("- Cluster topology controller");

    controller
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Topology"))
        .await;
}

/// Kinds whose changes requeue their cluster: the Cluster API kinds every
/// topology has, then the configured provider kinds
fn watched_kinds(config: &ReconcilerConfig) -> Vec<WatchedKind> {
    let mut kinds = vec![
        WatchedKind::new(CLUSTER_API_VERSION, MACHINE_DEPLOYMENT_KIND),
        WatchedKind::new(CLUSTER_API_VERSION, MACHINE_HEALTH_CHECK_KIND),
    ];
    for kind in &config.watched_kinds {
        if !kinds.contains(kind) {
            kinds.push(kind.clone());
        }
    }
    kinds
}

/// The cluster a managed object belongs to: its cluster-name label, else a
/// Cluster owner reference
fn owning_cluster(object: &DynamicObject, clusters: &ApiResource) -> Option<ObjectRef<DynamicObject>> {
    let namespace = object.namespace()?;
    let name = object.labels().get(CLUSTER_NAME_LABEL).cloned().or_else(|| {
        object
            .owner_references()
            .iter()
            .find(|owner| owner.kind == CLUSTER_KIND && owner.api_version == CLUSTER_API_VERSION)
            .map(|owner| owner.name.clone())
    })?;
    Some(ObjectRef::new_with(&name, clusters.clone()).within(&namespace))
}

fn cluster_key(cluster: &DynamicObject) -> ObjectKey {
    ObjectKey::new(
        CLUSTER_API_VERSION,
        CLUSTER_KIND,
        cluster.namespace().unwrap_or_default(),
        cluster.name_any(),
    )
}

async fn reconcile(cluster: Arc<DynamicObject>, ctx: Arc<RunnerContext>) -> Result<Action, Error> {
    let pass = ctx.shutdown.child_token();
    ctx.reconciler.reconcile(&pass, &cluster_key(&cluster)).await
}

fn error_policy(cluster: Arc<DynamicObject>, error: &Error, ctx: Arc<RunnerContext>) -> Action {
    ctx.reconciler.error_policy(&cluster_key(&cluster), error)
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
