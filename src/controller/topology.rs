//! Topology reconcile loop
//!
//! One pass reads a cluster, its blueprint and current state, asks the
//! [`TopologyProvider`] for the desired state, and drives every unit toward it
//! in a fixed order. Unit failures are collected rather than aborting the
//! pass; only blueprint validation and cancellation stop it early.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::backoff::FailureTracker;
use crate::conditions::{self, set_condition, Condition, ConditionStatus, TOPOLOGY_RECONCILED};
use crate::config::ReconcilerConfig;
use crate::contract::{cluster, PAUSED_ANNOTATION};
use crate::document::{Document, ObjectKey};
use crate::events::{EventSink, NoopEventSink};
use crate::scope::{Blueprint, ClusterState, Scope};
use crate::store::{ObjectStore, ScopedStore};
use crate::Error;

use super::current_state::{get_current_state, CurrentState};
use super::reconcile_state::{
    reconcile_cluster_refs, reconcile_control_plane, reconcile_infrastructure_cluster,
    reconcile_machine_deployment, reconcile_machine_health_check, PassContext,
};

/// Source of the blueprint and desired state of a cluster
///
/// Expanding a class into concrete objects happens outside this crate; the
/// reconciler only consumes the result.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Resolve the class definition of `cluster`
    async fn blueprint(&self, cluster: &Document) -> Result<Blueprint, Error>;

    /// Compute the desired state of `cluster` from `blueprint`
    async fn desired_state(
        &self,
        cluster: &Document,
        blueprint: &Blueprint,
    ) -> Result<ClusterState, Error>;
}

/// Drives reconcile passes for topology-managed clusters
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    topology: Arc<dyn TopologyProvider>,
    events: Arc<dyn EventSink>,
    config: ReconcilerConfig,
    failures: FailureTracker,
}

/// A failed pass and the condition reason it surfaces under
struct PassFailure {
    error: Error,
    reason: &'static str,
}

impl From<Error> for PassFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            reason: conditions::reasons::TOPOLOGY_RECONCILE_FAILED,
        }
    }
}

impl Reconciler {
    /// Create a builder
    pub fn builder(
        store: Arc<dyn ObjectStore>,
        topology: Arc<dyn TopologyProvider>,
    ) -> ReconcilerBuilder {
        ReconcilerBuilder::new(store, topology)
    }

    /// Settings in effect
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Consecutive failed passes for the cluster at `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures.failures(key)
    }

    /// Run one reconcile pass for the cluster at `key`.
    ///
    /// Every store call observes `cancel`. Success means every unit converged;
    /// the next pass is driven by watch events, not a timed requeue.
    #[instrument(skip(self, cancel), fields(cluster = %key))]
    pub async fn reconcile(&self, cancel: &CancellationToken, key: &ObjectKey) -> Result<Action, Error> {
        let ctx = PassContext {
            store: ScopedStore::new(self.store.as_ref(), cancel),
            events: self.events.as_ref(),
        };

        match self.reconcile_pass(&ctx, key).await {
            Ok(action) => {
                self.failures.reset(key);
                Ok(action)
            }
            Err(PassFailure { error: Error::Cancelled, .. }) => {
                debug!("reconcile pass cancelled");
                Err(Error::Cancelled)
            }
            Err(failure) => {
                let failures = self.failures.record_failure(key);
                if failure.error.has_terminal() || self.config.backoff.exhausted(failures) {
                    self.surface_failure(&ctx, key, &failure).await;
                }
                Err(failure.error)
            }
        }
    }

    /// Requeue decision after a failed pass
    pub fn error_policy(&self, key: &ObjectKey, error: &Error) -> Action {
        let failures = self.failures.failures(key).max(1);
        error!(?error, cluster = %key, failures, "topology reconciliation failed");

        if error.is_terminal() {
            Action::await_change()
        } else if error.is_conflict() {
            Action::requeue(self.config.conflict_requeue)
        } else {
            Action::requeue(self.config.backoff.delay_for(failures))
        }
    }

    async fn reconcile_pass(&self, ctx: &PassContext<'_>, key: &ObjectKey) -> Result<Action, PassFailure> {
        let Some(cluster_doc) = ctx.store.get_optional(key).await? else {
            debug!("cluster not found, nothing to do");
            return Ok(Action::await_change());
        };
        if cluster_doc.is_deleting() {
            debug!("cluster is being deleted");
            return Ok(Action::await_change());
        }
        if is_paused(&cluster_doc) {
            info!("cluster is paused, skipping");
            return Ok(Action::await_change());
        }
        if cluster_doc.get(&cluster::topology()).is_none() {
            debug!("cluster has no managed topology");
            return Ok(Action::await_change());
        }

        info!("reconciling cluster topology");
        let blueprint = ctx.store.guard(self.topology.blueprint(&cluster_doc)).await?;
        if let Err(error) = blueprint.validate() {
            warn!(%error, "blueprint is invalid");
            return Err(PassFailure {
                error,
                reason: conditions::reasons::INVALID_BLUEPRINT,
            });
        }

        let CurrentState { state: current, rejected } =
            get_current_state(&ctx.store, &blueprint, cluster_doc).await?;
        let desired = ctx
            .store
            .guard(self.topology.desired_state(&current.cluster, &blueprint))
            .await?;
        let mut scope = Scope::new(blueprint, current, desired)?;

        let changed = reconcile_units(ctx, &mut scope, rejected).await?;
        self.mark_reconciled(ctx, &scope.current.cluster).await?;
        info!(changed, "cluster topology reconciled");
        Ok(Action::await_change())
    }

    async fn mark_reconciled(&self, ctx: &PassContext<'_>, cluster_doc: &Document) -> Result<(), Error> {
        let mut updated = cluster_doc.clone();
        let condition = Condition::new(
            TOPOLOGY_RECONCILED,
            ConditionStatus::True,
            conditions::reasons::RECONCILE_SUCCEEDED,
            "",
        );
        if set_condition(&mut updated, condition)? {
            let version = cluster_doc.resource_version().unwrap_or_default();
            ctx.store.update_status(&updated, version).await?;
        }
        Ok(())
    }

    /// Report a failed pass on the cluster; failures here are only logged
    async fn surface_failure(&self, ctx: &PassContext<'_>, key: &ObjectKey, failure: &PassFailure) {
        let message = failure.error.to_string();
        let result = async {
            let Some(mut cluster_doc) = ctx.store.get_optional(key).await? else {
                return Ok(());
            };
            self.events
                .emit(&cluster_doc, EventType::Warning, failure.reason, message.clone());
            let version = cluster_doc.resource_version().unwrap_or_default().to_string();
            let condition = Condition::new(
                TOPOLOGY_RECONCILED,
                ConditionStatus::False,
                failure.reason,
                message.clone(),
            );
            if set_condition(&mut cluster_doc, condition)? {
                ctx.store.update_status(&cluster_doc, &version).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, "failed to record reconcile failure on cluster");
        }
    }
}

fn is_paused(cluster_doc: &Document) -> bool {
    cluster_doc.get_bool(&cluster::paused()).unwrap_or(false)
        || cluster_doc.annotation(PAUSED_ANNOTATION).is_some()
}

/// Reconcile every unit in order, collecting failures.
///
/// `rejected` holds managed objects the current-state read could not key;
/// each counts as a failed unit.
async fn reconcile_units(
    ctx: &PassContext<'_>,
    scope: &mut Scope,
    rejected: Vec<Error>,
) -> Result<bool, Error> {
    let mut units = ErrorAggregator::default();
    for error in rejected {
        units.record("unkeyed managed object", Err(error))?;
    }

    let infrastructure = units.record(
        "infrastructure cluster",
        reconcile_infrastructure_cluster(ctx, scope).await,
    )?;
    let control_plane = units.record("control plane", reconcile_control_plane(ctx, scope).await)?;
    if infrastructure.is_some() && control_plane.is_some() {
        units.record("cluster references", reconcile_cluster_refs(ctx, scope).await)?;
    } else {
        warn!("skipping cluster references until infrastructure and control plane converge");
    }

    for name in scope.machine_deployment_names() {
        let result = reconcile_machine_deployment(ctx, scope, &name).await;
        units.record(&format!("machine deployment {}", name), result)?;
    }
    for (name, mhc) in scope.machine_health_checks() {
        let result =
            reconcile_machine_health_check(ctx, mhc.current.as_ref(), mhc.desired.as_ref()).await;
        units.record(&format!("machine health check {}", name), result)?;
    }

    units.into_result()
}

/// Collects unit outcomes of one pass
#[derive(Default)]
struct ErrorAggregator {
    errors: Vec<Error>,
    changed: bool,
}

impl ErrorAggregator {
    /// Record one unit's result.
    ///
    /// Returns `Ok(Some(changed))` on success and `Ok(None)` on a failure
    /// that was collected or skipped. Cancellation aborts the pass.
    fn record(&mut self, unit: &str, result: Result<bool, Error>) -> Result<Option<bool>, Error> {
        match result {
            Ok(changed) => {
                self.changed |= changed;
                Ok(Some(changed))
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) if e.is_not_found() => {
                warn!(unit, error = %e, "object deleted out of band, skipping unit");
                Ok(None)
            }
            Err(e) => {
                warn!(unit, error = %e, "unit failed");
                self.errors.push(e);
                Ok(None)
            }
        }
    }

    fn into_result(mut self) -> Result<bool, Error> {
        match self.errors.len() {
            0 => Ok(self.changed),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Aggregate(self.errors)),
        }
    }
}

/// Builder for [`Reconciler`]
pub struct ReconcilerBuilder {
    store: Arc<dyn ObjectStore>,
    topology: Arc<dyn TopologyProvider>,
    events: Option<Arc<dyn EventSink>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    fn new(store: Arc<dyn ObjectStore>, topology: Arc<dyn TopologyProvider>) -> Self {
        Self {
            store,
            topology,
            events: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the event sink (defaults to discarding events)
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the reconciler
    pub fn build(self) -> Reconciler {
        Reconciler {
            store: self.store,
            topology: self.topology,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventSink)),
            config: self.config,
            failures: FailureTracker::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryConfig;
    use crate::builder;
    use crate::conditions::get_condition;
    use crate::events::{reasons, RecordingEventSink};
    use crate::scope::{ClusterClass, ControlPlaneClass};
    use crate::store::{InMemoryStore, MockObjectStore};
    use std::time::Duration;

    fn valid_blueprint() -> Blueprint {
        Blueprint {
            cluster_class: Some(ClusterClass {
                name: "quick-start".into(),
                control_plane: Some(ControlPlaneClass::default()),
            }),
        }
    }

    fn cluster_key() -> ObjectKey {
        ObjectKey::new("cluster.x-k8s.io/v1beta1", "Cluster", "ns1", "c1")
    }

    fn topology_cluster() -> Document {
        builder::cluster("ns1", "c1")
            .with_topology("quick-start", "v1.21.2")
            .build()
    }

    fn desired_for(cluster_doc: &Document) -> ClusterState {
        let infra = builder::infrastructure_cluster("ns1", "c1-infra").build();
        let cp = builder::control_plane("ns1", "c1-cp")
            .with_version("v1.21.2")
            .with_replicas(1)
            .build();
        let mut desired = ClusterState::new(
            builder::cluster(cluster_doc.namespace(), cluster_doc.name())
                .with_topology("quick-start", "v1.21.2")
                .with_infrastructure_cluster(&infra)
                .with_control_plane(&cp)
                .build(),
        );
        desired.infrastructure_cluster = Some(infra);
        desired.control_plane.object = Some(cp);
        desired
    }

    fn provider(blueprint: Blueprint) -> MockTopologyProvider {
        let mut topology = MockTopologyProvider::new();
        topology
            .expect_blueprint()
            .returning(move |_| Ok(blueprint.clone()));
        topology
            .expect_desired_state()
            .returning(|cluster_doc, _| Ok(desired_for(cluster_doc)));
        topology
    }

    #[tokio::test]
    async fn missing_cluster_is_a_quiet_success() {
        let store = Arc::new(InMemoryStore::new());
        let mut topology = MockTopologyProvider::new();
        topology.expect_blueprint().never();
        let reconciler = Reconciler::builder(store, Arc::new(topology)).build();

        let action = reconciler
            .reconcile(&CancellationToken::new(), &cluster_key())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn guarded_clusters_are_left_alone() {
        for cluster_doc in [
            builder::cluster("ns1", "c1").build(),
            builder::cluster("ns1", "c1")
                .with_topology("quick-start", "v1.21.2")
                .paused()
                .build(),
            builder::cluster("ns1", "c1")
                .with_topology("quick-start", "v1.21.2")
                .with_annotation(PAUSED_ANNOTATION, "")
                .build(),
            builder::cluster("ns1", "c1")
                .with_topology("quick-start", "v1.21.2")
                .with_field("metadata.deletionTimestamp", "2024-01-01T00:00:00Z".into())
                .build(),
        ] {
            let store = Arc::new(InMemoryStore::new());
            store.insert(cluster_doc);
            let mut topology = MockTopologyProvider::new();
            topology.expect_blueprint().never();
            let reconciler = Reconciler::builder(store.clone(), Arc::new(topology)).build();

            reconciler
                .reconcile(&CancellationToken::new(), &cluster_key())
                .await
                .unwrap();
            assert_eq!(store.write_count(), 0);
        }
    }

    /// Story: a new topology cluster gets its objects and a success condition
    #[tokio::test]
    async fn story_first_pass_creates_objects_and_reports_success() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(topology_cluster());
        let events = Arc::new(RecordingEventSink::new());
        let reconciler = Reconciler::builder(store.clone(), Arc::new(provider(valid_blueprint())))
            .events(events.clone())
            .build();

        let action = reconciler
            .reconcile(&CancellationToken::new(), &cluster_key())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        assert!(store.snapshot("DockerCluster", "ns1", "c1-infra").is_some());
        assert!(store.snapshot("KubeadmControlPlane", "ns1", "c1-cp").is_some());
        let cluster_doc = store.snapshot("Cluster", "ns1", "c1").unwrap();
        assert_eq!(
            cluster_doc.get_str(&"spec.controlPlaneRef.name".into()),
            Some("c1-cp")
        );
        let condition = get_condition(&cluster_doc, TOPOLOGY_RECONCILED).unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(
            events.reasons(),
            vec![reasons::TOPOLOGY_CREATE, reasons::TOPOLOGY_CREATE, reasons::TOPOLOGY_UPDATE]
        );
    }

    /// Story: an owned machine deployment with no topology name fails the
    /// pass, but only after every other unit has converged
    #[tokio::test]
    async fn story_unkeyed_machine_deployment_does_not_block_other_units() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(topology_cluster());
        store.insert(
            builder::machine_deployment("ns1", "c1-stray")
                .for_topology("c1", None)
                .build(),
        );
        let reconciler =
            Reconciler::builder(store.clone(), Arc::new(provider(valid_blueprint()))).build();

        let err = reconciler
            .reconcile(&CancellationToken::new(), &cluster_key())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidObject(_)));
        assert!(err.to_string().contains("c1-stray"));

        assert!(store.snapshot("DockerCluster", "ns1", "c1-infra").is_some());
        assert!(store.snapshot("KubeadmControlPlane", "ns1", "c1-cp").is_some());
        let cluster_doc = store.snapshot("Cluster", "ns1", "c1").unwrap();
        assert_eq!(
            cluster_doc.get_str(&"spec.controlPlaneRef.name".into()),
            Some("c1-cp")
        );
        let condition = get_condition(&cluster_doc, TOPOLOGY_RECONCILED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        // The stray object is reported, never deleted
        assert!(store.snapshot("MachineDeployment", "ns1", "c1-stray").is_some());
    }

    /// Story: a class without a control plane stops reconciliation with a
    /// visible condition and no requeue storm
    #[tokio::test]
    async fn story_invalid_blueprint() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(topology_cluster());
        let events = Arc::new(RecordingEventSink::new());
        let mut topology = MockTopologyProvider::new();
        topology.expect_blueprint().returning(|_| {
            Ok(Blueprint {
                cluster_class: Some(ClusterClass {
                    name: "broken".into(),
                    control_plane: None,
                }),
            })
        });
        topology.expect_desired_state().never();
        let reconciler = Reconciler::builder(store.clone(), Arc::new(topology))
            .events(events.clone())
            .build();

        let err = reconciler
            .reconcile(&CancellationToken::new(), &cluster_key())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(reconciler.error_policy(&cluster_key(), &err), Action::await_change());

        let cluster_doc = store.snapshot("Cluster", "ns1", "c1").unwrap();
        let condition = get_condition(&cluster_doc, TOPOLOGY_RECONCILED).unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, conditions::reasons::INVALID_BLUEPRINT);
        assert_eq!(events.reasons(), vec![reasons::INVALID_BLUEPRINT]);
        assert!(store.objects_of_kind("KubeadmControlPlane").is_empty());
    }

    #[tokio::test]
    async fn transient_failures_escalate_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(topology_cluster());
        let mut topology = MockTopologyProvider::new();
        topology
            .expect_blueprint()
            .returning(|_| Err(Error::store("class lookup timed out")));
        let config = ReconcilerConfig {
            backoff: RetryConfig::with_max_attempts(2),
            ..Default::default()
        };
        let reconciler = Reconciler::builder(store.clone(), Arc::new(topology))
            .config(config)
            .build();
        let cancel = CancellationToken::new();

        reconciler.reconcile(&cancel, &cluster_key()).await.unwrap_err();
        let cluster_doc = store.snapshot("Cluster", "ns1", "c1").unwrap();
        assert!(get_condition(&cluster_doc, TOPOLOGY_RECONCILED).is_none());

        reconciler.reconcile(&cancel, &cluster_key()).await.unwrap_err();
        assert_eq!(reconciler.failures(&cluster_key()), 2);
        let cluster_doc = store.snapshot("Cluster", "ns1", "c1").unwrap();
        let condition = get_condition(&cluster_doc, TOPOLOGY_RECONCILED).unwrap();
        assert_eq!(condition.reason, conditions::reasons::TOPOLOGY_RECONCILE_FAILED);
    }

    #[tokio::test]
    async fn error_policy_distinguishes_conflicts_from_outages() {
        let config = ReconcilerConfig {
            conflict_requeue: Duration::from_millis(7),
            backoff: RetryConfig {
                initial_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let reconciler = Reconciler::builder(
            Arc::new(InMemoryStore::new()),
            Arc::new(MockTopologyProvider::new()),
        )
        .config(config)
        .build();
        let key = cluster_key();

        let conflict = Error::conflict("KubeadmControlPlane", "ns1", "cp", "3");
        assert_eq!(
            reconciler.error_policy(&key, &conflict),
            Action::requeue(Duration::from_millis(7))
        );

        let mixed = Error::Aggregate(vec![conflict, Error::store("unavailable")]);
        let action = reconciler.error_policy(&key, &mixed);
        assert_ne!(action, Action::requeue(Duration::from_millis(7)));
        assert_ne!(action, Action::await_change());
    }

    #[tokio::test]
    async fn cancelled_pass_is_not_counted_and_writes_nothing() {
        let mut store = MockObjectStore::new();
        store.expect_get().never();
        store.expect_update_status().never();
        let reconciler = Reconciler::builder(
            Arc::new(store),
            Arc::new(MockTopologyProvider::new()),
        )
        .build();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler.reconcile(&cancel, &cluster_key()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(err.is_retryable());
        assert_eq!(reconciler.failures(&cluster_key()), 0);
    }

    #[test]
    fn aggregator_collects_and_skips() {
        let mut units = ErrorAggregator::default();
        assert_eq!(units.record("a", Ok(true)).unwrap(), Some(true));
        assert_eq!(
            units
                .record("b", Err(Error::not_found("MachineDeployment", "ns1", "md")))
                .unwrap(),
            None
        );
        assert_eq!(
            units.record("c", Err(Error::validation("bad"))).unwrap(),
            None
        );
        assert!(units
            .record("d", Err(Error::Cancelled))
            .is_err());
        let err = units.into_result().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut units = ErrorAggregator::default();
        units.record("a", Err(Error::validation("x"))).unwrap();
        units.record("b", Err(Error::store("y"))).unwrap();
        let err = units.into_result().unwrap_err();
        assert!(err.has_terminal());
        assert!(!err.is_terminal());
    }
}
