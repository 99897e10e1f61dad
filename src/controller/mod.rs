//! Topology controller
//!
//! Unit reconcilers for the objects of a cluster topology, the reconcile loop
//! that orders them, and the kube runner that feeds it.

mod current_state;
mod reconcile_state;
mod runner;
mod topology;

pub use current_state::{get_current_state, CurrentState};
pub use reconcile_state::{
    reconcile_cluster_refs, reconcile_control_plane, reconcile_infrastructure_cluster,
    reconcile_machine_deployment, reconcile_machine_health_check, reconcile_referenced_object,
    reconcile_referenced_template, PassContext, ReconcileOutcome, ReferencedObjectInput,
    ReferencedTemplateInput, TemplateOutcome,
};
pub use runner::run;
pub use topology::{Reconciler, ReconcilerBuilder, TopologyProvider};
