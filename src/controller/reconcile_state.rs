//! Reconcilers for the individual units of a cluster topology
//!
//! Each function converges one managed object (or one group of them) toward
//! its desired state and reports whether anything was written. Errors are
//! returned to the topology loop, which aggregates them per unit; nothing is
//! retried here.

use kube::runtime::events::EventType;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::contract::{self, cluster, control_plane, infrastructure_cluster};
use crate::document::Document;
use crate::events::{reasons, EventSink};
use crate::mergepatch::{stamp_last_applied, AuthoritativePaths, PatchHelper, PatchOptions};
use crate::scope::Scope;
use crate::store::ScopedStore;
use crate::Error;

/// Characters used for generated name suffixes (no vowels, no ambiguous digits)
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

/// Collaborators of one reconcile pass
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    /// Store bound to the pass's cancellation token
    pub store: ScopedStore<'a>,
    /// Sink for events about written objects
    pub events: &'a dyn EventSink,
}

/// What reconciling one object did
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The object did not exist and was created
    Created(Document),
    /// The object was patched
    Updated(Document),
    /// The object already matched its desired state
    Unchanged(Document),
}

impl ReconcileOutcome {
    /// True if the object was written
    pub fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }

    /// The object as stored after reconciliation
    pub fn object(&self) -> &Document {
        match self {
            Self::Created(doc) | Self::Updated(doc) | Self::Unchanged(doc) => doc,
        }
    }

    /// Consume into the stored object
    pub fn into_object(self) -> Document {
        match self {
            Self::Created(doc) | Self::Updated(doc) | Self::Unchanged(doc) => doc,
        }
    }
}

/// Input for [`reconcile_referenced_object`]
pub struct ReferencedObjectInput<'a> {
    /// Cluster owning the object; created objects get an owner reference to it
    pub cluster: &'a Document,
    /// Live object, if any
    pub current: Option<&'a Document>,
    /// Object the topology asks for
    pub desired: &'a Document,
    /// Ownership rules for the patch
    pub opts: PatchOptions,
}

/// Create the object if absent, otherwise patch it toward desired.
///
/// Writes are conditioned on the live object's resourceVersion; a conflict is
/// returned as [`Error::Conflict`] for the caller to re-read and retry.
#[instrument(skip_all, fields(object = %input.desired.key()))]
pub async fn reconcile_referenced_object(
    ctx: &PassContext<'_>,
    input: ReferencedObjectInput<'_>,
) -> Result<ReconcileOutcome, Error> {
    input.desired.validate()?;

    let Some(current) = input.current else {
        let mut object = input.desired.clone();
        object.ensure_owner_reference(input.cluster)?;
        let created = create_object(ctx, input.cluster, object, &input.opts).await?;
        return Ok(ReconcileOutcome::Created(created));
    };

    let helper = PatchHelper::new(current, input.desired, &input.opts)?;
    apply_patch(ctx, input.cluster, current, &helper).await
}

/// Input for [`reconcile_referenced_template`]
pub struct ReferencedTemplateInput<'a> {
    /// Cluster owning the template
    pub cluster: &'a Document,
    /// Live template, if any
    pub current: Option<&'a Document>,
    /// Template the topology asks for
    pub desired: &'a Document,
    /// Prefix for the names of rotated templates
    pub name_prefix: String,
}

/// What reconciling a template did
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateOutcome {
    /// The template the referencing object should point at
    pub template: Document,
    /// Template superseded by a rotation; to be deleted once the referencing
    /// object points at [`TemplateOutcome::template`]
    pub replaced: Option<Document>,
    /// True if any template was written
    pub changed: bool,
}

impl TemplateOutcome {
    /// True if a new template replaced the live one
    pub fn rotated(&self) -> bool {
        self.replaced.is_some()
    }
}

/// Reconcile a template referenced by another object.
///
/// Templates are treated as immutable: metadata changes are patched in
/// place, spec changes create a new template under a generated name.
#[instrument(skip_all, fields(template = %input.desired.key()))]
pub async fn reconcile_referenced_template(
    ctx: &PassContext<'_>,
    input: ReferencedTemplateInput<'_>,
) -> Result<TemplateOutcome, Error> {
    input.desired.validate()?;
    let opts = PatchOptions::default();

    let Some(current) = input.current else {
        let outcome = reconcile_referenced_object(
            ctx,
            ReferencedObjectInput {
                cluster: input.cluster,
                current: None,
                desired: input.desired,
                opts,
            },
        )
        .await?;
        return Ok(TemplateOutcome {
            template: outcome.into_object(),
            replaced: None,
            changed: true,
        });
    };

    if current.kind() == input.desired.kind() {
        let helper = PatchHelper::new(current, input.desired, &opts)?;
        if !helper.has_spec_changes() {
            let outcome = apply_patch(ctx, input.cluster, current, &helper).await?;
            let changed = outcome.changed();
            return Ok(TemplateOutcome {
                template: outcome.into_object(),
                replaced: None,
                changed,
            });
        }
    }

    let mut rotated = input.desired.clone();
    rotated.set_name(&generate_name(&input.name_prefix));
    rotated.clear_server_fields();
    rotated.ensure_owner_reference(input.cluster)?;
    let created = create_object(ctx, input.cluster, rotated, &opts).await?;
    info!(
        from = current.name(),
        to = created.name(),
        "rotated template"
    );
    Ok(TemplateOutcome {
        template: created,
        replaced: Some(current.clone()),
        changed: true,
    })
}

/// Reconcile the infrastructure cluster.
///
/// `spec.controlPlaneEndpoint` is left to the infrastructure provider.
#[instrument(skip_all, fields(cluster = %scope.current.cluster.key()))]
pub async fn reconcile_infrastructure_cluster(
    ctx: &PassContext<'_>,
    scope: &mut Scope,
) -> Result<bool, Error> {
    let Some(desired) = scope.desired.infrastructure_cluster.as_ref() else {
        debug!("topology has no infrastructure cluster");
        return Ok(false);
    };

    let outcome = reconcile_referenced_object(
        ctx,
        ReferencedObjectInput {
            cluster: &scope.current.cluster,
            current: scope.current.infrastructure_cluster.as_ref(),
            desired,
            opts: PatchOptions::default()
                .ignore([infrastructure_cluster::control_plane_endpoint()]),
        },
    )
    .await?;

    let changed = outcome.changed();
    scope.current.infrastructure_cluster = Some(outcome.into_object());
    Ok(changed)
}

/// Paths of the control plane always converged to desired
fn control_plane_authoritative_paths(desired: &Document, manages_template: bool) -> AuthoritativePaths {
    let mut paths = AuthoritativePaths::new([control_plane::machine_template_metadata()]);
    if manages_template {
        paths.push(control_plane::machine_template_infrastructure_ref());
    }
    // Replicas are ours only while the topology sets them; otherwise they
    // belong to whoever scales the control plane.
    if desired.get(&control_plane::replicas()).is_some() {
        paths.push(control_plane::replicas());
    }
    paths
}

/// Reconcile the control plane, its infrastructure machine template, and the
/// control plane summary on the cluster status.
///
/// Status propagation runs on every successful pass, whether or not the
/// control plane itself was written. The control plane is never deleted here.
#[instrument(skip_all, fields(cluster = %scope.current.cluster.key()))]
pub async fn reconcile_control_plane(ctx: &PassContext<'_>, scope: &mut Scope) -> Result<bool, Error> {
    let mut desired = scope
        .desired
        .control_plane
        .object
        .clone()
        .ok_or_else(|| Error::validation("desired state has no control plane"))?;
    let owner = scope.current.cluster.clone();

    let manages_template = scope.blueprint.has_control_plane_infrastructure_machine();
    let mut template = None;
    if manages_template {
        let desired_template = scope
            .desired
            .control_plane
            .infrastructure_machine_template
            .as_ref()
            .ok_or_else(|| {
                Error::validation("desired control plane has no infrastructure machine template")
            })?;
        let outcome = reconcile_referenced_template(
            ctx,
            ReferencedTemplateInput {
                cluster: &owner,
                current: scope
                    .current
                    .control_plane
                    .infrastructure_machine_template
                    .as_ref(),
                desired: desired_template,
                name_prefix: contract::control_plane_template_name_prefix(owner.name()),
            },
        )
        .await?;
        desired.set(
            &control_plane::machine_template_infrastructure_ref(),
            reference_to(&outcome.template),
        );
        template = Some(outcome);
    }

    let opts = PatchOptions::default()
        .authoritative(control_plane_authoritative_paths(&desired, manages_template));
    let result = reconcile_referenced_object(
        ctx,
        ReferencedObjectInput {
            cluster: &owner,
            current: scope.current.control_plane.object.as_ref(),
            desired: &desired,
            opts,
        },
    )
    .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(rotated) = template.as_ref().filter(|t| t.rotated()) {
                discard_template(ctx, &rotated.template).await;
            }
            return Err(e);
        }
    };

    let mut changed = outcome.changed() || template.as_ref().is_some_and(|t| t.changed);
    if let Some(outcome) = template {
        if let Some(replaced) = &outcome.replaced {
            delete_object(ctx, &owner, replaced).await?;
        }
        scope.current.control_plane.infrastructure_machine_template = Some(outcome.template);
    }

    let control_plane = outcome.into_object();
    changed |= propagate_control_plane_status(ctx, &mut scope.current.cluster, &control_plane).await?;
    scope.current.control_plane.object = Some(control_plane);
    Ok(changed)
}

/// Copy the control plane's observed state onto the cluster status
async fn propagate_control_plane_status(
    ctx: &PassContext<'_>,
    cluster_doc: &mut Document,
    control_plane_doc: &Document,
) -> Result<bool, Error> {
    let mut summary = Map::new();
    for field in control_plane::STATUS_REPLICA_FIELDS {
        if let Some(value) = control_plane_doc.get(&"status".into()).and_then(|s| s.get(*field)) {
            summary.insert((*field).to_string(), value.clone());
        }
    }
    if let Some(version) = control_plane_doc.get(&control_plane::status_version()) {
        summary.insert("version".to_string(), version.clone());
    }
    let ready = control_plane_doc
        .get_bool(&control_plane::status_ready())
        .unwrap_or(false);

    let mut updated = cluster_doc.clone();
    updated.set(&cluster::control_plane_ready(), Value::Bool(ready));
    updated.set(&cluster::control_plane_status(), Value::Object(summary));
    if updated.get(&"status".into()) == cluster_doc.get(&"status".into()) {
        debug!("cluster status already reflects the control plane");
        return Ok(false);
    }

    let version = require_version(cluster_doc)?;
    *cluster_doc = ctx.store.update_status(&updated, &version).await?;
    debug!(ready, "propagated control plane status to cluster");
    Ok(true)
}

/// Reconcile the cluster's infrastructure and control plane references
#[instrument(skip_all, fields(cluster = %scope.current.cluster.key()))]
pub async fn reconcile_cluster_refs(ctx: &PassContext<'_>, scope: &mut Scope) -> Result<bool, Error> {
    let opts =
        PatchOptions::default().allowed([cluster::infrastructure_ref(), cluster::control_plane_ref()]);
    let outcome = reconcile_referenced_object(
        ctx,
        ReferencedObjectInput {
            cluster: &scope.current.cluster,
            current: Some(&scope.current.cluster),
            desired: &scope.desired.cluster,
            opts,
        },
    )
    .await?;

    let changed = outcome.changed();
    scope.current.cluster = outcome.into_object();
    Ok(changed)
}

/// Create, patch or delete the machine deployment of topology `name`
#[instrument(skip(ctx, scope), fields(cluster = %scope.current.cluster.key()))]
pub async fn reconcile_machine_deployment(
    ctx: &PassContext<'_>,
    scope: &Scope,
    name: &str,
) -> Result<bool, Error> {
    let current = scope.current.machine_deployments.get(name).map(|md| &md.object);
    let desired = scope.desired.machine_deployments.get(name).map(|md| &md.object);

    match (current, desired) {
        (current, Some(desired)) => {
            let outcome = reconcile_referenced_object(
                ctx,
                ReferencedObjectInput {
                    cluster: &scope.current.cluster,
                    current,
                    desired,
                    opts: PatchOptions::default(),
                },
            )
            .await?;
            Ok(outcome.changed())
        }
        (Some(current), None) => delete_object(ctx, &scope.current.cluster, current).await,
        (None, None) => Ok(false),
    }
}

/// Create, patch or delete one machine health check.
///
/// The object is entirely controller-owned: no authoritative carve-outs, and
/// it is created exactly as desired.
#[instrument(
    skip_all,
    fields(
        current = current.map(Document::name),
        desired = desired.map(Document::name)
    )
)]
pub async fn reconcile_machine_health_check(
    ctx: &PassContext<'_>,
    current: Option<&Document>,
    desired: Option<&Document>,
) -> Result<bool, Error> {
    let opts = PatchOptions::default();
    match (current, desired) {
        (None, Some(desired)) => {
            desired.validate()?;
            create_object(ctx, desired, desired.clone(), &opts).await?;
            Ok(true)
        }
        (Some(current), Some(desired)) => {
            let helper = PatchHelper::new(current, desired, &opts)?;
            Ok(apply_patch(ctx, current, current, &helper).await?.changed())
        }
        (Some(current), None) => delete_object(ctx, current, current).await,
        (None, None) => Ok(false),
    }
}

async fn create_object(
    ctx: &PassContext<'_>,
    event_target: &Document,
    mut object: Document,
    opts: &PatchOptions,
) -> Result<Document, Error> {
    stamp_last_applied(&mut object, opts)?;
    let created = ctx.store.create(&object).await?;
    info!(object = %created.key(), "created object");
    ctx.events.emit(
        event_target,
        EventType::Normal,
        reasons::TOPOLOGY_CREATE,
        format!("Created {}", created.key()),
    );
    Ok(created)
}

async fn apply_patch(
    ctx: &PassContext<'_>,
    event_target: &Document,
    current: &Document,
    helper: &PatchHelper,
) -> Result<ReconcileOutcome, Error> {
    if !helper.has_changes() {
        debug!(object = %current.key(), "no changes");
        return Ok(ReconcileOutcome::Unchanged(current.clone()));
    }

    let version = require_version(current)?;
    let changed = helper.changed_paths();
    let updated = ctx.store.update(&helper.apply(), &version).await?;

    if changed.is_empty() {
        debug!(object = %current.key(), "recorded last applied state");
    } else {
        let fields = changed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        info!(object = %current.key(), %fields, "patched object");
        ctx.events.emit(
            event_target,
            EventType::Normal,
            reasons::TOPOLOGY_UPDATE,
            format!("Updated {} ({})", current.key(), fields),
        );
    }
    Ok(ReconcileOutcome::Updated(updated))
}

/// Delete `object`; absence counts as already deleted
async fn delete_object(
    ctx: &PassContext<'_>,
    event_target: &Document,
    object: &Document,
) -> Result<bool, Error> {
    match ctx.store.delete(&object.key()).await {
        Ok(()) => {
            info!(object = %object.key(), "deleted object");
            ctx.events.emit(
                event_target,
                EventType::Normal,
                reasons::TOPOLOGY_DELETE,
                format!("Deleted {}", object.key()),
            );
            Ok(true)
        }
        Err(e) if e.is_not_found() => {
            debug!(object = %object.key(), "already deleted");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Best-effort removal of a template created in a pass that then failed
async fn discard_template(ctx: &PassContext<'_>, template: &Document) {
    match ctx.store.delete(&template.key()).await {
        Ok(()) => info!(template = %template.key(), "deleted unused rotated template"),
        Err(e) if e.is_not_found() => {}
        Err(e) => warn!(
            template = %template.key(),
            error = %e,
            "failed to delete unused rotated template"
        ),
    }
}

fn require_version(doc: &Document) -> Result<String, Error> {
    doc.resource_version()
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_object(format!("{} has no resourceVersion", doc.key())))
}

/// Object reference value pointing at `target`
fn reference_to(target: &Document) -> Value {
    let mut reference = Map::new();
    reference.insert("apiVersion".into(), Value::from(target.api_version()));
    reference.insert("kind".into(), Value::from(target.kind()));
    reference.insert("name".into(), Value::from(target.name()));
    reference.insert("namespace".into(), Value::from(target.namespace()));
    Value::Object(reference)
}

fn generate_name(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}
