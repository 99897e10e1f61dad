//! Merge-patch engine
//!
//! Computes the patch the topology controller applies to an existing object.
//! The controller owns a field only while its desired value keeps changing:
//! a field someone else edited is left alone unless our desired value for it
//! moves, except at authoritative paths, which always converge to desired.
//!
//! The desired state we last applied is kept on the object itself in the
//! [`LAST_APPLIED_ANNOTATION`], so the engine holds no state between passes.

mod three_way;

use serde_json::{Map, Value};
use tracing::warn;

use crate::document::{Document, FieldPath};
use crate::Error;

pub(crate) use three_way::merge_into;

/// Annotation holding the JSON of the managed fields as last applied
pub const LAST_APPLIED_ANNOTATION: &str = "topology.cluster.x-k8s.io/last-applied-desired";

/// Paths the controller manages when no narrower set is given
pub fn default_allowed_paths() -> Vec<FieldPath> {
    vec![
        FieldPath::parse("metadata.labels"),
        FieldPath::parse("metadata.annotations"),
        FieldPath::parse("spec"),
    ]
}

fn last_applied_path() -> FieldPath {
    FieldPath::parse("metadata.annotations").child(LAST_APPLIED_ANNOTATION)
}

/// Ordered set of paths the controller always owns outright
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthoritativePaths(Vec<FieldPath>);

impl AuthoritativePaths {
    /// Build from paths, dropping duplicates and keeping first occurrence order
    pub fn new(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        let mut set = Self::default();
        for path in paths {
            set.push(path);
        }
        set
    }

    /// Add a path unless already present
    pub fn push(&mut self, path: FieldPath) {
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }

    /// True if `path` is itself authoritative
    pub fn contains(&self, path: &FieldPath) -> bool {
        self.0.contains(path)
    }

    /// True if `path` is an authoritative path or an ancestor of one
    pub fn leads_to(&self, path: &FieldPath) -> bool {
        self.0.iter().any(|auth| path.is_prefix_of(auth))
    }

    /// Iterate the paths in order
    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.iter()
    }

    /// True if no path is authoritative
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<FieldPath> for AuthoritativePaths {
    fn from_iter<I: IntoIterator<Item = FieldPath>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Ownership rules for one patch computation
#[derive(Clone, Debug)]
pub struct PatchOptions {
    /// Paths always converged to desired, overriding external edits
    pub authoritative_paths: AuthoritativePaths,
    /// Paths never patched
    pub ignore_paths: Vec<FieldPath>,
    /// Paths the controller manages at all
    pub allowed_paths: Vec<FieldPath>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            authoritative_paths: AuthoritativePaths::default(),
            ignore_paths: Vec::new(),
            allowed_paths: default_allowed_paths(),
        }
    }
}

impl PatchOptions {
    /// Set the authoritative paths
    pub fn authoritative(mut self, paths: AuthoritativePaths) -> Self {
        self.authoritative_paths = paths;
        self
    }

    /// Set the ignored paths
    pub fn ignore(mut self, paths: impl IntoIterator<Item = FieldPath>) -> Self {
        self.ignore_paths = paths.into_iter().collect();
        self
    }

    /// Narrow the managed paths
    pub fn allowed(mut self, paths: impl IntoIterator<Item = FieldPath>) -> Self {
        self.allowed_paths = paths.into_iter().collect();
        self
    }

    /// The managed view of `doc`: allowed and authoritative paths, minus ignored
    /// paths and our own bookkeeping annotation.
    fn project(&self, doc: &Document) -> Value {
        let mut projection = Document::default();
        for path in self.allowed_paths.iter().chain(self.authoritative_paths.iter()) {
            if let Some(value) = doc.get(path) {
                projection.set(path, value.clone());
            }
        }
        for path in &self.ignore_paths {
            projection.remove(path);
        }
        projection.remove(&last_applied_path());
        projection.into_value()
    }
}

/// Record the managed view of `doc` as last applied, for objects about to be created
pub fn stamp_last_applied(doc: &mut Document, opts: &PatchOptions) -> Result<(), Error> {
    let projection = serde_json::to_string(&opts.project(doc))?;
    doc.set(&last_applied_path(), Value::String(projection));
    Ok(())
}

fn read_last_applied(current: &Document) -> Option<Value> {
    let raw = current.annotation(LAST_APPLIED_ANNOTATION)?;
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) | Err(_) => {
            warn!(
                object = %current.key(),
                "ignoring unreadable last-applied annotation"
            );
            None
        }
    }
}

/// Patch between a live object and its desired state
#[derive(Clone, Debug)]
pub struct PatchHelper {
    current: Document,
    patch: Map<String, Value>,
}

impl PatchHelper {
    /// Compute the patch from `current` toward `desired` under `opts`.
    ///
    /// Fails with [`Error::InvalidObject`] if either object is malformed or
    /// the kinds differ; nothing is written in that case.
    pub fn new(current: &Document, desired: &Document, opts: &PatchOptions) -> Result<Self, Error> {
        current.validate()?;
        desired.validate()?;
        if current.kind() != desired.kind() {
            return Err(Error::invalid_object(format!(
                "cannot patch {} {:?} with an object of kind {}",
                current.kind(),
                current.name(),
                desired.kind()
            )));
        }

        let last_applied = read_last_applied(current);
        let desired_view = opts.project(desired);
        let current_view = opts.project(current);

        let mut patch = match three_way::diff(
            last_applied.as_ref(),
            Some(&desired_view),
            Some(&current_view),
            &FieldPath::root(),
            &opts.authoritative_paths,
        ) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        if !patch.is_empty() || last_applied.as_ref() != Some(&desired_view) {
            let mut bookkeeping = Document::from(patch);
            bookkeeping.set(
                &last_applied_path(),
                Value::String(serde_json::to_string(&desired_view)?),
            );
            patch = match bookkeeping.into_value() {
                Value::Object(map) => map,
                _ => Map::new(),
            };
        }

        Ok(Self {
            current: current.clone(),
            patch,
        })
    }

    /// True if applying the patch changes the object
    pub fn has_changes(&self) -> bool {
        !self.patch.is_empty()
    }

    /// True if the patch touches spec
    pub fn has_spec_changes(&self) -> bool {
        self.patch.contains_key("spec")
    }

    /// Fields changed by the patch, excluding our bookkeeping annotation
    pub fn changed_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        three_way::collect_paths(&self.patch, &FieldPath::root(), &mut paths);
        let bookkeeping = last_applied_path();
        paths.retain(|path| *path != bookkeeping);
        paths
    }

    /// The JSON merge patch
    pub fn patch(&self) -> Value {
        Value::Object(self.patch.clone())
    }

    /// The live object with the patch applied, ready for a conditional write
    pub fn apply(&self) -> Document {
        let mut updated = self.current.as_map().clone();
        merge_into(&mut updated, &self.patch);
        Document::from(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::control_plane;
    use serde_json::json;

    fn kcp(version: &str, replicas: i64) -> Document {
        Document::from_value(json!({
            "apiVersion": "controlplane.cluster.x-k8s.io/v1beta1",
            "kind": "KubeadmControlPlane",
            "metadata": {"name": "cp1", "namespace": "ns1", "resourceVersion": "3"},
            "spec": {
                "version": version,
                "replicas": replicas,
                "machineTemplate": {"metadata": {"labels": {"tier": "cp"}}}
            },
            "status": {"ready": true}
        }))
        .unwrap()
    }

    /// Reconcile once: compute the patch and apply it as the store would.
    fn converge(current: &Document, desired: &Document, opts: &PatchOptions) -> Document {
        PatchHelper::new(current, desired, opts).unwrap().apply()
    }

    #[test]
    fn version_bump_patches_only_the_version() {
        let current = kcp("v1.20.0", 3);
        let desired = kcp("v1.21.2", 3);
        let helper = PatchHelper::new(&current, &desired, &PatchOptions::default()).unwrap();

        assert!(helper.has_spec_changes());
        assert_eq!(helper.changed_paths(), vec![control_plane::version()]);
        assert_eq!(helper.patch()["spec"], json!({"version": "v1.21.2"}));
    }

    #[test]
    fn second_pass_is_empty() {
        let opts = PatchOptions::default();
        let desired = kcp("v1.21.2", 3);
        let once = converge(&kcp("v1.20.0", 3), &desired, &opts);

        let again = PatchHelper::new(&once, &desired, &opts).unwrap();
        assert!(!again.has_changes(), "unexpected patch {}", again.patch());
        assert_eq!(once.get_str(&control_plane::version()), Some("v1.21.2"));
        // Status is never touched
        assert_eq!(once.get_bool(&control_plane::status_ready()), Some(true));
    }

    #[test]
    fn first_write_records_history_even_without_field_changes() {
        let opts = PatchOptions::default();
        let helper = PatchHelper::new(&kcp("v1.20.0", 3), &kcp("v1.20.0", 3), &opts).unwrap();
        assert!(helper.has_changes());
        assert!(!helper.has_spec_changes());
        assert!(helper.changed_paths().is_empty());

        let stamped = helper.apply();
        assert!(stamped.annotation(LAST_APPLIED_ANNOTATION).is_some());
        assert!(!PatchHelper::new(&stamped, &kcp("v1.20.0", 3), &opts).unwrap().has_changes());
    }

    #[test]
    fn external_edit_survives_unchanged_desired() {
        let opts = PatchOptions::default();
        let desired = kcp("v1.21.2", 3);
        let mut live = converge(&kcp("v1.21.2", 3), &desired, &opts);

        // An autoscaler bumps replicas
        live.set(&control_plane::replicas(), json!(5));
        let helper = PatchHelper::new(&live, &desired, &opts).unwrap();
        assert!(!helper.has_changes());

        // Desired replicas move: our intent wins again
        let helper = PatchHelper::new(&live, &kcp("v1.21.2", 4), &opts).unwrap();
        assert_eq!(helper.changed_paths(), vec![control_plane::replicas()]);
        assert_eq!(helper.apply().get_i64(&control_plane::replicas()), Some(4));
    }

    #[test]
    fn authoritative_path_overrides_external_edit() {
        let opts = PatchOptions::default().authoritative(AuthoritativePaths::new([
            control_plane::machine_template_metadata(),
        ]));
        let desired = kcp("v1.21.2", 3);
        let mut live = converge(&kcp("v1.21.2", 3), &desired, &opts);
        live.set(
            &"spec.machineTemplate.metadata.labels".into(),
            json!({"tier": "edited", "sneaky": "yes"}),
        );

        let updated = converge(&live, &desired, &opts);
        assert_eq!(
            updated.get(&control_plane::machine_template_metadata()),
            Some(&json!({"labels": {"tier": "cp"}}))
        );
    }

    #[test]
    fn ignore_paths_are_never_patched() {
        let opts = PatchOptions::default().ignore([FieldPath::parse("spec.replicas")]);
        let helper = PatchHelper::new(&kcp("v1.20.0", 1), &kcp("v1.20.0", 9), &opts).unwrap();
        assert!(helper.changed_paths().is_empty());
        assert_eq!(helper.apply().get_i64(&control_plane::replicas()), Some(1));
    }

    #[test]
    fn allowed_paths_narrow_the_managed_view() {
        let opts = PatchOptions::default().allowed([FieldPath::parse("spec.version")]);
        let mut desired = kcp("v1.21.2", 9);
        desired.set(&"metadata.labels".into(), json!({"a": "b"}));
        let helper = PatchHelper::new(&kcp("v1.20.0", 1), &desired, &opts).unwrap();
        assert_eq!(helper.changed_paths(), vec![control_plane::version()]);
    }

    #[test]
    fn rejects_malformed_and_mismatched_objects() {
        let valid = kcp("v1.20.0", 3);
        let mut no_status = valid.clone();
        no_status.remove(&"status".into());
        let err = PatchHelper::new(&valid, &no_status, &PatchOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidObject(_)));

        let mut other_kind = valid.clone();
        other_kind.set(&"kind".into(), json!("DockerCluster"));
        let err = PatchHelper::new(&valid, &other_kind, &PatchOptions::default()).unwrap_err();
        assert!(err.to_string().contains("kind DockerCluster"));
    }

    #[test]
    fn unreadable_history_is_treated_as_absent() {
        let mut live = kcp("v1.20.0", 3);
        live.set_annotation(LAST_APPLIED_ANNOTATION, "{not json");
        live.set(&"spec.extra".into(), json!(true));
        let updated = converge(&live, &kcp("v1.21.2", 3), &PatchOptions::default());
        assert_eq!(updated.get_str(&control_plane::version()), Some("v1.21.2"));
        assert_eq!(updated.get_bool(&"spec.extra".into()), Some(true));
    }

    #[test]
    fn stamp_records_projection_without_status() {
        let mut doc = kcp("v1.20.0", 3);
        stamp_last_applied(&mut doc, &PatchOptions::default()).unwrap();
        let recorded: Value =
            serde_json::from_str(doc.annotation(LAST_APPLIED_ANNOTATION).unwrap()).unwrap();
        assert_eq!(recorded["spec"]["version"], json!("v1.20.0"));
        assert!(recorded.get("status").is_none());
        assert!(!PatchHelper::new(&doc, &kcp("v1.20.0", 3), &PatchOptions::default())
            .unwrap()
            .has_changes());
    }

    #[test]
    fn dropping_every_annotation_deletes_them() {
        let opts = PatchOptions::default();
        let mut annotated = kcp("v1.20.0", 3);
        annotated.set_annotation("team", "x");
        annotated.set_annotation("cost-center", "42");
        let live = converge(&kcp("v1.20.0", 3), &annotated, &opts);
        assert_eq!(live.annotation("team"), Some("x"));

        let helper = PatchHelper::new(&live, &kcp("v1.20.0", 3), &opts).unwrap();
        assert_eq!(helper.patch()["metadata"]["annotations"]["team"], Value::Null);
        let updated = helper.apply();
        assert_eq!(updated.annotation("team"), None);
        assert_eq!(updated.annotation("cost-center"), None);
        assert!(updated.annotation(LAST_APPLIED_ANNOTATION).is_some());

        // Converged: the next pass has nothing left to remove
        let again = PatchHelper::new(&updated, &kcp("v1.20.0", 3), &opts).unwrap();
        assert!(!again.has_changes(), "unexpected patch {}", again.patch());
    }

    #[test]
    fn dropping_all_metadata_keeps_foreign_annotations() {
        let opts = PatchOptions::default();
        let mut labeled = kcp("v1.20.0", 3);
        labeled.set(&"metadata.labels".into(), json!({"tier": "cp"}));
        labeled.set_annotation("team", "x");
        let mut live = converge(&kcp("v1.20.0", 3), &labeled, &opts);
        // Set by someone else after our last apply
        live.set_annotation("owner", "ops");

        let updated = converge(&live, &kcp("v1.20.0", 3), &opts);
        assert_eq!(updated.annotation("team"), None);
        assert_eq!(updated.annotation("owner"), Some("ops"));
        assert_eq!(updated.get(&"metadata.labels.tier".into()), None);
        assert_eq!(updated.name(), "cp1");
    }

    #[test]
    fn authoritative_paths_deduplicate_in_order() {
        let paths = AuthoritativePaths::new([
            FieldPath::parse("spec.b"),
            FieldPath::parse("spec.a"),
            FieldPath::parse("spec.b"),
        ]);
        let rendered: Vec<String> = paths.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["spec.b", "spec.a"]);
        assert!(paths.leads_to(&FieldPath::parse("spec")));
        assert!(!paths.leads_to(&FieldPath::parse("spec.c")));
    }
}
