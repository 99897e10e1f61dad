//! Reconciler configuration
//!
//! Defaults suit a production controller; each setting can be overridden
//! from the environment of the embedding process.

use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryConfig;
use crate::Error;

/// Default reporting component for events
pub const DEFAULT_CONTROLLER_NAME: &str = "topology-controller";

/// A provider kind whose objects trigger a pass for their cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedKind {
    /// apiVersion, e.g. `controlplane.cluster.x-k8s.io/v1beta1`
    pub api_version: String,
    /// Kind, e.g. `KubeadmControlPlane`
    pub kind: String,
}

impl WatchedKind {
    /// Create from an apiVersion and kind
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }
}

impl FromStr for WatchedKind {
    type Err = Error;

    /// Parse `<apiVersion>/<Kind>`, e.g. `infrastructure.cluster.x-k8s.io/v1beta1/DockerCluster`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().rsplit_once('/') {
            Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(api_version, kind))
            }
            _ => Err(Error::validation(format!(
                "watched kind {:?} is not <apiVersion>/<Kind>",
                s
            ))),
        }
    }
}

/// Provider kinds watched when none are configured
pub fn default_watched_kinds() -> Vec<WatchedKind> {
    vec![WatchedKind::new(
        "controlplane.cluster.x-k8s.io/v1beta1",
        "KubeadmControlPlane",
    )]
}

/// Settings shared by every reconcile pass
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcilerConfig {
    /// Name reported as the source of events
    pub controller_name: String,
    /// Control plane and infrastructure kinds watched besides the Cluster API
    /// kinds every topology uses
    pub watched_kinds: Vec<WatchedKind>,
    /// Requeue backoff for failed passes
    pub backoff: RetryConfig,
    /// Requeue delay after a pass that failed only on conflicts
    pub conflict_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            watched_kinds: default_watched_kinds(),
            backoff: RetryConfig::default(),
            conflict_requeue: Duration::from_millis(100),
        }
    }
}

impl ReconcilerConfig {
    /// Load from `TOPOLOGY_*` environment variables, falling back to defaults
    ///
    /// | Variable | Setting |
    /// |---|---|
    /// | `TOPOLOGY_CONTROLLER_NAME` | `controller_name` |
    /// | `TOPOLOGY_WATCH_KINDS` | `watched_kinds`, comma-separated `<apiVersion>/<Kind>` |
    /// | `TOPOLOGY_BACKOFF_INITIAL_MS` | `backoff.initial_delay` |
    /// | `TOPOLOGY_BACKOFF_MAX_SECS` | `backoff.max_delay` |
    /// | `TOPOLOGY_BACKOFF_MULTIPLIER` | `backoff.backoff_multiplier` |
    /// | `TOPOLOGY_ESCALATE_AFTER` | `backoff.max_attempts` |
    /// | `TOPOLOGY_CONFLICT_REQUEUE_MS` | `conflict_requeue` |
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` to resolve variable names
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(name) = lookup("TOPOLOGY_CONTROLLER_NAME").filter(|n| !n.is_empty()) {
            config.controller_name = name;
        }
        if let Some(kinds) = lookup("TOPOLOGY_WATCH_KINDS") {
            config.watched_kinds = kinds
                .split(',')
                .filter(|kind| !kind.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_, _>>()?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TOPOLOGY_BACKOFF_INITIAL_MS")? {
            config.backoff.initial_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TOPOLOGY_BACKOFF_MAX_SECS")? {
            config.backoff.max_delay = Duration::from_secs(secs);
        }
        if let Some(multiplier) = parse_var::<f64>(&lookup, "TOPOLOGY_BACKOFF_MULTIPLIER")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(Error::validation(format!(
                    "TOPOLOGY_BACKOFF_MULTIPLIER must be at least 1.0, got {}",
                    multiplier
                )));
            }
            config.backoff.backoff_multiplier = multiplier;
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "TOPOLOGY_ESCALATE_AFTER")? {
            config.backoff.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TOPOLOGY_CONFLICT_REQUEUE_MS")? {
            config.conflict_requeue = Duration::from_millis(ms);
        }

        if config.backoff.initial_delay > config.backoff.max_delay {
            return Err(Error::validation(format!(
                "backoff initial delay {:?} exceeds max delay {:?}",
                config.backoff.initial_delay, config.backoff.max_delay
            )));
        }
        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::validation(format!("invalid {}={:?}: {}", name, raw, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = ReconcilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ReconcilerConfig::default());
        assert_eq!(config.controller_name, "topology-controller");
        assert_eq!(config.watched_kinds[0].kind, "KubeadmControlPlane");
    }

    #[test]
    fn watched_kinds_are_parsed_from_a_list() {
        let config = ReconcilerConfig::from_lookup(lookup(&[(
            "TOPOLOGY_WATCH_KINDS",
            "controlplane.cluster.x-k8s.io/v1beta1/KubeadmControlPlane, \
             infrastructure.cluster.x-k8s.io/v1beta1/DockerCluster",
        )]))
        .unwrap();
        assert_eq!(
            config.watched_kinds,
            vec![
                WatchedKind::new("controlplane.cluster.x-k8s.io/v1beta1", "KubeadmControlPlane"),
                WatchedKind::new("infrastructure.cluster.x-k8s.io/v1beta1", "DockerCluster"),
            ]
        );

        let none = ReconcilerConfig::from_lookup(lookup(&[("TOPOLOGY_WATCH_KINDS", "")])).unwrap();
        assert!(none.watched_kinds.is_empty());

        let err = ReconcilerConfig::from_lookup(lookup(&[("TOPOLOGY_WATCH_KINDS", "DockerCluster")]))
            .unwrap_err();
        assert!(err.to_string().contains("DockerCluster"));
    }

    #[test]
    fn overrides_are_applied() {
        let config = ReconcilerConfig::from_lookup(lookup(&[
            ("TOPOLOGY_CONTROLLER_NAME", "capi-topology"),
            ("TOPOLOGY_BACKOFF_INITIAL_MS", "250"),
            ("TOPOLOGY_BACKOFF_MAX_SECS", "60"),
            ("TOPOLOGY_BACKOFF_MULTIPLIER", "1.5"),
            ("TOPOLOGY_ESCALATE_AFTER", "0"),
            ("TOPOLOGY_CONFLICT_REQUEUE_MS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.controller_name, "capi-topology");
        assert_eq!(config.backoff.initial_delay, Duration::from_millis(250));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(config.backoff.backoff_multiplier, 1.5);
        assert_eq!(config.backoff.max_attempts, 0);
        assert_eq!(config.conflict_requeue, Duration::from_millis(10));
    }

    #[test]
    fn unparsable_values_are_validation_errors() {
        let err = ReconcilerConfig::from_lookup(lookup(&[("TOPOLOGY_ESCALATE_AFTER", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("TOPOLOGY_ESCALATE_AFTER"));

        let err = ReconcilerConfig::from_lookup(lookup(&[("TOPOLOGY_BACKOFF_MULTIPLIER", "0.5")]))
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn initial_delay_cannot_exceed_max() {
        let err = ReconcilerConfig::from_lookup(lookup(&[
            ("TOPOLOGY_BACKOFF_INITIAL_MS", "5000"),
            ("TOPOLOGY_BACKOFF_MAX_SECS", "1"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
