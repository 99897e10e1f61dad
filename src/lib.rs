//! Lattice Topology - converges Cluster API topologies toward their class
//!
//! A topology-managed cluster is expanded from its class into a desired set of
//! objects (infrastructure cluster, control plane and its machine template,
//! machine deployments, machine health checks). This crate compares that
//! desired state with what is live and writes only the fields it owns,
//! leaving fields set by autoscalers, users and other controllers alone.
//!
//! # Modules
//!
//! - [`document`] - Schema-agnostic object model with field-path addressing
//! - [`mergepatch`] - Three-way merge patch with authoritative paths
//! - [`store`] - Versioned object store trait, in-memory and Kubernetes backends
//! - [`controller`] - Unit reconcilers, the topology reconcile loop and its runner
//! - [`scope`] - Current and desired cluster state of one pass
//! - [`conditions`] - Status conditions on the cluster object
//! - [`events`] - Event sinks
//! - [`backoff`] - Requeue backoff and failure tracking
//! - [`config`] - Reconciler configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod backoff;
pub mod builder;
pub mod conditions;
pub mod config;
pub mod contract;
pub mod controller;
pub mod document;
pub mod error;
pub mod events;
pub mod mergepatch;
pub mod scope;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
