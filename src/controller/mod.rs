//! SecurityPolicy controller
//!
//! Reconciliation follows the Kubernetes controller pattern: observe the
//! resource, converge the backend, report the outcome as conditions.

pub mod api;
mod requeue;
mod security_policy;

pub use api::{
    KubeNamespaceClassifier, KubePolicyApi, NamespaceClassifier, PolicyApi, FIELD_MANAGER,
};
pub use requeue::{rate_limited_delay, RequeueTracker};
pub use security_policy::{
    error_policy, reconcile, reconcile_key, reconcile_vanished, schema_label, Context,
    CONDITION_READY, REASON_CREATED, REASON_DELETED, UNSUPPORTED_REQUEUE,
};
