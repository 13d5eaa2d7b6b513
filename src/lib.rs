//! NSX operator - keeps Kubernetes SecurityPolicy resources in sync with NSX
//!
//! Users declare intent as SecurityPolicy custom resources; the operator
//! converges the backend's distributed firewall policies, rules, groups and
//! shares to match, and repairs drift the normal delete path left behind.
//!
//! # Modules
//!
//! - [`crd`] - SecurityPolicy CRDs (legacy and namespace-scoped) and their canonical form
//! - [`controller`] - Reconciliation state machine and Kubernetes API seams
//! - [`backend`] - Backend object model, builder, inventories and HTTP transport
//! - [`gc`] - Orphan collection across backend inventories
//! - [`restore`] - Recovery after a backend restore
//! - [`retry`] - Retry classification for failed reconciliations
//! - [`naming`] - Backend-legal identifiers and names
//! - [`ip_range`] - Address range arithmetic for ipBlock exclusions
//! - [`config`] - Operator configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod backend;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod gc;
pub mod ip_range;
pub mod naming;
pub mod restore;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
