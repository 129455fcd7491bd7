//! trustsync - distributes the mesh root certificate into selected namespaces
//!
//! The controller keeps a ConfigMap named `istio-ca-root-cert` in every
//! namespace matched by a selection policy, carrying the current trust bundle.
//! Three independent event sources feed it:
//!
//! - namespace lifecycle (create, relabel, delete)
//! - trust bundle rotation
//! - selection policy changes
//!
//! All of them funnel into one deduplicated, per-namespace reconcile.
//!
//! # Modules
//!
//! - [`controller`] - Event translation and the namespace reconciler
//! - [`filter`] - Incrementally maintained set of selected namespaces
//! - [`bundle`] - Trust bundle holder and rotation broadcaster
//! - [`bundle_source`] - File and Secret feeds for the bundle
//! - [`queue`] - Coalescing work queue with per-key serialization and backoff
//! - [`informer`] - Watch-backed caches emitting typed change events
//! - [`policy`] - Namespace selectors, policy watcher and ConfigMap source
//! - [`artifact`] - ConfigMap upsert via server-side apply
//! - [`reserved`] - System namespaces that never receive the artifact
//! - [`retry`] - Exponential backoff helpers
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod artifact;
pub mod bundle;
pub mod bundle_source;
pub mod controller;
pub mod error;
pub mod filter;
pub mod informer;
pub mod policy;
pub mod queue;
pub mod reserved;
pub mod retry;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use error::Error;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name of the per-namespace root certificate ConfigMap
pub const CA_ROOT_CERT_CONFIGMAP: &str = "istio-ca-root-cert";

/// Data key holding the PEM bundle inside the ConfigMap
pub const CA_ROOT_CERT_KEY: &str = "root-cert.pem";

/// Label key marking the ConfigMap as mesh configuration
pub const ARTIFACT_LABEL_KEY: &str = "istio.io/config";

/// Value of [`ARTIFACT_LABEL_KEY`]
pub const ARTIFACT_LABEL_VALUE: &str = "true";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "trustsync";

/// Namespace the controller itself runs in
pub const DEFAULT_SYSTEM_NAMESPACE: &str = "istio-system";

/// ConfigMap holding the selection policy
pub const DEFAULT_POLICY_CONFIGMAP: &str = "trustsync";

/// Key inside the policy ConfigMap holding the YAML document
pub const POLICY_CONFIG_KEY: &str = "config";

/// Secret holding the CA certificate when the Secret bundle source is used
pub const DEFAULT_BUNDLE_SECRET: &str = "istio-ca-secret";

/// Key in the CA Secret holding the root certificate
pub const DEFAULT_BUNDLE_SECRET_KEY: &str = "ca-cert.pem";

/// Bundle file read when the file source is used
pub const DEFAULT_BUNDLE_FILE: &str = "/etc/cacerts/root-cert.pem";

/// How often the bundle file is polled, in seconds
pub const DEFAULT_BUNDLE_POLL_INTERVAL_SECS: u64 = 10;
