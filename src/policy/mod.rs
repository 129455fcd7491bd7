//! Namespace selection policy
//!
//! The policy decides which namespaces receive the root certificate artifact.
//! It is owned outside the controller: a [`PolicyWatcher`] holds the current
//! value and calls registered handlers whenever it is replaced. Sources (a
//! ConfigMap watch, or a fixed start-up value) push into the watcher.
//!
//! Semantics:
//! - a namespace is selected when ANY selector matches it
//! - an empty selector `{}` matches every namespace
//! - an empty selector list selects nothing

mod selector;
mod source;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Error;

pub use selector::{
    LabelSelectorOperator, LabelSelectorRequirement, NamespaceSelector, NAMESPACE_NAME_LABEL,
};
pub use source::{load_policy, policy_from_configmap, run_policy_configmap_source};

/// Ordered list of namespace selectors, replaced wholesale on change
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPolicy {
    /// Selectors; a namespace is selected if any of them matches
    #[serde(default)]
    pub namespace_selectors: Vec<NamespaceSelector>,
}

impl SelectionPolicy {
    /// Create a policy from selectors
    pub fn new(namespace_selectors: Vec<NamespaceSelector>) -> Self {
        Self {
            namespace_selectors,
        }
    }

    /// Policy selecting every namespace
    pub fn select_all() -> Self {
        Self::new(vec![NamespaceSelector::default()])
    }

    /// Policy selecting no namespace
    pub fn select_none() -> Self {
        Self::default()
    }

    /// Parse a policy document and validate it
    ///
    /// A blank document yields `None` so callers can fall back to their default.
    pub fn from_yaml(doc: &str) -> Result<Option<Self>, Error> {
        if doc.trim().is_empty() {
            return Ok(None);
        }
        let policy: Self = serde_yaml::from_str(doc)?;
        policy.validate()?;
        Ok(Some(policy))
    }

    /// Check a namespace name and label set against the policy
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        self.namespace_selectors
            .iter()
            .any(|sel| sel.matches(name, labels))
    }

    /// Check namespace metadata against the policy
    pub fn matches_meta(&self, meta: &ObjectMeta) -> bool {
        let Some(name) = meta.name.as_deref() else {
            return false;
        };
        match &meta.labels {
            Some(labels) => self.matches(name, labels),
            None => self.matches(name, &BTreeMap::new()),
        }
    }

    /// Validate every selector
    pub fn validate(&self) -> Result<(), Error> {
        for (i, sel) in self.namespace_selectors.iter().enumerate() {
            sel.validate()
                .map_err(|e| Error::validation(format!("namespaceSelectors[{}]: {}", i, e)))?;
        }
        Ok(())
    }
}

type PolicyHandler = Arc<dyn Fn(&SelectionPolicy) + Send + Sync>;

/// Holds the current selection policy and notifies handlers on replacement
///
/// Handlers run synchronously on the thread that calls [`PolicyWatcher::set_policy`]
/// and must not block or call back into the watcher. Replacements and
/// registrations are serialized, so a handler sees policies in the order they
/// were set and never an older one after a newer one.
pub struct PolicyWatcher {
    current: RwLock<Arc<SelectionPolicy>>,
    handlers: Mutex<Vec<PolicyHandler>>,
}

impl PolicyWatcher {
    /// Create a watcher holding an initial policy
    pub fn new(initial: SelectionPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Current policy
    pub fn policy(&self) -> Arc<SelectionPolicy> {
        self.current.read().clone()
    }

    /// Register a handler, calling it once with the current policy and again
    /// after every replacement
    ///
    /// The initial call and the registration happen under the same lock as
    /// replacements, so no replacement can slip in between them.
    pub fn watch<F>(&self, handler: F)
    where
        F: Fn(&SelectionPolicy) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock();
        let current = self.policy();
        handler(&current);
        handlers.push(Arc::new(handler));
    }

    /// Replace the policy; returns false (and notifies nobody) when unchanged
    pub fn set_policy(&self, policy: SelectionPolicy) -> bool {
        let policy = Arc::new(policy);
        let handlers = self.handlers.lock();
        {
            let mut current = self.current.write();
            if **current == *policy {
                debug!("selection policy unchanged");
                return false;
            }
            *current = policy.clone();
        }

        debug!(
            selectors = policy.namespace_selectors.len(),
            handlers = handlers.len(),
            "selection policy replaced"
        );
        for handler in handlers.iter() {
            handler(&policy);
        }
        true
    }
}
