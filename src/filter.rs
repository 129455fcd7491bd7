//! Namespace membership filter
//!
//! Tracks the set of namespaces currently selected by the [`SelectionPolicy`].
//! The set is maintained incrementally from namespace events and recomputed in
//! full only when the policy itself changes, so at every point it equals what a
//! full recomputation over the namespace cache would produce.
//!
//! Reserved namespaces are NOT excluded here. Callers apply that veto, so
//! [`NamespaceFilter::members`] reflects pure policy membership.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::Store;
use parking_lot::RwLock;
use tracing::debug;

use crate::policy::SelectionPolicy;

struct FilterState {
    policy: SelectionPolicy,
    members: BTreeSet<String>,
}

/// Concurrent membership set for selected namespaces
pub struct NamespaceFilter {
    namespaces: Store<Namespace>,
    state: RwLock<FilterState>,
}

impl NamespaceFilter {
    /// Build a filter and seed membership from whatever the namespace cache holds
    ///
    /// The cache may still be empty; namespaces arriving later are classified
    /// through [`NamespaceFilter::namespace_created`].
    pub fn new(namespaces: Store<Namespace>, policy: SelectionPolicy) -> Self {
        let members = compute_members(&namespaces, &policy);
        Self {
            namespaces,
            state: RwLock::new(FilterState { policy, members }),
        }
    }

    /// Whether an object in `namespace` is of interest
    pub fn filter(&self, namespace: &str) -> bool {
        self.state.read().members.contains(namespace)
    }

    /// Whether a namespace is currently selected
    pub fn is_member(&self, namespace: &str) -> bool {
        self.filter(namespace)
    }

    /// Classify a newly observed namespace; returns true if it joined
    pub fn namespace_created(&self, meta: &ObjectMeta) -> bool {
        let Some(name) = meta.name.as_deref() else {
            return false;
        };
        let mut state = self.state.write();
        if !state.policy.matches_meta(meta) {
            return false;
        }
        state.members.insert(name.to_string());
        debug!(namespace = %name, "namespace joined selection");
        true
    }

    /// Re-classify an updated namespace
    ///
    /// Returns `(membership_changed, added)`. Only a flip in membership is
    /// reported; label churn that leaves membership unchanged yields
    /// `(false, false)`.
    pub fn namespace_updated(&self, _old: &ObjectMeta, new: &ObjectMeta) -> (bool, bool) {
        let Some(name) = new.name.as_deref() else {
            return (false, false);
        };
        let mut state = self.state.write();
        let was_member = state.members.contains(name);
        let is_member = state.policy.matches_meta(new);

        match (was_member, is_member) {
            (false, true) => {
                state.members.insert(name.to_string());
                debug!(namespace = %name, "namespace joined selection");
                (true, true)
            }
            (true, false) => {
                state.members.remove(name);
                debug!(namespace = %name, "namespace left selection");
                (true, false)
            }
            _ => (false, false),
        }
    }

    /// Forget a deleted namespace
    pub fn namespace_deleted(&self, name: &str) {
        if self.state.write().members.remove(name) {
            debug!(namespace = %name, "deleted namespace removed from selection");
        }
    }

    /// Swap in a new policy and recompute membership from the namespace cache
    ///
    /// Returns the sorted `(added, removed)` namespace names.
    pub fn selectors_changed(&self, policy: SelectionPolicy) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.write();
        let members = compute_members(&self.namespaces, &policy);

        let added: Vec<String> = members.difference(&state.members).cloned().collect();
        let removed: Vec<String> = state.members.difference(&members).cloned().collect();

        state.policy = policy;
        state.members = members;

        debug!(
            added = added.len(),
            removed = removed.len(),
            members = state.members.len(),
            "selection recomputed"
        );
        (added, removed)
    }

    /// Point-in-time snapshot of the member set
    pub fn members(&self) -> BTreeSet<String> {
        self.state.read().members.clone()
    }
}

fn compute_members(namespaces: &Store<Namespace>, policy: &SelectionPolicy) -> BTreeSet<String> {
    namespaces
        .state()
        .iter()
        .filter(|ns| policy.matches_meta(&ns.metadata))
        .filter_map(|ns| ns.metadata.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NamespaceSelector;
    use crate::test_support::{namespace, namespace_store};

    fn payments_policy() -> SelectionPolicy {
        SelectionPolicy::new(vec![NamespaceSelector::labels([("team", "payments")])])
    }

    #[test]
    fn seeds_membership_from_cache() {
        let (store, _writer) = namespace_store(vec![
            namespace("pay-a", &[("team", "payments")]),
            namespace("web", &[("team", "frontend")]),
        ]);
        let filter = NamespaceFilter::new(store, payments_policy());
        assert_eq!(filter.members(), BTreeSet::from(["pay-a".to_string()]));
        assert!(filter.filter("pay-a"));
        assert!(!filter.filter("web"));
    }

    #[test]
    fn created_namespace_joins_only_on_match() {
        let (store, _writer) = namespace_store(vec![]);
        let filter = NamespaceFilter::new(store, payments_policy());

        assert!(filter.namespace_created(&namespace("pay-b", &[("team", "payments")]).metadata));
        assert!(!filter.namespace_created(&namespace("web", &[]).metadata));
        assert!(filter.is_member("pay-b"));
        assert!(!filter.is_member("web"));
    }

    #[test]
    fn update_reports_only_membership_flips() {
        let (store, _writer) = namespace_store(vec![]);
        let filter = NamespaceFilter::new(store, payments_policy());

        let plain = namespace("ns", &[]);
        let selected = namespace("ns", &[("team", "payments")]);
        let selected_churn = namespace("ns", &[("team", "payments"), ("cost", "42")]);

        assert_eq!(
            filter.namespace_updated(&plain.metadata, &selected.metadata),
            (true, true)
        );
        assert_eq!(
            filter.namespace_updated(&selected.metadata, &selected_churn.metadata),
            (false, false)
        );
        assert_eq!(
            filter.namespace_updated(&selected_churn.metadata, &plain.metadata),
            (true, false)
        );
        assert!(!filter.is_member("ns"));
        assert_eq!(
            filter.namespace_updated(&plain.metadata, &plain.metadata),
            (false, false)
        );
    }

    #[test]
    fn delete_removes_member() {
        let (store, _writer) = namespace_store(vec![namespace("pay-a", &[("team", "payments")])]);
        let filter = NamespaceFilter::new(store, payments_policy());
        filter.namespace_deleted("pay-a");
        filter.namespace_deleted("never-seen");
        assert!(filter.members().is_empty());
    }

    #[test]
    fn policy_diff_reports_added_and_removed() {
        let (store, _writer) = namespace_store(vec![
            namespace("a", &[("sel", "old")]),
            namespace("b", &[("sel", "both")]),
            namespace("c", &[("sel", "new")]),
        ]);
        let old = SelectionPolicy::new(vec![NamespaceSelector::names(["a", "b"])]);
        let filter = NamespaceFilter::new(store, old);
        assert_eq!(filter.members().len(), 2);

        let new = SelectionPolicy::new(vec![NamespaceSelector::names(["b", "c"])]);
        let (added, removed) = filter.selectors_changed(new);
        assert_eq!(added, vec!["c".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(
            filter.members(),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn overlapping_selectors_count_once() {
        let (store, _writer) = namespace_store(vec![namespace("pay-a", &[("team", "payments")])]);
        let filter = NamespaceFilter::new(store, SelectionPolicy::select_none());
        let policy = SelectionPolicy::new(vec![
            NamespaceSelector::labels([("team", "payments")]),
            NamespaceSelector::names(["pay-a"]),
        ]);
        let (added, _) = filter.selectors_changed(policy);
        assert_eq!(added, vec!["pay-a".to_string()]);
        assert_eq!(filter.members().len(), 1);
    }

    /// Incremental maintenance must agree with a from-scratch computation
    #[test]
    fn incremental_membership_matches_full_recompute() {
        let (store, mut writer) = namespace_store(vec![]);
        let filter = NamespaceFilter::new(store.clone(), payments_policy());

        let events = [
            namespace("a", &[("team", "payments")]),
            namespace("b", &[]),
            namespace("c", &[("team", "payments")]),
        ];
        for ns in &events {
            crate::test_support::apply(&mut writer, ns.clone());
            filter.namespace_created(&ns.metadata);
        }
        let b_selected = namespace("b", &[("team", "payments")]);
        crate::test_support::apply(&mut writer, b_selected.clone());
        filter.namespace_updated(&events[1].metadata, &b_selected.metadata);
        let a_plain = namespace("a", &[]);
        crate::test_support::apply(&mut writer, a_plain.clone());
        filter.namespace_updated(&events[0].metadata, &a_plain.metadata);

        assert_eq!(filter.members(), compute_members(&store, &payments_policy()));
    }
}
