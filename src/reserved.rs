//! Reserved namespace registry
//!
//! Namespaces that never receive the root certificate artifact, whatever the
//! selection policy says. The veto is applied where events are classified and
//! again inside the reconciler; the membership filter itself stays pure.

use std::collections::BTreeSet;

/// Core Kubernetes namespaces
pub const CORE: &[&str] = &["kube-system", "kube-public", "kube-node-lease"];

/// Local development storage provisioner (kind, k3d)
pub const LOCAL_DEV: &[&str] = &["local-path-storage"];

/// Built-in reserved namespaces, sorted and deduplicated
pub fn defaults() -> Vec<&'static str> {
    let mut namespaces: Vec<&'static str> =
        CORE.iter().chain(LOCAL_DEV.iter()).copied().collect();

    namespaces.sort();
    namespaces.dedup();
    namespaces
}

/// The set of namespaces excluded from distribution
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedNamespaces {
    names: BTreeSet<String>,
}

impl Default for ReservedNamespaces {
    fn default() -> Self {
        Self::with_extra(std::iter::empty::<String>())
    }
}

impl ReservedNamespaces {
    /// Built-in defaults plus operator-supplied extras
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: BTreeSet<String> = defaults().into_iter().map(String::from).collect();
        names.extend(
            extra
                .into_iter()
                .map(Into::into)
                .filter(|name: &String| !name.is_empty()),
        );
        Self { names }
    }

    /// Check whether a namespace is reserved
    pub fn contains(&self, namespace: &str) -> bool {
        self.names.contains(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sorted_and_unique() {
        let namespaces = defaults();

        let mut sorted = namespaces.clone();
        sorted.sort();
        assert_eq!(namespaces, sorted);

        let mut deduped = namespaces.clone();
        deduped.dedup();
        assert_eq!(namespaces.len(), deduped.len());
    }

    #[test]
    fn defaults_include_kubernetes_system_namespaces() {
        let reserved = ReservedNamespaces::default();
        assert!(reserved.contains("kube-system"));
        assert!(reserved.contains("kube-public"));
        assert!(reserved.contains("kube-node-lease"));
        assert!(reserved.contains("local-path-storage"));
        assert!(!reserved.contains("default"));
    }

    #[test]
    fn extras_extend_defaults_and_skip_blanks() {
        let reserved = ReservedNamespaces::with_extra(["istio-system", ""]);
        assert!(reserved.contains("istio-system"));
        assert!(reserved.contains("kube-system"));
        assert!(!reserved.contains(""));
        assert_eq!(reserved.names.len(), defaults().len() + 1);
    }
}
