//! Fixtures shared by unit tests

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, NamespaceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher::Event;
use kube::Resource;

/// An Active namespace with the given labels
pub fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        status: Some(NamespaceStatus {
            phase: Some("Active".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A namespace that is being deleted
pub fn terminating_namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
    let mut ns = namespace(name, labels);
    ns.status = Some(NamespaceStatus {
        phase: Some("Terminating".to_string()),
        ..Default::default()
    });
    ns
}

/// A ready store seeded with `items`
pub fn namespace_store(items: Vec<Namespace>) -> (Store<Namespace>, Writer<Namespace>) {
    seeded_store(items)
}

/// A ready store of any kind seeded with `items`
pub fn seeded_store<K>(items: Vec<K>) -> (Store<K>, Writer<K>)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Default,
{
    let (store, mut writer) = reflector::store();
    writer.apply_watcher_event(&Event::Init);
    for item in items {
        writer.apply_watcher_event(&Event::InitApply(item));
    }
    writer.apply_watcher_event(&Event::InitDone);
    (store, writer)
}

/// Apply a single object to a store
pub fn apply<K>(writer: &mut Writer<K>, obj: K)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    writer.apply_watcher_event(&Event::Apply(obj));
}
