//! Namespace controller
//!
//! Event handlers translate namespace, artifact, policy and bundle changes into
//! queue keys. Handlers never perform I/O; all writes happen in
//! [`NamespaceController::reconcile`], which reads the bundle at the time it
//! runs. Together with per-key serialization in the queue this is what keeps
//! an older bundle from overwriting a newer one.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::runtime::reflector::{ObjectRef, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactIdentity, ArtifactWriter};
use crate::bundle::BundleWatcher;
use crate::filter::NamespaceFilter;
use crate::informer::ResourceEvent;
use crate::policy::{PolicyWatcher, SelectionPolicy};
use crate::queue::{QueueConfig, ReconcileQueue, Reconciler};
use crate::reserved::ReservedNamespaces;
use crate::{Error, CA_ROOT_CERT_CONFIGMAP};

const TERMINATING: &str = "Terminating";

/// Whether a namespace is being deleted
pub fn is_terminating(ns: &Namespace) -> bool {
    ns.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == TERMINATING)
}

/// Collaborators the controller needs
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(namespaces, artifacts, bundle, writer)
///     .reserved(ReservedNamespaces::with_extra(extra))
///     .queue_config(QueueConfig { workers: 2, ..Default::default() })
///     .build();
/// ```
pub struct Context {
    /// Namespace cache
    pub namespaces: Store<Namespace>,
    /// Cache of existing root certificate ConfigMaps
    pub artifacts: Store<ConfigMap>,
    /// Current trust bundle
    pub bundle: Arc<BundleWatcher>,
    /// Artifact upsert (trait object for testability)
    pub writer: Arc<dyn ArtifactWriter>,
    /// Namespaces that never receive the artifact
    pub reserved: ReservedNamespaces,
    /// Queue tuning
    pub queue: QueueConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        namespaces: Store<Namespace>,
        artifacts: Store<ConfigMap>,
        bundle: Arc<BundleWatcher>,
        writer: Arc<dyn ArtifactWriter>,
    ) -> ContextBuilder {
        ContextBuilder {
            namespaces,
            artifacts,
            bundle,
            writer,
            reserved: ReservedNamespaces::default(),
            queue: QueueConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    namespaces: Store<Namespace>,
    artifacts: Store<ConfigMap>,
    bundle: Arc<BundleWatcher>,
    writer: Arc<dyn ArtifactWriter>,
    reserved: ReservedNamespaces,
    queue: QueueConfig,
}

impl ContextBuilder {
    /// Override the reserved namespace set
    pub fn reserved(mut self, reserved: ReservedNamespaces) -> Self {
        self.reserved = reserved;
        self
    }

    /// Override queue tuning
    pub fn queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            namespaces: self.namespaces,
            artifacts: self.artifacts,
            bundle: self.bundle,
            writer: self.writer,
            reserved: self.reserved,
            queue: self.queue,
        }
    }
}

/// Keeps the root certificate ConfigMap current in every selected namespace
pub struct NamespaceController {
    queue: ReconcileQueue,
    filter: NamespaceFilter,
    namespaces: Store<Namespace>,
    artifacts: Store<ConfigMap>,
    bundle: Arc<BundleWatcher>,
    writer: Arc<dyn ArtifactWriter>,
    reserved: ReservedNamespaces,
}

impl NamespaceController {
    /// Create the controller and register for policy changes
    ///
    /// Registration replays the policy current at that moment into the filter,
    /// so a replacement racing with construction is never lost. The policy
    /// handler holds only a weak reference, so dropping the controller turns
    /// later policy changes into no-ops.
    pub fn new(ctx: Context, policy: &PolicyWatcher) -> Arc<Self> {
        let filter = NamespaceFilter::new(ctx.namespaces.clone(), (*policy.policy()).clone());
        let controller = Arc::new(Self {
            queue: ReconcileQueue::with_config("namespaces", ctx.queue),
            filter,
            namespaces: ctx.namespaces,
            artifacts: ctx.artifacts,
            bundle: ctx.bundle,
            writer: ctx.writer,
            reserved: ctx.reserved,
        });

        let weak = Arc::downgrade(&controller);
        policy.watch(move |policy| {
            if let Some(controller) = weak.upgrade() {
                controller.on_policy_change(policy);
            }
        });

        controller
    }

    /// Membership filter
    pub fn filter(&self) -> &NamespaceFilter {
        &self.filter
    }

    /// Reconcile queue
    pub fn queue(&self) -> &ReconcileQueue {
        &self.queue
    }

    /// Handle a namespace change
    pub fn on_namespace_event(&self, event: ResourceEvent<Namespace>) {
        match event {
            ResourceEvent::Added(ns) => {
                if self.filter.namespace_created(&ns.metadata) {
                    self.namespace_change(&ns);
                }
            }
            ResourceEvent::Updated { old, new } => {
                let (changed, added) = self.filter.namespace_updated(&old.metadata, &new.metadata);
                if changed && added {
                    self.namespace_change(&new);
                }
            }
            ResourceEvent::DeleteKnown(ns) => {
                if let Some(name) = ns.metadata.name.as_deref() {
                    self.filter.namespace_deleted(name);
                }
            }
            ResourceEvent::DeleteUnknown(key) => self.filter.namespace_deleted(&key.name),
        }
    }

    /// Handle a change to a root certificate ConfigMap
    ///
    /// Deletes qualify too, so a removed artifact is recreated.
    pub fn on_artifact_event(&self, event: ResourceEvent<ConfigMap>) {
        if event.name().as_deref() != Some(CA_ROOT_CERT_CONFIGMAP) {
            return;
        }
        let Some(namespace) = event.namespace() else {
            return;
        };
        if !self.filter.filter(&namespace) {
            return;
        }
        self.sync_namespace(&namespace);
    }

    /// Recompute membership under a new policy and enqueue namespaces that joined
    pub fn on_policy_change(&self, policy: &SelectionPolicy) {
        let (added, removed) = self.filter.selectors_changed(policy.clone());
        info!(
            added = added.len(),
            removed = removed.len(),
            "selection policy changed"
        );
        for name in added {
            self.enqueue_existing(&name);
        }
    }

    /// Enqueue every member namespace for the current bundle
    pub fn on_bundle_rotated(&self) {
        let members = self.filter.members();
        info!(namespaces = members.len(), "trust bundle rotated, resyncing members");
        for name in members {
            self.enqueue_existing(&name);
        }
    }

    fn namespace_change(&self, ns: &Namespace) {
        let Some(name) = ns.metadata.name.as_deref() else {
            return;
        };
        if is_terminating(ns) {
            debug!(namespace = %name, "namespace terminating, skipping");
            return;
        }
        self.sync_namespace(name);
    }

    fn enqueue_existing(&self, name: &str) {
        match self.namespaces.get(&ObjectRef::new(name)) {
            None => debug!(namespace = %name, "namespace not in cache, skipping"),
            Some(ns) if is_terminating(&ns) => {
                debug!(namespace = %name, "namespace terminating, skipping")
            }
            Some(_) => self.sync_namespace(name),
        }
    }

    fn sync_namespace(&self, name: &str) {
        if self.reserved.contains(name) {
            return;
        }
        self.queue.add(name);
    }

    /// Listen for bundle rotations until `cancel` fires
    ///
    /// The watcher registration is released when this returns.
    pub async fn run_bundle_listener(&self, cancel: CancellationToken) {
        let mut subscription = self.bundle.subscribe();
        debug!(watcher = ?subscription.id(), "bundle listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = subscription.changed() => match signal {
                    Some(()) => self.on_bundle_rotated(),
                    None => {
                        warn!("bundle watcher registration removed, listener exiting");
                        break;
                    }
                },
            }
        }

        debug!("bundle listener stopped");
    }

    /// Wait for the caches, then process events until `cancel` fires
    ///
    /// Returns [`Error::CacheSync`] without processing anything when `cancel`
    /// fires before both caches are synced.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        info!("waiting for namespace and artifact caches to sync");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cache_sync("cancelled before caches synced"));
            }
            synced = async {
                tokio::try_join!(
                    self.namespaces.wait_until_ready(),
                    self.artifacts.wait_until_ready(),
                )
            } => {
                synced.map_err(|e| Error::cache_sync(e.to_string()))?;
            }
        }
        info!(members = self.filter.members().len(), "caches synced, starting workers");

        tokio::join!(
            self.run_bundle_listener(cancel.clone()),
            self.queue.run(self, cancel.clone()),
        );

        info!("namespace controller stopped");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for NamespaceController {
    async fn reconcile(&self, key: &str) -> Result<(), Error> {
        if self.reserved.contains(key) {
            debug!(namespace = %key, "reserved namespace, skipping");
            return Ok(());
        }
        if !self.filter.is_member(key) {
            debug!(namespace = %key, "namespace no longer selected, skipping");
            return Ok(());
        }
        if let Some(ns) = self.namespaces.get(&ObjectRef::new(key)) {
            if is_terminating(&ns) {
                debug!(namespace = %key, "namespace terminating, skipping");
                return Ok(());
            }
        }

        let bundle = self.bundle.ca_bundle();
        self.writer
            .upsert(&ArtifactIdentity::root_cert(key), &bundle)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MockArtifactWriter;
    use crate::policy::NamespaceSelector;
    use crate::test_support::{namespace, namespace_store, seeded_store, terminating_namespace};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn payments() -> SelectionPolicy {
        SelectionPolicy::new(vec![NamespaceSelector::labels([("team", "payments")])])
    }

    fn artifact(ns: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller_with(
        namespaces: Vec<Namespace>,
        policy: &PolicyWatcher,
        writer: MockArtifactWriter,
    ) -> Arc<NamespaceController> {
        let (ns_store, _ns_writer) = namespace_store(namespaces);
        let (cm_store, _cm_writer) = seeded_store::<ConfigMap>(vec![]);
        let ctx = Context::builder(
            ns_store,
            cm_store,
            Arc::new(BundleWatcher::new(b"B1".to_vec())),
            Arc::new(writer),
        )
        .build();
        NamespaceController::new(ctx, policy)
    }

    fn no_writes() -> MockArtifactWriter {
        let mut writer = MockArtifactWriter::new();
        writer.expect_upsert().never();
        writer
    }

    #[test]
    fn matching_namespace_add_enqueues() {
        let policy = PolicyWatcher::new(payments());
        let controller = controller_with(vec![], &policy, no_writes());

        controller.on_namespace_event(ResourceEvent::Added(Arc::new(namespace(
            "pay-a",
            &[("team", "payments")],
        ))));
        controller.on_namespace_event(ResourceEvent::Added(Arc::new(namespace("web", &[]))));

        assert_eq!(controller.queue().len(), 1);
        assert!(controller.filter().is_member("pay-a"));
    }

    #[test]
    fn terminating_namespace_is_not_enqueued() {
        let policy = PolicyWatcher::new(payments());
        let controller = controller_with(vec![], &policy, no_writes());

        let old = namespace("pay-a", &[]);
        let new = terminating_namespace("pay-a", &[("team", "payments")]);
        controller.on_namespace_event(ResourceEvent::Updated {
            old: Arc::new(old),
            new: Arc::new(new),
        });

        assert!(controller.queue().is_empty());
        assert!(controller.filter().is_member("pay-a"));
    }

    #[test]
    fn label_churn_on_member_does_not_enqueue() {
        let policy = PolicyWatcher::new(payments());
        let existing = namespace("pay-a", &[("team", "payments")]);
        let controller = controller_with(vec![existing.clone()], &policy, no_writes());

        controller.on_namespace_event(ResourceEvent::Updated {
            old: Arc::new(existing),
            new: Arc::new(namespace("pay-a", &[("team", "payments"), ("tier", "1")])),
        });
        assert!(controller.queue().is_empty());
    }

    #[test]
    fn reserved_namespace_is_never_enqueued() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_all());
        let controller = controller_with(vec![], &policy, no_writes());

        controller.on_namespace_event(ResourceEvent::Added(Arc::new(namespace(
            "kube-system",
            &[],
        ))));
        controller.on_artifact_event(ResourceEvent::DeleteKnown(Arc::new(artifact(
            "kube-system",
            CA_ROOT_CERT_CONFIGMAP,
        ))));

        assert!(controller.queue().is_empty());
    }

    #[test]
    fn artifact_events_are_gated_by_name_and_membership() {
        let policy = PolicyWatcher::new(payments());
        let controller = controller_with(
            vec![
                namespace("pay-a", &[("team", "payments")]),
                namespace("web", &[]),
            ],
            &policy,
            no_writes(),
        );

        controller.on_artifact_event(ResourceEvent::Added(Arc::new(artifact("pay-a", "other"))));
        controller.on_artifact_event(ResourceEvent::Added(Arc::new(artifact(
            "web",
            CA_ROOT_CERT_CONFIGMAP,
        ))));
        assert!(controller.queue().is_empty());

        controller.on_artifact_event(ResourceEvent::DeleteUnknown(
            ObjectRef::new(CA_ROOT_CERT_CONFIGMAP).within("pay-a"),
        ));
        assert_eq!(controller.queue().len(), 1);
    }

    #[test]
    fn namespace_delete_only_updates_membership() {
        let policy = PolicyWatcher::new(payments());
        let pay_a = namespace("pay-a", &[("team", "payments")]);
        let controller = controller_with(vec![pay_a.clone()], &policy, no_writes());

        controller.on_namespace_event(ResourceEvent::DeleteKnown(Arc::new(pay_a)));
        controller.on_namespace_event(ResourceEvent::DeleteUnknown(ObjectRef::new("other")));

        assert!(controller.queue().is_empty());
        assert!(controller.filter().members().is_empty());
    }

    #[test]
    fn policy_change_enqueues_only_added_live_namespaces() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_none());
        let controller = controller_with(
            vec![
                namespace("pay-a", &[("team", "payments")]),
                terminating_namespace("pay-old", &[("team", "payments")]),
                namespace("web", &[("team", "frontend")]),
            ],
            &policy,
            no_writes(),
        );

        assert!(policy.set_policy(payments()));

        assert_eq!(controller.queue().len(), 1);
        assert_eq!(
            controller.filter().members(),
            ["pay-a", "pay-old"]
                .iter()
                .map(|s| s.to_string())
                .collect::<std::collections::BTreeSet<_>>()
        );
    }

    #[test]
    fn policy_handler_is_inert_after_controller_drop() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_none());
        let controller = controller_with(vec![], &policy, no_writes());
        drop(controller);
        assert!(policy.set_policy(payments()));
    }

    #[test]
    fn policy_replaced_during_construction_is_not_lost() {
        for _ in 0..50 {
            let policy = Arc::new(PolicyWatcher::new(SelectionPolicy::select_none()));
            let setter = std::thread::spawn({
                let policy = policy.clone();
                move || policy.set_policy(payments())
            });

            let controller = controller_with(
                vec![
                    namespace("pay-a", &[("team", "payments")]),
                    namespace("web", &[]),
                ],
                &policy,
                no_writes(),
            );
            assert!(setter.join().unwrap());

            assert_eq!(
                controller.filter().members(),
                std::collections::BTreeSet::from(["pay-a".to_string()])
            );
        }
    }

    #[tokio::test]
    async fn reconcile_writes_current_bundle_for_members() {
        let mut writer = MockArtifactWriter::new();
        writer
            .expect_upsert()
            .withf(|id, payload| {
                id.namespace == "pay-a" && id.name == CA_ROOT_CERT_CONFIGMAP && payload == b"B1"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let policy = PolicyWatcher::new(payments());
        let controller = controller_with(
            vec![namespace("pay-a", &[("team", "payments")])],
            &policy,
            writer,
        );

        controller.reconcile("pay-a").await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_skips_reserved_non_member_and_terminating() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_all());
        let controller = controller_with(
            vec![
                namespace("kube-system", &[]),
                terminating_namespace("going", &[]),
            ],
            &policy,
            no_writes(),
        );

        controller.reconcile("kube-system").await.unwrap();
        controller.reconcile("going").await.unwrap();
        controller.reconcile("unknown").await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_propagates_writer_errors() {
        let mut writer = MockArtifactWriter::new();
        writer
            .expect_upsert()
            .returning(|_, _| Err(Error::bundle("bundle unavailable")));

        let policy = PolicyWatcher::new(SelectionPolicy::select_all());
        let controller = controller_with(vec![namespace("ns1", &[])], &policy, writer);

        assert!(controller.reconcile("ns1").await.is_err());
    }

    #[tokio::test]
    async fn bundle_rotation_enqueues_every_live_member() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_all());
        let (ns_store, _w) = namespace_store(vec![
            namespace("ns1", &[]),
            namespace("ns2", &[]),
            terminating_namespace("ns3", &[]),
            namespace("kube-system", &[]),
        ]);
        let (cm_store, _cw) = seeded_store::<ConfigMap>(vec![]);
        let bundle = Arc::new(BundleWatcher::new(b"B1".to_vec()));
        let ctx = Context::builder(ns_store, cm_store, bundle.clone(), Arc::new(no_writes()))
            .build();
        let controller = NamespaceController::new(ctx, &policy);

        let cancel = CancellationToken::new();
        let listener = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run_bundle_listener(cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while bundle.watcher_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        bundle.set_and_notify(b"B2".to_vec());
        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.queue().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        listener.await.unwrap();
        assert_eq!(controller.queue().len(), 2);
        assert_eq!(bundle.watcher_count(), 0);
    }

    #[tokio::test]
    async fn run_fails_when_cancelled_before_sync() {
        let policy = PolicyWatcher::new(SelectionPolicy::select_all());
        let (ns_store, _w) = kube::runtime::reflector::store::<Namespace>();
        let (cm_store, _cw) = kube::runtime::reflector::store::<ConfigMap>();
        let ctx = Context::builder(
            ns_store,
            cm_store,
            Arc::new(BundleWatcher::default()),
            Arc::new(no_writes()),
        )
        .build();
        let controller = NamespaceController::new(ctx, &policy);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller.run(cancel).await.unwrap_err();
        assert!(matches!(err, Error::CacheSync(_)));
    }
}
