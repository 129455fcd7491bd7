//! Watch-backed local cache that emits typed change events
//!
//! An [`Informer`] drives a kube-rs watch stream into a reflector [`Store`]
//! and reports each change as a [`ResourceEvent`]. Because the informer looks
//! at the store before applying a change, it can hand out the previous object
//! on updates and can tell apart:
//!
//! - deletes it observed directly ([`ResourceEvent::DeleteKnown`]), and
//! - objects that disappeared while the watch was down and were only noticed
//!   on relist ([`ResourceEvent::DeleteUnknown`]), reported by key.
//!
//! Handlers run inline on the informer task and must not block.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change observed by an informer
pub enum ResourceEvent<K: Resource> {
    /// Object seen for the first time
    Added(Arc<K>),
    /// Object changed; carries the previously cached version
    Updated {
        /// Cached object before the change
        old: Arc<K>,
        /// Object after the change
        new: Arc<K>,
    },
    /// Object deleted, final state known
    DeleteKnown(Arc<K>),
    /// Object vanished while the watch was interrupted; only its key is certain
    DeleteUnknown(ObjectRef<K>),
}

impl<K: Resource> ResourceEvent<K> {
    /// Name of the affected object
    pub fn name(&self) -> Option<String> {
        match self {
            Self::Added(obj) | Self::DeleteKnown(obj) | Self::Updated { new: obj, .. } => {
                obj.meta().name.clone()
            }
            Self::DeleteUnknown(key) => Some(key.name.clone()),
        }
    }

    /// Namespace of the affected object (None for cluster-scoped kinds)
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Added(obj) | Self::DeleteKnown(obj) | Self::Updated { new: obj, .. } => {
                obj.meta().namespace.clone()
            }
            Self::DeleteUnknown(key) => key.namespace.clone(),
        }
    }
}

/// Local cache of one resource kind fed by a watch stream
pub struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: &'static str,
    reader: Store<K>,
    writer: Writer<K>,
    relist: Vec<Arc<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Create an informer with an empty cache
    pub fn new(name: &'static str) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            name,
            reader,
            writer,
            relist: Vec::new(),
        }
    }

    /// Read handle onto the cache; becomes ready after the first full list
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Consume `stream` until it ends or `cancel` fires, calling `handler` per change
    pub async fn run<S, F>(mut self, stream: S, handler: F, cancel: CancellationToken)
    where
        S: Stream<Item = Result<Event<K>, watcher::Error>>,
        F: Fn(ResourceEvent<K>),
    {
        let mut stream = std::pin::pin!(stream);
        info!(informer = self.name, "informer started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                Ok(event) => {
                    for change in self.apply(event) {
                        handler(change);
                    }
                }
                Err(e) => warn!(informer = self.name, error = %e, "watch error, will retry"),
            }
        }

        info!(informer = self.name, "informer stopped");
    }

    /// Apply one watch event to the cache and derive the resulting changes
    pub fn apply(&mut self, event: Event<K>) -> Vec<ResourceEvent<K>> {
        let changes = match &event {
            Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let new = Arc::new(obj.clone());
                match self.reader.get(&key) {
                    Some(old) if same_version(old.as_ref(), new.as_ref()) => vec![],
                    Some(old) => vec![ResourceEvent::Updated { old, new }],
                    None => vec![ResourceEvent::Added(new)],
                }
            }
            Event::Delete(obj) => vec![ResourceEvent::DeleteKnown(Arc::new(obj.clone()))],
            Event::Init => {
                self.relist.clear();
                vec![]
            }
            Event::InitApply(obj) => {
                self.relist.push(Arc::new(obj.clone()));
                vec![]
            }
            Event::InitDone => self.diff_relist(),
        };

        self.writer.apply_watcher_event(&event);
        changes
    }

    fn diff_relist(&mut self) -> Vec<ResourceEvent<K>> {
        let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
            .reader
            .state()
            .into_iter()
            .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
            .collect();

        let mut changes = Vec::new();
        for new in self.relist.drain(..) {
            match previous.remove(&ObjectRef::from_obj(new.as_ref())) {
                Some(old) if same_version(old.as_ref(), new.as_ref()) => {}
                Some(old) => changes.push(ResourceEvent::Updated { old, new }),
                None => changes.push(ResourceEvent::Added(new)),
            }
        }

        let mut vanished: Vec<ObjectRef<K>> = previous.into_keys().collect();
        vanished.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        changes.extend(vanished.into_iter().map(ResourceEvent::DeleteUnknown));

        debug!(informer = self.name, changes = changes.len(), "relist applied");
        changes
    }
}

fn same_version<K: Resource>(old: &K, new: &K) -> bool {
    match (&old.meta().resource_version, &new.meta().resource_version) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
