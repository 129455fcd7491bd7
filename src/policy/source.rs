//! ConfigMap-backed policy source
//!
//! The policy document lives under the `config` key of a ConfigMap in the
//! controller's namespace. A missing ConfigMap or a blank key means "use the
//! start-up default". Invalid documents are fatal at start-up and ignored
//! (previous policy kept) afterwards.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PolicyWatcher, SelectionPolicy};
use crate::{Error, POLICY_CONFIG_KEY};

/// Extract the selection policy from an (optional) ConfigMap
pub fn policy_from_configmap(
    cm: Option<&ConfigMap>,
    fallback: &SelectionPolicy,
) -> Result<SelectionPolicy, Error> {
    let doc = cm
        .and_then(|cm| cm.data.as_ref())
        .and_then(|data| data.get(POLICY_CONFIG_KEY));

    match doc {
        Some(doc) => Ok(SelectionPolicy::from_yaml(doc)?.unwrap_or_else(|| fallback.clone())),
        None => Ok(fallback.clone()),
    }
}

/// Read the policy ConfigMap once; any parse or validation error is returned
pub async fn load_policy(
    client: &Client,
    namespace: &str,
    name: &str,
    fallback: &SelectionPolicy,
) -> Result<SelectionPolicy, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let cm = api.get_opt(name).await?;
    if cm.is_none() {
        info!(%namespace, %name, "policy ConfigMap not found, using default policy");
    }
    policy_from_configmap(cm.as_ref(), fallback)
}

/// Watch the policy ConfigMap and push every valid change into `watcher`
///
/// Runs until `cancel` fires.
pub async fn run_policy_configmap_source(
    client: Client,
    namespace: String,
    name: String,
    fallback: SelectionPolicy,
    watcher: Arc<PolicyWatcher>,
    cancel: CancellationToken,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let stream = watcher::watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);

    // Set on relist when the ConfigMap is seen, so a deletion that happened
    // while the watch was down still resets to the default.
    let mut seen_in_relist = false;

    info!(%namespace, %name, "policy source started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Ok(Event::Apply(cm)) => apply(&watcher, Some(&cm), &fallback),
            Ok(Event::InitApply(cm)) => {
                seen_in_relist = true;
                apply(&watcher, Some(&cm), &fallback);
            }
            Ok(Event::Delete(_)) => {
                info!(%name, "policy ConfigMap deleted, reverting to default policy");
                apply(&watcher, None, &fallback);
            }
            Ok(Event::Init) => seen_in_relist = false,
            Ok(Event::InitDone) => {
                if !seen_in_relist {
                    apply(&watcher, None, &fallback);
                }
                debug!(%name, "policy watch synced");
            }
            Err(e) => warn!(error = %e, %name, "policy watch error, will retry"),
        }
    }

    info!(%name, "policy source stopped");
}

fn apply(watcher: &PolicyWatcher, cm: Option<&ConfigMap>, fallback: &SelectionPolicy) {
    match policy_from_configmap(cm, fallback) {
        Ok(policy) => {
            if watcher.set_policy(policy) {
                info!("selection policy updated");
            }
        }
        Err(e) => error!(error = %e, "invalid selection policy, keeping previous policy"),
    }
}
