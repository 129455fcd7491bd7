//! Sources that feed the trust bundle broadcaster
//!
//! Two sources are supported:
//!
//! - a PEM file on disk (mounted Secret or CA sidecar output), polled on an
//!   interval
//! - a Kubernetes Secret holding the CA certificate, watched
//!
//! Both keep the previous bundle when the new one cannot be read, so a
//! half-written file or a Secret missing its key never blanks the artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundle::BundleWatcher;
use crate::Error;

/// Read a bundle file, rejecting empty content
pub async fn load_bundle_file(path: &Path) -> Result<Vec<u8>, Error> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::bundle(format!("failed to read {}: {}", path.display(), e)))?;
    if bytes.is_empty() {
        return Err(Error::bundle(format!("{} is empty", path.display())));
    }
    Ok(bytes)
}

/// Poll a bundle file and publish changes
///
/// Runs until `cancel` fires.
pub async fn run_file_bundle_source(
    path: PathBuf,
    poll_interval: Duration,
    watcher: Arc<BundleWatcher>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(path = %path.display(), "bundle file source started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match load_bundle_file(&path).await {
                    Ok(bytes) => {
                        if watcher.set_and_notify(bytes) {
                            info!(path = %path.display(), "root certificate changed on disk");
                        }
                    }
                    Err(e) => warn!(error = %e, "keeping previous trust bundle"),
                }
            }
        }
    }

    info!(path = %path.display(), "bundle file source stopped");
}

/// Extract the bundle bytes from a Secret
pub fn bundle_from_secret(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|value| value.clone().into_bytes())
        })
        .filter(|bytes| !bytes.is_empty())
}

/// Read the bundle Secret once
pub async fn load_secret_bundle(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(name).await?;
    bundle_from_secret(&secret, key).ok_or_else(|| {
        Error::bundle(format!(
            "secret {}/{} has no non-empty key {}",
            namespace, name, key
        ))
    })
}

/// Watch the bundle Secret and publish changes
///
/// Deleting the Secret does not clear the bundle. Runs until `cancel` fires.
pub async fn run_secret_bundle_source(
    client: Client,
    namespace: String,
    name: String,
    key: String,
    watcher: Arc<BundleWatcher>,
    cancel: CancellationToken,
) {
    let api: Api<Secret> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
    let stream = watcher::watcher(api, config).default_backoff();
    let mut stream = std::pin::pin!(stream);

    info!(%namespace, %name, "bundle secret source started");

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Ok(Event::Apply(secret)) | Ok(Event::InitApply(secret)) => {
                match bundle_from_secret(&secret, &key) {
                    Some(bytes) => {
                        if watcher.set_and_notify(bytes) {
                            info!(%name, "root certificate changed in secret");
                        }
                    }
                    None => warn!(%name, %key, "bundle secret missing key, keeping previous trust bundle"),
                }
            }
            Ok(Event::Delete(_)) => {
                warn!(%name, "bundle secret deleted, keeping previous trust bundle")
            }
            Ok(Event::Init) | Ok(Event::InitDone) => debug!(%name, "bundle secret watch (re)listed"),
            Err(e) => warn!(error = %e, %name, "bundle secret watch error, will retry"),
        }
    }

    info!(%name, "bundle secret source stopped");
}
