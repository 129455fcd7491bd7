//! Root certificate ConfigMap writer
//!
//! The artifact is a ConfigMap with a fixed name and label set, holding the
//! trust bundle under a single key. The writer compares the desired state with
//! the cached ConfigMap and only talks to the API server when something differs;
//! the write itself is a server-side apply, which creates the object when it is
//! absent and updates it in place otherwise.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, ARTIFACT_LABEL_KEY, ARTIFACT_LABEL_VALUE, CA_ROOT_CERT_CONFIGMAP, FIELD_MANAGER};

/// Identity of one artifact: where it lives, what it is called, how it is labelled
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactIdentity {
    /// Target namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Labels the object must carry
    pub labels: BTreeMap<String, String>,
}

impl ArtifactIdentity {
    /// The root certificate ConfigMap for a namespace
    pub fn root_cert(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: CA_ROOT_CERT_CONFIGMAP.to_string(),
            labels: BTreeMap::from([(
                ARTIFACT_LABEL_KEY.to_string(),
                ARTIFACT_LABEL_VALUE.to_string(),
            )]),
        }
    }
}

/// Create-or-update of a single artifact
///
/// Implementations must avoid the write when the observed object already
/// carries the desired labels and payload.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Make the artifact at `identity` carry `payload`
    async fn upsert(&self, identity: &ArtifactIdentity, payload: &[u8]) -> Result<(), Error>;
}

/// Writes the artifact as a ConfigMap via server-side apply
pub struct ConfigMapWriter {
    client: Client,
    cache: Store<ConfigMap>,
    data_key: String,
}

impl ConfigMapWriter {
    /// Create a writer that reads current state from `cache`
    pub fn new(client: Client, cache: Store<ConfigMap>, data_key: impl Into<String>) -> Self {
        Self {
            client,
            cache,
            data_key: data_key.into(),
        }
    }
}

#[async_trait]
impl ArtifactWriter for ConfigMapWriter {
    async fn upsert(&self, identity: &ArtifactIdentity, payload: &[u8]) -> Result<(), Error> {
        let key = ObjectRef::new(&identity.name).within(&identity.namespace);
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &identity.namespace);
        if let Some(current) = self.cache.get(&key) {
            if !needs_update(&current, identity, &self.data_key, payload) {
                debug!(
                    namespace = %identity.namespace,
                    name = %identity.name,
                    "artifact up to date, skipping write"
                );
                return Ok(());
            }
            // The API server rejects a key present in both data and binaryData
            if let Some(patch) = stale_key_patch(&current, &self.data_key, payload) {
                api.patch(&identity.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(
                    namespace = %identity.namespace,
                    name = %identity.name,
                    "cleared payload key from the unused field"
                );
            }
        }

        let desired = desired_configmap(identity, &self.data_key, payload);
        api.patch(
            &identity.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&desired),
        )
        .await?;

        info!(
            namespace = %identity.namespace,
            name = %identity.name,
            bytes = payload.len(),
            "artifact written"
        );
        Ok(())
    }
}

/// Build the desired ConfigMap; UTF-8 payloads go to `data`, others to `binaryData`
pub fn desired_configmap(identity: &ArtifactIdentity, data_key: &str, payload: &[u8]) -> ConfigMap {
    let (data, binary_data) = match std::str::from_utf8(payload) {
        Ok(text) => (
            Some(BTreeMap::from([(data_key.to_string(), text.to_string())])),
            None,
        ),
        Err(_) => (
            None,
            Some(BTreeMap::from([(
                data_key.to_string(),
                ByteString(payload.to_vec()),
            )])),
        ),
    };

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(identity.name.clone()),
            namespace: Some(identity.namespace.clone()),
            labels: Some(identity.labels.clone()),
            ..Default::default()
        },
        data,
        binary_data,
        ..Default::default()
    }
}

/// Merge patch removing `data_key` from the field the payload will not occupy
///
/// Server-side apply only prunes fields this manager owns, so a copy of the key
/// left in the other field by another writer has to be removed explicitly.
pub fn stale_key_patch(
    current: &ConfigMap,
    data_key: &str,
    payload: &[u8],
) -> Option<serde_json::Value> {
    let field = if std::str::from_utf8(payload).is_ok() {
        current
            .binary_data
            .as_ref()
            .filter(|data| data.contains_key(data_key))
            .map(|_| "binaryData")
    } else {
        current
            .data
            .as_ref()
            .filter(|data| data.contains_key(data_key))
            .map(|_| "data")
    }?;

    let mut cleared = serde_json::Map::new();
    cleared.insert(data_key.to_string(), serde_json::Value::Null);
    let mut patch = serde_json::Map::new();
    patch.insert(field.to_string(), serde_json::Value::Object(cleared));
    Some(serde_json::Value::Object(patch))
}

/// Whether `current` differs from the desired labels or payload
pub fn needs_update(
    current: &ConfigMap,
    identity: &ArtifactIdentity,
    data_key: &str,
    payload: &[u8],
) -> bool {
    let labels_match = identity.labels.iter().all(|(k, v)| {
        current
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(k))
            == Some(v)
    });

    let text = current
        .data
        .as_ref()
        .and_then(|data| data.get(data_key))
        .map(|s| s.as_bytes());
    let binary = current
        .binary_data
        .as_ref()
        .and_then(|data| data.get(data_key))
        .map(|b| b.0.as_slice());

    !labels_match || text.or(binary) != Some(payload)
}
