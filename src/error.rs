//! Error types for the trust bundle distribution controller

use thiserror::Error;

/// Main error type for trustsync operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid selection policy or configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Informer caches never reported synced
    #[error("cache sync error: {0}")]
    CacheSync(String),

    /// Trust bundle could not be loaded
    #[error("bundle error: {0}")]
    Bundle(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a cache sync error with the given message
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync(msg.into())
    }

    /// Create a bundle error with the given message
    pub fn bundle(msg: impl Into<String>) -> Self {
        Self::Bundle(msg.into())
    }

    /// Whether retrying the failed operation can succeed without outside change
    ///
    /// Kubernetes API failures and missing bundles are transient. A bad policy
    /// or an unparseable document stays bad until someone edits it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::Bundle(_) | Self::CacheSync(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
