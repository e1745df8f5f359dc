//! Coordination service contract and an in-memory backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::advertisement::{lookup_data_path, ServiceLookupData};
use crate::error::CoordinationError;

/// Bundle covering a namespace and the broker that currently serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDescriptor {
    pub namespace: String,
    /// Hash range of the bundle, e.g. `0x00000000_0xffffffff`.
    pub range: String,
    /// Web service URL of the owning broker, if the bundle is assigned.
    pub owner_url: Option<String>,
    /// Bumped every time ownership moves.
    pub version: u64,
}

/// Queries the cluster's coordination and metadata service.
///
/// Implementations return `Ok(None)` for "does not exist" and reserve
/// errors for the service itself failing.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    async fn bundle_descriptor(
        &self,
        namespace: &str,
    ) -> Result<Option<BundleDescriptor>, CoordinationError>;

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>, CoordinationError>;
}

/// Full-bundle range used by the in-memory backend.
pub const FULL_BUNDLE_RANGE: &str = "0x00000000_0xffffffff";

/// Coordination backend held in process memory.
///
/// Serves static deployments and tests; optional latency and an outage switch
/// let tests exercise timeouts and transport failures.
#[derive(Debug, Default)]
pub struct InMemoryCoordination {
    bundles: RwLock<HashMap<String, BundleDescriptor>>,
    data: RwLock<HashMap<String, Bytes>>,
    latency: RwLock<Option<Duration>>,
    unavailable: AtomicBool,
    bundle_queries: AtomicUsize,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a broker's lookup data under its web service URL.
    pub fn register_broker(&self, data: &ServiceLookupData) -> Result<(), CoordinationError> {
        let url = data
            .web_service_url
            .as_deref()
            .ok_or_else(|| CoordinationError("lookup data has no webServiceUrl".into()))?;
        let path = lookup_data_path(url)
            .ok_or_else(|| CoordinationError(format!("invalid web service URL {url:?}")))?;
        let json = serde_json::to_vec(data).map_err(|e| CoordinationError(e.to_string()))?;
        self.data.write().insert(path, Bytes::from(json));
        Ok(())
    }

    /// Store raw bytes at a metadata path.
    pub fn put_data(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.data.write().insert(path.into(), data.into());
    }

    pub fn remove_data(&self, path: &str) {
        self.data.write().remove(path);
    }

    /// Assign a namespace's bundle to the broker at `owner_url`.
    ///
    /// Returns the new ownership version.
    pub fn assign(&self, namespace: &str, owner_url: impl Into<String>) -> u64 {
        let mut bundles = self.bundles.write();
        let version = bundles.get(namespace).map_or(1, |b| b.version + 1);
        bundles.insert(
            namespace.to_owned(),
            BundleDescriptor {
                namespace: namespace.to_owned(),
                range: FULL_BUNDLE_RANGE.to_owned(),
                owner_url: Some(owner_url.into()),
                version,
            },
        );
        version
    }

    /// Keep the bundle but drop its owner, as during a transfer.
    pub fn unassign(&self, namespace: &str) {
        if let Some(bundle) = self.bundles.write().get_mut(namespace) {
            bundle.owner_url = None;
            bundle.version += 1;
        }
    }

    pub fn remove_namespace(&self, namespace: &str) {
        self.bundles.write().remove(namespace);
    }

    /// Delay every query by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Make every query fail with a transport error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of bundle queries served so far.
    pub fn bundle_queries(&self) -> usize {
        self.bundle_queries.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), CoordinationError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError("coordination service unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for InMemoryCoordination {
    async fn bundle_descriptor(
        &self,
        namespace: &str,
    ) -> Result<Option<BundleDescriptor>, CoordinationError> {
        self.bundle_queries.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.bundles.read().get(namespace).cloned())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>, CoordinationError> {
        self.simulate().await?;
        Ok(self.data.read().get(path).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_bumps_version() {
        let coordination = InMemoryCoordination::new();
        assert_eq!(coordination.assign("ns", "http://b1:8080"), 1);
        assert_eq!(coordination.assign("ns", "http://b2:8080"), 2);

        let bundle = coordination.bundle_descriptor("ns").await.unwrap().unwrap();
        assert_eq!(bundle.owner_url.as_deref(), Some("http://b2:8080"));
        assert_eq!(bundle.version, 2);
        assert!(coordination.bundle_descriptor("other").await.unwrap().is_none());
        assert_eq!(coordination.bundle_queries(), 2);
    }

    #[tokio::test]
    async fn test_register_broker_stores_json() {
        let coordination = InMemoryCoordination::new();
        let data = ServiceLookupData {
            web_service_url: Some("http://10.0.0.5:8080".into()),
            ..Default::default()
        }
        .with_protocol("amqp", "10.0.0.5:5673");
        coordination.register_broker(&data).unwrap();

        let raw = coordination
            .get_data("/loadbalance/brokers/10.0.0.5:8080")
            .await
            .unwrap()
            .unwrap();
        let parsed: ServiceLookupData = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed, data);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let coordination = InMemoryCoordination::new();
        coordination.set_unavailable(true);
        assert!(coordination.bundle_descriptor("ns").await.is_err());
    }
}
