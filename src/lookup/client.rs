//! Namespace owner resolution.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::advertisement::{lookup_data_path, BrokerEndpoint, ServiceLookupData};
use super::cache::{Ownership, OwnershipCache};
use super::coordination::CoordinationClient;
use super::namespace::NamespaceName;
use crate::config::LookupConfig;
use crate::error::{CoordinationError, LookupError};

/// Resolves which broker owns a namespace.
///
/// Holds an injected coordination client and the shared ownership cache;
/// clone freely, clones share the cache.
#[derive(Clone)]
pub struct LookupClient {
    coordination: Arc<dyn CoordinationClient>,
    cache: Arc<OwnershipCache>,
    protocol_name: Arc<str>,
    tenant: Option<Arc<str>>,
    timeout: Duration,
}

impl std::fmt::Debug for LookupClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupClient")
            .field("protocol_name", &self.protocol_name)
            .field("tenant", &self.tenant)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LookupClient {
    pub fn new(coordination: Arc<dyn CoordinationClient>, config: &LookupConfig) -> Self {
        Self {
            coordination,
            cache: Arc::new(OwnershipCache::new(config.ownership_ttl())),
            protocol_name: Arc::from(config.protocol_name.as_str()),
            tenant: config.tenant.as_deref().map(Arc::from),
            timeout: config.timeout(),
        }
    }

    pub fn cache(&self) -> &Arc<OwnershipCache> {
        &self.cache
    }

    /// Namespace addressed by a virtual host under this client's tenant.
    pub fn namespace_for(&self, virtual_host: &str) -> NamespaceName {
        NamespaceName::from_virtual_host(virtual_host, self.tenant.as_deref())
    }

    /// Resolve the owner of `namespace`, from cache or by a single-flight query.
    pub async fn resolve(&self, namespace: &str) -> Result<Ownership, LookupError> {
        let coordination = Arc::clone(&self.coordination);
        let protocol = Arc::clone(&self.protocol_name);
        let timeout = self.timeout;
        let ns = namespace.to_owned();

        self.cache
            .get_or_resolve(namespace, move || async move {
                match tokio::time::timeout(timeout, query_owner(&*coordination, &ns, &protocol)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(namespace = %ns, ?timeout, "ownership lookup timed out");
                        Err(LookupError::Timeout {
                            namespace: ns,
                            after: timeout,
                        })
                    }
                }
            })
            .await
    }

    /// Forget the cached owner. See [`OwnershipCache::invalidate`].
    pub fn invalidate(&self, namespace: &str, version: Option<u64>) -> bool {
        self.cache.invalidate(namespace, version)
    }
}

fn not_found(namespace: &str, reason: impl Into<String>) -> LookupError {
    LookupError::BrokerNotFound {
        namespace: namespace.to_owned(),
        reason: reason.into(),
    }
}

fn transport(namespace: &str) -> impl FnOnce(CoordinationError) -> LookupError + '_ {
    move |err| LookupError::TransportFailure {
        namespace: namespace.to_owned(),
        message: err.0,
    }
}

/// Walk bundle, owner, lookup data, protocol advertisement.
async fn query_owner(
    coordination: &dyn CoordinationClient,
    namespace: &str,
    protocol: &str,
) -> Result<Ownership, LookupError> {
    let bundle = coordination
        .bundle_descriptor(namespace)
        .await
        .map_err(transport(namespace))?
        .ok_or_else(|| not_found(namespace, "no bundle descriptor"))?;

    let owner_url = bundle
        .owner_url
        .as_deref()
        .ok_or_else(|| not_found(namespace, format!("bundle {} has no owner", bundle.range)))?;

    let path = lookup_data_path(owner_url).ok_or_else(|| LookupError::InvalidAdvertisement {
        namespace: namespace.to_owned(),
        advertisement: owner_url.to_owned(),
    })?;

    let raw = coordination
        .get_data(&path)
        .await
        .map_err(transport(namespace))?
        .ok_or_else(|| not_found(namespace, format!("no lookup data at {path}")))?;

    let data: ServiceLookupData =
        serde_json::from_slice(&raw).map_err(|_| LookupError::InvalidAdvertisement {
            namespace: namespace.to_owned(),
            advertisement: String::from_utf8_lossy(&raw).into_owned(),
        })?;

    let advertisement = data
        .protocol(protocol)
        .ok_or_else(|| not_found(namespace, format!("owner {owner_url} advertises no {protocol} listener")))?;

    let endpoint = BrokerEndpoint::from_advertisement(advertisement).ok_or_else(|| {
        LookupError::InvalidAdvertisement {
            namespace: namespace.to_owned(),
            advertisement: advertisement.to_owned(),
        }
    })?;

    debug!(namespace, %endpoint, version = bundle.version, "resolved namespace owner");
    Ok(Ownership {
        namespace: namespace.to_owned(),
        endpoint,
        version: bundle.version,
    })
}
