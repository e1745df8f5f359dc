//! Single-flight namespace ownership cache.
//!
//! At most one query per namespace is in flight. Callers arriving while it
//! runs subscribe to the same `watch` channel and all receive the identical
//! result. The query runs in its own task, so a caller that goes away (client
//! disconnected) does not cancel the lookup for everyone else.
//!
//! Failures are never cached; the next caller starts a fresh query.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::advertisement::BrokerEndpoint;
use crate::error::LookupError;

/// A resolved namespace owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub namespace: String,
    pub endpoint: BrokerEndpoint,
    /// Ownership version from the bundle descriptor.
    pub version: u64,
}

type Shared = Option<Result<Ownership, LookupError>>;

#[derive(Debug)]
enum Entry {
    Resolved {
        ownership: Ownership,
        expires_at: Instant,
    },
    InFlight {
        generation: u64,
        rx: watch::Receiver<Shared>,
    },
}

#[derive(Debug)]
pub struct OwnershipCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl OwnershipCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    /// Return the cached owner, or join/start the query for it.
    ///
    /// `fetch` is only called when this caller starts a new query.
    pub async fn get_or_resolve<F, Fut>(
        self: &Arc<Self>,
        namespace: &str,
        fetch: F,
    ) -> Result<Ownership, LookupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Ownership, LookupError>> + Send + 'static,
    {
        let mut rx = {
            let mut entries = self.entries.lock();
            match entries.get(namespace) {
                Some(Entry::Resolved {
                    ownership,
                    expires_at,
                }) if *expires_at > Instant::now() => {
                    trace!(namespace, endpoint = %ownership.endpoint, "ownership cache hit");
                    return Ok(ownership.clone());
                }
                Some(Entry::InFlight { rx, .. }) => {
                    trace!(namespace, "joining in-flight lookup");
                    rx.clone()
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let (tx, rx) = watch::channel(None);
                    entries.insert(
                        namespace.to_owned(),
                        Entry::InFlight {
                            generation,
                            rx: rx.clone(),
                        },
                    );
                    debug!(namespace, generation, "starting ownership lookup");

                    let query = fetch();
                    let cache = Arc::clone(self);
                    let ns = namespace.to_owned();
                    tokio::spawn(async move {
                        let result = query.await;
                        cache.complete(&ns, generation, &result);
                        let _ = tx.send(Some(result));
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(LookupError::TransportFailure {
                namespace: namespace.to_owned(),
                message: "lookup task ended without a result".into(),
            })
        })
    }

    fn complete(&self, namespace: &str, generation: u64, result: &Result<Ownership, LookupError>) {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(namespace),
            Some(Entry::InFlight { generation: g, .. }) if *g == generation
        );
        if !current {
            return;
        }
        match result {
            Ok(ownership) => {
                entries.insert(
                    namespace.to_owned(),
                    Entry::Resolved {
                        ownership: ownership.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            Err(_) => {
                entries.remove(namespace);
            }
        }
    }

    /// Drop a resolved entry.
    ///
    /// With `version`, only an entry of exactly that version is dropped, so a
    /// failure against an old owner cannot evict a newer resolution. In-flight
    /// queries are left alone. Returns whether an entry was removed.
    pub fn invalidate(&self, namespace: &str, version: Option<u64>) -> bool {
        let mut entries = self.entries.lock();
        let matches = match entries.get(namespace) {
            Some(Entry::Resolved { ownership, .. }) => {
                version.map_or(true, |v| v == ownership.version)
            }
            _ => false,
        };
        if matches {
            entries.remove(namespace);
            debug!(namespace, ?version, "ownership invalidated");
        }
        matches
    }

    /// Cached owner, if resolved and not expired.
    pub fn get(&self, namespace: &str) -> Option<Ownership> {
        match self.entries.lock().get(namespace) {
            Some(Entry::Resolved {
                ownership,
                expires_at,
            }) if *expires_at > Instant::now() => Some(ownership.clone()),
            _ => None,
        }
    }

    pub fn is_in_flight(&self, namespace: &str) -> bool {
        matches!(self.entries.lock().get(namespace), Some(Entry::InFlight { .. }))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
