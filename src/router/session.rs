//! Attaching a client session to the broker that owns its namespace.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::upstream::{open_upstream, UpstreamConnection};
use crate::config::RoutingConfig;
use crate::connection::{ClientHandshake, TuneParams};
use crate::error::{Result, RoutingError};
use crate::lookup::{LookupClient, NamespaceName, Ownership};
use crate::method::MethodRegistry;
use crate::protocol::{Frame, FrameReader};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Resolves owners and opens broker sessions, retrying with backoff.
#[derive(Debug, Clone)]
pub struct SessionRouter {
    lookup: LookupClient,
    registry: Arc<MethodRegistry>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    writer_config: WriterConfig,
}

/// A client session attached to its owning broker.
#[derive(Debug)]
pub struct RoutedSession {
    pub namespace: NamespaceName,
    pub ownership: Ownership,
    pub upstream: FrameReader<OwnedReadHalf>,
    pub upstream_writer: WriterHandle,
    pub upstream_task: JoinHandle<Result<()>>,
    /// The broker's open-ok, to be relayed to the client.
    pub open_ok: Frame,
    pub tune: TuneParams,
}

impl SessionRouter {
    pub fn new(
        lookup: LookupClient,
        registry: Arc<MethodRegistry>,
        config: &RoutingConfig,
        writer_config: WriterConfig,
    ) -> Self {
        Self {
            lookup,
            registry,
            retry: RetryPolicy::from_config(config),
            connect_timeout: config.connect_timeout,
            writer_config,
        }
    }

    pub fn lookup(&self) -> &LookupClient {
        &self.lookup
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Resolve the owner of the client's virtual host and open the session there.
    ///
    /// A failed connect or handshake invalidates the ownership it used before
    /// the next attempt re-resolves. Non-retriable failures (no owner, broker
    /// refused the credentials) are returned at once.
    pub async fn route(
        &self,
        handshake: &ClientHandshake,
        peer: SocketAddr,
    ) -> std::result::Result<RoutedSession, RoutingError> {
        let namespace = self.lookup.namespace_for(&handshake.virtual_host);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match self.attempt(&namespace, handshake).await {
                Ok((ownership, upstream)) => {
                    debug!(
                        %peer,
                        namespace = %namespace,
                        endpoint = %ownership.endpoint,
                        attempts,
                        "session routed"
                    );
                    return Ok(self.attach(namespace, ownership, upstream));
                }
                Err(err) => err,
            };

            if !err.is_retriable() {
                return Err(err);
            }
            if !self.retry.allows_another(attempts) {
                return Err(RoutingError::Exhausted {
                    namespace: namespace.to_string(),
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.delay(attempts);
            warn!(%peer, namespace = %namespace, attempts, ?delay, error = %err, "routing attempt failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(
        &self,
        namespace: &NamespaceName,
        handshake: &ClientHandshake,
    ) -> std::result::Result<(Ownership, UpstreamConnection), RoutingError> {
        let ownership = self.lookup.resolve(namespace.as_str()).await?;
        match open_upstream(&ownership.endpoint, handshake, &self.registry, self.connect_timeout).await {
            Ok(upstream) => Ok((ownership, upstream)),
            Err(err) => {
                if err.is_retriable() && self.lookup.invalidate(namespace.as_str(), Some(ownership.version)) {
                    warn!(
                        namespace = %namespace,
                        endpoint = %ownership.endpoint,
                        version = ownership.version,
                        "invalidated ownership after failed attach"
                    );
                }
                Err(err)
            }
        }
    }

    fn attach(
        &self,
        namespace: NamespaceName,
        ownership: Ownership,
        upstream: UpstreamConnection,
    ) -> RoutedSession {
        let (upstream_writer, upstream_task) = spawn_writer_task(upstream.writer, &self.writer_config);
        RoutedSession {
            namespace,
            ownership,
            upstream: upstream.reader,
            upstream_writer,
            upstream_task,
            open_ok: upstream.open_ok,
            tune: upstream.tune,
        }
    }

    /// The broker went away mid-session: forget it as the owner.
    pub fn upstream_lost(&self, session: &RoutedSession) -> RoutingError {
        if self
            .lookup
            .invalidate(session.namespace.as_str(), Some(session.ownership.version))
        {
            warn!(
                namespace = %session.namespace,
                endpoint = %session.ownership.endpoint,
                "invalidated ownership after losing the broker"
            );
        }
        RoutingError::UpstreamLost {
            namespace: session.namespace.to_string(),
        }
    }
}
