//! Gateway builder, accept loop and per-connection task.
//!
//! The [`GatewayBuilder`] provides a fluent API over [`GatewayConfig`]. The
//! running [`Gateway`] owns the listener; each accepted client gets its own
//! task that:
//! 1. Reads the protocol header and answers with `connection.start`
//! 2. Negotiates tuning and waits for `connection.open`
//! 3. Routes the session to the broker owning the virtual host
//! 4. Relays frames until either side closes
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amqp_gateway::lookup::InMemoryCoordination;
//! use amqp_gateway::Gateway;
//!
//! # async fn run() -> amqp_gateway::Result<()> {
//! let coordination = Arc::new(InMemoryCoordination::new());
//! let gateway = Gateway::builder()
//!     .bind("0.0.0.0:5672".parse().unwrap())
//!     .tenant("public")
//!     .coordination(coordination)
//!     .start()
//!     .await?;
//!
//! gateway.wait().await
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::GatewayConfig;
use crate::connection::{
    connection_close_kind, reply_code, Action, ClientHandshake, CloseReason, ConnectionSettings,
    ConnectionStateMachine, HeartbeatMonitor, HeartbeatStatus,
};
use crate::error::{ConfigError, GatewayError, ProtocolError, Result};
use crate::lookup::{CoordinationClient, LookupClient};
use crate::method::{MethodInstance, MethodKind, MethodRegistry};
use crate::protocol::{FrameReader, PROTOCOL_HEADER};
use crate::router::{forward, ClientSide, ForwardMode, RoutedSession, SessionEnd, SessionRouter};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Time allowed for a peer to answer our `connection.close`, and for writer
/// tasks to drain once a session ends.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Builder for configuring and starting a gateway.
pub struct GatewayBuilder {
    config: GatewayConfig,
    coordination: Option<Arc<dyn CoordinationClient>>,
    registry: Option<MethodRegistry>,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            coordination: None,
            registry: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Coordination backend used to resolve namespace owners. Required.
    pub fn coordination(mut self, coordination: Arc<dyn CoordinationClient>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    /// Method registry; defaults to [`MethodRegistry::try_standard`].
    pub fn registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    /// Set the maximum number of concurrent client sessions.
    ///
    /// Connections above the limit are dropped with a warning.
    /// Default: 10000
    pub fn max_connections(mut self, limit: usize) -> Self {
        self.config.max_connections = limit;
        self
    }

    /// Default: 10 seconds per handshake step
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Default: 131072
    pub fn frame_max(mut self, frame_max: u32) -> Self {
        self.config.tuning.frame_max = frame_max;
        self
    }

    /// Default: 2047
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.config.tuning.channel_max = channel_max;
        self
    }

    /// Heartbeat interval offered to clients, in seconds; 0 disables.
    ///
    /// Default: 60
    pub fn heartbeat(mut self, secs: u16) -> Self {
        self.config.tuning.heartbeat = secs;
        self
    }

    /// Default: "amqp"
    pub fn protocol_name(mut self, name: impl Into<String>) -> Self {
        self.config.lookup.protocol_name = name.into();
        self
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.config.lookup.tenant = Some(tenant.into());
        self
    }

    /// Default: 5 seconds
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.lookup.timeout = timeout;
        self
    }

    /// Default: 5 minutes
    pub fn ownership_ttl(mut self, ttl: Duration) -> Self {
        self.config.lookup.ownership_ttl = ttl;
        self
    }

    /// Default: 3 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.routing.connect_timeout = timeout;
        self
    }

    /// Routing attempts per session, the first one included.
    ///
    /// Default: 3
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.routing.max_attempts = attempts;
        self
    }

    /// Default: 100 ms doubling up to 2 s
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.routing.initial_backoff = initial;
        self.config.routing.max_backoff = max;
        self
    }

    /// Default: [`ForwardMode::Opaque`]
    pub fn forward_mode(mut self, mode: ForwardMode) -> Self {
        self.config.routing.forward_mode = mode;
        self
    }

    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_frames = limit;
        self
    }

    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Validate the configuration, bind the listener and start accepting.
    pub async fn start(self) -> Result<Gateway> {
        self.config.validate()?;
        let coordination = self
            .coordination
            .ok_or_else(|| ConfigError("no coordination client configured".into()))?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => MethodRegistry::try_standard()?,
        };
        let registry = Arc::new(registry);
        Gateway::start(self.config, coordination, registry).await
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every connection task.
struct Shared {
    config: GatewayConfig,
    settings: Arc<ConnectionSettings>,
    registry: Arc<MethodRegistry>,
    router: SessionRouter,
}

/// A running gateway.
///
/// Dropping it stops the accept loop, as does [`Gateway::shutdown`].
pub struct Gateway {
    local_addr: SocketAddr,
    lookup: LookupClient,
    sessions: Arc<Semaphore>,
    max_connections: usize,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    async fn start(
        config: GatewayConfig,
        coordination: Arc<dyn CoordinationClient>,
        registry: Arc<MethodRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;

        let lookup = LookupClient::new(coordination, &config.lookup);
        let router = SessionRouter::new(
            lookup.clone(),
            Arc::clone(&registry),
            &config.routing,
            config.writer.clone(),
        );
        let max_connections = config.max_connections;
        let sessions = Arc::new(Semaphore::new(max_connections));
        let shared = Arc::new(Shared {
            settings: Arc::new(config.tuning.connection_settings()),
            registry,
            router,
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            shared,
            Arc::clone(&sessions),
            shutdown_rx,
        ));

        info!(%local_addr, "gateway listening");
        Ok(Gateway {
            local_addr,
            lookup,
            sessions,
            max_connections,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The lookup client shared by all sessions, and its ownership cache.
    pub fn lookup(&self) -> &LookupClient {
        &self.lookup
    }

    /// Client sessions currently being served.
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.sessions.available_permits()
    }

    /// Stop accepting and abort every open session.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the accept loop has stopped.
    pub async fn wait(self) -> Result<()> {
        let Gateway {
            accept_task,
            shutdown_tx,
            ..
        } = self;
        let result = accept_task.await;
        drop(shutdown_tx);
        result.map_err(|e| GatewayError::Io(std::io::Error::other(e)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    sessions: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let permit = match Arc::clone(&sessions).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(%peer, "connection limit reached, dropping connection");
                        continue;
                    }
                };

                let shared = Arc::clone(&shared);
                connections.spawn(
                    async move {
                        // Permit is held until the session ends
                        let _permit = permit;
                        serve(stream, peer, shared).await;
                    }
                    .instrument(info_span!("connection", %peer)),
                );
            }
        }
    }

    info!(sessions = connections.len(), "gateway shutting down");
    connections.shutdown().await;
}

/// Serve one client connection to completion. Never fails the gateway.
async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, shared.config.tuning.initial_frame_max);
    let mut machine = ConnectionStateMachine::new(
        Arc::clone(&shared.settings),
        Arc::clone(&shared.registry),
    );

    let timeout = shared.config.handshake_timeout;
    let header = match tokio::time::timeout(timeout, reader.read_protocol_header()).await {
        Ok(Ok(header)) => header,
        Ok(Err(e)) => {
            debug!(error = %e, "connection ended before protocol header");
            return;
        }
        Err(_) => {
            debug!(?timeout, "no protocol header received");
            return;
        }
    };

    let start = match machine.on_protocol_header(&header) {
        Ok(start) => start,
        Err(e) => {
            // The protocol answer to a header we do not speak is our own header.
            warn!(error = %e, "rejecting protocol header");
            let _ = write_half.write_all(&PROTOCOL_HEADER).await;
            let _ = write_half.shutdown().await;
            return;
        }
    };

    let (writer, writer_task) = spawn_writer_task(write_half, &shared.config.writer);
    let mut conn = ClientConnection {
        peer,
        heartbeat: HeartbeatMonitor::new(0, shared.config.tuning.heartbeat_grace, Instant::now()),
        shared,
        reader,
        writer,
        machine,
    };

    let result = match conn.send_method(&start).await {
        Ok(()) => conn.run().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(end) => debug!(?end, "connection finished"),
        Err(e) => conn.fail(e).await,
    }

    drop(conn);
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer_task).await;
}

/// One client connection past the protocol header.
struct ClientConnection {
    peer: SocketAddr,
    shared: Arc<Shared>,
    reader: FrameReader<OwnedReadHalf>,
    writer: WriterHandle,
    machine: ConnectionStateMachine,
    heartbeat: HeartbeatMonitor,
}

impl ClientConnection {
    async fn run(&mut self) -> Result<SessionEnd> {
        let Some(handshake) = self.negotiate().await? else {
            return Ok(SessionEnd::Completed);
        };
        let Some(mut session) = self.route(&handshake).await? else {
            return Ok(SessionEnd::Completed);
        };

        info!(
            namespace = %session.namespace,
            endpoint = %session.ownership.endpoint,
            "session attached"
        );
        let attached = self.attach(&mut session).await;

        let RoutedSession {
            upstream_writer,
            upstream_task,
            ..
        } = session;
        drop(upstream_writer);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, upstream_task).await;
        attached
    }

    /// Relay the broker's open-ok, then forward until the session ends.
    ///
    /// Client frames are held to the broker-side frame-max, which can be
    /// below what the client negotiated with us.
    async fn attach(&mut self, session: &mut RoutedSession) -> Result<SessionEnd> {
        self.writer.send(session.open_ok.clone()).await?;
        self.machine.mark_open();
        self.reader.set_frame_max(session.tune.frame_max);

        let client = ClientSide {
            peer: self.peer,
            reader: &mut self.reader,
            writer: &self.writer,
            machine: &mut self.machine,
            heartbeat: &mut self.heartbeat,
        };
        let mode = self.shared.config.routing.forward_mode;
        forward(client, session, &self.shared.router, mode).await
    }

    /// Drive the handshake up to `connection.open`.
    ///
    /// `None` when the client closed during the handshake.
    async fn negotiate(&mut self) -> Result<Option<ClientHandshake>> {
        let timeout = self.shared.config.handshake_timeout;
        let mut step_deadline = Instant::now() + timeout;

        loop {
            let beat = self.heartbeat.next_deadline();
            tokio::select! {
                read = self.reader.read_frame() => {
                    let frame = read?.ok_or(GatewayError::ConnectionClosed)?;
                    let now = Instant::now();
                    self.heartbeat.record_received(now);

                    match self.machine.on_frame(&frame)? {
                        Action::Reply(method) => {
                            self.send_method(&method).await?;
                            step_deadline = now + timeout;
                        }
                        Action::Tuned(tune) => {
                            debug!(
                                channel_max = tune.channel_max,
                                frame_max = tune.frame_max,
                                heartbeat = tune.heartbeat,
                                "connection tuned"
                            );
                            self.reader.set_frame_max(tune.frame_max);
                            self.heartbeat.set_interval(tune.heartbeat);
                            step_deadline = now + timeout;
                        }
                        Action::Route { virtual_host } => {
                            debug!(%virtual_host, "client opened virtual host");
                            let handshake = self.machine.client_handshake().ok_or(
                                ProtocolError::UnexpectedMethod {
                                    state: self.machine.state().name(),
                                    class_id: MethodKind::ConnectionOpen.ids().0,
                                    method_id: MethodKind::ConnectionOpen.ids().1,
                                },
                            )?;
                            return Ok(Some(handshake));
                        }
                        Action::Terminate(reply) => {
                            if let Some(method) = reply {
                                self.send_method(&method).await?;
                            }
                            return Ok(None);
                        }
                        Action::Forward | Action::Ignore => {}
                    }
                }
                _ = tokio::time::sleep_until(step_deadline) => {
                    return Err(GatewayError::HandshakeTimeout {
                        peer: self.peer,
                        after: timeout,
                    });
                }
                _ = tokio::time::sleep_until(beat.unwrap_or(step_deadline)), if beat.is_some() => {
                    self.tick_heartbeat().await?;
                }
            }
        }
    }

    /// Route the session while keeping the client alive.
    ///
    /// `None` when the client closed while routing was in progress; the
    /// routing attempt is dropped with it.
    async fn route(&mut self, handshake: &ClientHandshake) -> Result<Option<RoutedSession>> {
        let shared = Arc::clone(&self.shared);
        let route = shared.router.route(handshake, self.peer);
        tokio::pin!(route);

        loop {
            let beat = self.heartbeat.next_deadline();
            tokio::select! {
                routed = &mut route => return Ok(Some(routed?)),
                read = self.reader.read_frame() => {
                    let frame = read?.ok_or(GatewayError::ConnectionClosed)?;
                    self.heartbeat.record_received(Instant::now());
                    match self.machine.on_frame(&frame)? {
                        Action::Terminate(reply) => {
                            if let Some(method) = reply {
                                self.send_method(&method).await?;
                            }
                            return Ok(None);
                        }
                        Action::Reply(method) => self.send_method(&method).await?,
                        _ => {}
                    }
                }
                _ = tokio::time::sleep_until(beat.unwrap_or_else(Instant::now)), if beat.is_some() => {
                    self.tick_heartbeat().await?;
                }
            }
        }
    }

    async fn tick_heartbeat(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.heartbeat.poll(now) {
            HeartbeatStatus::Idle => Ok(()),
            HeartbeatStatus::SendHeartbeat => {
                self.writer.send(OutboundFrame::heartbeat()).await?;
                self.heartbeat.record_sent(now);
                Ok(())
            }
            HeartbeatStatus::Expired { silent_for } => {
                Err(ProtocolError::HeartbeatTimeout { silent_for }.into())
            }
        }
    }

    async fn send_method(&mut self, method: &MethodInstance) -> Result<()> {
        let frame = self.shared.registry.encode_frame(0, method)?;
        self.writer.send(frame).await?;
        self.heartbeat.record_sent(Instant::now());
        Ok(())
    }

    /// Close the client with the reason matching `err`.
    ///
    /// Transport failures just drop the socket; there is nobody to tell.
    async fn fail(&mut self, err: GatewayError) {
        let reason = match &err {
            GatewayError::Protocol(e) => {
                error!(error = %e, state = self.machine.state().name(), "protocol violation");
                CloseReason::from(e)
            }
            GatewayError::Routing(e) => {
                warn!(error = %e, "routing failed");
                CloseReason::from(e)
            }
            GatewayError::Lookup(e) => {
                warn!(error = %e, "lookup failed");
                CloseReason::from(e)
            }
            GatewayError::Io(_)
            | GatewayError::ConnectionClosed
            | GatewayError::BackpressureTimeout
            | GatewayError::HandshakeTimeout { .. } => {
                debug!(error = %err, "connection dropped");
                return;
            }
            other => {
                error!(error = %other, "internal failure");
                CloseReason::new(reply_code::INTERNAL_ERROR, other)
            }
        };

        if self.machine.is_closed() {
            return;
        }
        let close = self.machine.begin_close(&reason);
        if self.send_method(&close).await.is_err() {
            return;
        }

        let awaited = tokio::time::timeout(CLOSE_TIMEOUT, async {
            loop {
                let Ok(Some(frame)) = self.reader.read_frame().await else {
                    return;
                };
                match connection_close_kind(&frame) {
                    Some(MethodKind::ConnectionCloseOk) => return,
                    Some(MethodKind::ConnectionClose) => {
                        let _ = self
                            .send_method(&MethodInstance::connection_close_ok())
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
        })
        .await;
        if awaited.is_err() {
            debug!(code = reason.code, "client did not acknowledge close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::InMemoryCoordination;

    #[test]
    fn test_builder_configuration() {
        let builder = Gateway::builder()
            .max_connections(16)
            .frame_max(65_536)
            .heartbeat(0)
            .tenant("public")
            .max_attempts(5)
            .forward_mode(ForwardMode::Validated)
            .backpressure_timeout(Duration::from_secs(1));

        assert_eq!(builder.config.max_connections, 16);
        assert_eq!(builder.config.tuning.frame_max, 65_536);
        assert_eq!(builder.config.tuning.heartbeat, 0);
        assert_eq!(builder.config.lookup.tenant.as_deref(), Some("public"));
        assert_eq!(builder.config.routing.max_attempts, 5);
        assert_eq!(builder.config.routing.forward_mode, ForwardMode::Validated);
        assert_eq!(builder.config.writer.backpressure_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_start_requires_coordination() {
        let result = Gateway::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .start()
            .await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let result = Gateway::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .frame_max(512)
            .coordination(Arc::new(InMemoryCoordination::new()))
            .start()
            .await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let gateway = Gateway::builder()
            .bind("127.0.0.1:0".parse().unwrap())
            .coordination(Arc::new(InMemoryCoordination::new()))
            .start()
            .await
            .unwrap();

        assert_ne!(gateway.local_addr().port(), 0);
        assert_eq!(gateway.active_connections(), 0);
        gateway.shutdown();
        gateway.wait().await.unwrap();
    }
}
