//! Relaying frames between a client and its broker once routed.

use std::net::SocketAddr;

use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::session::{RoutedSession, SessionRouter};
use super::ForwardMode;
use crate::connection::{Action, ConnectionStateMachine, HeartbeatMonitor, HeartbeatStatus};
use crate::error::{GatewayError, ProtocolError, Result};
use crate::protocol::{Frame, FrameReader};
use crate::writer::WriterHandle;

/// How a forwarded session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// A connection close handshake completed, from either side.
    Completed,
    /// The client dropped its socket.
    ClientClosed,
}

/// The client side of a routed session.
#[derive(Debug)]
pub struct ClientSide<'a, R> {
    pub peer: SocketAddr,
    pub reader: &'a mut FrameReader<R>,
    pub writer: &'a WriterHandle,
    pub machine: &'a mut ConnectionStateMachine,
    pub heartbeat: &'a mut HeartbeatMonitor,
}

/// Pump frames both ways until the session ends.
///
/// Heartbeats always pass through; each peer keeps the other alive.
///
/// Losing the broker outside a close handshake invalidates its ownership.
/// A session with no open channels is then routed again under the retry
/// policy and carries on with the new owner; one with open channels ends
/// with [`RoutingError::UpstreamLost`](crate::error::RoutingError::UpstreamLost).
pub async fn forward<R>(
    client: ClientSide<'_, R>,
    session: &mut RoutedSession,
    router: &SessionRouter,
    mode: ForwardMode,
) -> Result<SessionEnd>
where
    R: AsyncRead + Unpin,
{
    let ClientSide {
        peer,
        reader,
        writer,
        machine,
        heartbeat,
    } = client;
    let validated = mode == ForwardMode::Validated;

    loop {
        if machine.is_closed() {
            return Ok(SessionEnd::Completed);
        }
        let expiry = if validated { heartbeat.expires_at() } else { None };
        let deadline = expiry.unwrap_or_else(Instant::now);

        tokio::select! {
            read = reader.read_frame() => {
                let Some(frame) = read? else {
                    return Ok(SessionEnd::ClientClosed);
                };
                heartbeat.record_received(Instant::now());
                if !client_frame(frame, machine, writer, session, validated).await? {
                    return Err(router.upstream_lost(session).into());
                }
            }
            read = session.upstream.read_frame() => {
                let frame = match read {
                    Ok(Some(frame)) => frame,
                    Ok(None) | Err(_) if machine.state().is_closing() => {
                        return Ok(SessionEnd::Completed);
                    }
                    lost => {
                        if let Err(err) = lost {
                            debug!(namespace = %session.namespace, error = %err, "broker stream failed");
                        }
                        reattach(peer, reader, machine, session, router).await?;
                        heartbeat.record_received(Instant::now());
                        continue;
                    }
                };
                trace!(
                    namespace = %session.namespace,
                    frame_type = frame.frame_type.name(),
                    channel = frame.channel,
                    "broker frame"
                );
                machine.observe_upstream_frame(&frame);
                writer.send(frame).await?;
            }
            _ = tokio::time::sleep_until(deadline), if expiry.is_some() => {
                if let HeartbeatStatus::Expired { silent_for } = heartbeat.poll(Instant::now()) {
                    return Err(ProtocolError::HeartbeatTimeout { silent_for }.into());
                }
            }
        }
    }
}

/// Move a session whose broker went away to the namespace's current owner.
///
/// Only sessions without open channels move: channel state lives on the
/// broker and cannot be rebuilt elsewhere.
async fn reattach<R>(
    peer: SocketAddr,
    reader: &mut FrameReader<R>,
    machine: &ConnectionStateMachine,
    session: &mut RoutedSession,
    router: &SessionRouter,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let lost = router.upstream_lost(session);
    let open_channels = machine.channels().len();
    let handshake = match machine.client_handshake() {
        Some(handshake) if open_channels == 0 => handshake,
        _ => {
            warn!(namespace = %session.namespace, open_channels, "broker lost with open channels");
            return Err(lost.into());
        }
    };

    let replacement = router.route(&handshake, peer).await?;
    info!(
        namespace = %replacement.namespace,
        from = %session.ownership.endpoint,
        to = %replacement.ownership.endpoint,
        "session moved to new owner"
    );
    // The client is already open; the new broker's open-ok is not relayed.
    reader.set_frame_max(replacement.tune.frame_max);
    let previous = std::mem::replace(session, replacement);
    previous.upstream_task.abort();
    Ok(())
}

/// Handle one client frame. Returns `false` when the broker can no longer
/// be written to.
async fn client_frame(
    frame: Frame,
    machine: &mut ConnectionStateMachine,
    writer: &WriterHandle,
    session: &RoutedSession,
    validated: bool,
) -> Result<bool> {
    trace!(
        namespace = %session.namespace,
        frame_type = frame.frame_type.name(),
        channel = frame.channel,
        "client frame"
    );
    if frame.is_heartbeat() {
        return Ok(to_upstream(session, frame).await);
    }
    if !validated {
        machine.observe_client_frame(&frame);
        return Ok(to_upstream(session, frame).await);
    }

    match machine.on_frame(&frame)? {
        Action::Forward => Ok(to_upstream(session, frame).await),
        Action::Reply(method) => {
            writer.send(encode(machine, &method)?).await?;
            Ok(true)
        }
        Action::Terminate(reply) => {
            if let Some(method) = reply {
                writer.send(encode(machine, &method)?).await?;
            }
            Ok(true)
        }
        Action::Ignore | Action::Tuned(_) | Action::Route { .. } => Ok(true),
    }
}

async fn to_upstream(session: &RoutedSession, frame: Frame) -> bool {
    match session.upstream_writer.send(frame).await {
        Ok(()) => true,
        Err(GatewayError::BackpressureTimeout) => {
            debug!(namespace = %session.namespace, "broker is not draining frames");
            false
        }
        Err(_) => false,
    }
}

fn encode(machine: &ConnectionStateMachine, method: &crate::method::MethodInstance) -> Result<Frame> {
    Ok(machine.registry().encode_frame(0, method)?)
}
