//! Opening the client's session on the owning broker.
//!
//! The gateway plays the client role towards the broker, replaying what the
//! real client said: its StartOk (properties and credentials), the tuned
//! limits, and the Open for the same virtual host. The broker authenticates.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::connection::{connection_close_kind, ClientHandshake, TuneParams};
use crate::error::RoutingError;
use crate::lookup::BrokerEndpoint;
use crate::method::{MethodInstance, MethodKind, MethodRegistry};
use crate::protocol::{write_frame, Frame, FrameReader, FrameType, FRAME_MIN_SIZE, PROTOCOL_HEADER};

/// A broker connection that has accepted `connection.open`.
#[derive(Debug)]
pub struct UpstreamConnection {
    pub endpoint: BrokerEndpoint,
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    /// The broker's open-ok, relayed verbatim to the client.
    pub open_ok: Frame,
    pub tune: TuneParams,
}

/// Connect to `endpoint` and open the client's virtual host on it.
///
/// The TCP connect and the handshake are each bounded by `timeout`.
pub async fn open_upstream(
    endpoint: &BrokerEndpoint,
    handshake: &ClientHandshake,
    registry: &Arc<MethodRegistry>,
    timeout: Duration,
) -> Result<UpstreamConnection, RoutingError> {
    let stream = match tokio::time::timeout(
        timeout,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(RoutingError::Connect {
                endpoint: endpoint.clone(),
                source,
            })
        }
        Err(_) => {
            return Err(RoutingError::ConnectTimeout {
                endpoint: endpoint.clone(),
                after: timeout,
            })
        }
    };
    let _ = stream.set_nodelay(true);

    let (read_half, write_half) = stream.into_split();
    let mut replay = Replay {
        endpoint,
        registry,
        reader: FrameReader::new(read_half, FRAME_MIN_SIZE),
        writer: write_half,
    };

    match tokio::time::timeout(timeout, replay.run(handshake)).await {
        Ok(Ok((open_ok, tune))) => Ok(UpstreamConnection {
            endpoint: endpoint.clone(),
            reader: replay.reader,
            writer: replay.writer,
            open_ok,
            tune,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(RoutingError::Handshake {
            endpoint: endpoint.clone(),
            reason: format!("no answer within {timeout:?}"),
        }),
    }
}

struct Replay<'a> {
    endpoint: &'a BrokerEndpoint,
    registry: &'a Arc<MethodRegistry>,
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Replay<'_> {
    fn failed(&self, reason: impl Into<String>) -> RoutingError {
        RoutingError::Handshake {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }

    async fn send(&mut self, method: &MethodInstance) -> Result<(), RoutingError> {
        let frame = self
            .registry
            .encode_frame(0, method)
            .map_err(|e| self.failed(e.to_string()))?;
        write_frame(&mut self.writer, &frame)
            .await
            .map_err(|e| self.failed(e.to_string()))
    }

    /// Next channel-0 method, skipping heartbeats.
    ///
    /// A `connection.close` is answered with close-ok and reported as
    /// `Rejected`.
    async fn expect(&mut self, expected: MethodKind) -> Result<(Frame, MethodInstance), RoutingError> {
        loop {
            let frame = match self.reader.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(self.failed("broker closed the connection")),
                Err(e) => return Err(self.failed(e.to_string())),
            };
            if frame.is_heartbeat() {
                continue;
            }
            if frame.frame_type != FrameType::Method || frame.channel != 0 {
                return Err(self.failed(format!(
                    "unexpected {} frame on channel {}",
                    frame.frame_type.name(),
                    frame.channel
                )));
            }
            let method = self
                .registry
                .decode_frame(&frame)
                .map_err(|e| self.failed(e.to_string()))?
                .ok_or_else(|| self.failed("expected a method frame"))?;

            if connection_close_kind(&frame) == Some(MethodKind::ConnectionClose) {
                let _ = self.send(&MethodInstance::connection_close_ok()).await;
                return Err(RoutingError::Rejected {
                    endpoint: self.endpoint.clone(),
                    code: method.short("reply-code").unwrap_or(0),
                    text: method.short_str("reply-text").unwrap_or_default().to_owned(),
                });
            }
            if method.kind() != expected {
                return Err(self.failed(format!(
                    "expected {}, got {}",
                    expected.name(),
                    method.method().name
                )));
            }
            return Ok((frame, method));
        }
    }

    async fn run(&mut self, handshake: &ClientHandshake) -> Result<(Frame, TuneParams), RoutingError> {
        self.writer
            .write_all(&PROTOCOL_HEADER)
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        let (_, start) = self.expect(MethodKind::ConnectionStart).await?;
        let offered = start
            .long_str("mechanisms")
            .map(|m| String::from_utf8_lossy(m).into_owned())
            .unwrap_or_default();
        if !offered.split_whitespace().any(|m| m == handshake.mechanism) {
            return Err(self.failed(format!(
                "broker does not offer mechanism {} (offers {offered:?})",
                handshake.mechanism
            )));
        }

        self.send(&MethodInstance::connection_start_ok(
            handshake.client_properties.clone(),
            &handshake.mechanism,
            handshake.response.clone(),
            &handshake.locale,
        ))
        .await?;

        let tune = match self.expect(MethodKind::ConnectionTune).await {
            Ok((_, tune)) => tune,
            Err(RoutingError::Handshake { reason, .. }) if reason.contains("connection.secure") => {
                return Err(self.failed("broker requested a SASL challenge round"));
            }
            Err(e) => return Err(e),
        };
        let params = upstream_tune(&handshake.tune, &tune);
        if params.frame_max < handshake.tune.frame_max {
            tracing::warn!(
                endpoint = %self.endpoint,
                client = handshake.tune.frame_max,
                broker = params.frame_max,
                "broker frame-max is below the client's, clamping client frames"
            );
        }
        self.send(&MethodInstance::connection_tune_ok(
            params.channel_max,
            params.frame_max,
            params.heartbeat,
        ))
        .await?;
        self.reader.set_frame_max(params.frame_max);

        self.send(&MethodInstance::connection_open(&handshake.virtual_host))
            .await?;
        let (open_ok, _) = self.expect(MethodKind::ConnectionOpenOk).await?;
        Ok((open_ok, params))
    }
}

/// Tune values for the broker side: the tighter of client and broker limits,
/// with the client's heartbeat since its heartbeats are forwarded as-is.
fn upstream_tune(client: &TuneParams, broker: &MethodInstance) -> TuneParams {
    let broker_channels = broker.short("channel-max").unwrap_or(0);
    let broker_frame = broker.long("frame-max").unwrap_or(0);
    TuneParams {
        channel_max: tighter(client.channel_max.into(), broker_channels.into()) as u16,
        frame_max: tighter(client.frame_max, broker_frame).max(FRAME_MIN_SIZE),
        heartbeat: client.heartbeat,
    }
}

/// Smaller of two limits where 0 means unlimited.
fn tighter(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tighter_limits() {
        assert_eq!(tighter(0, 10), 10);
        assert_eq!(tighter(10, 0), 10);
        assert_eq!(tighter(5, 10), 5);
        assert_eq!(tighter(0, 0), 0);
    }

    #[test]
    fn test_upstream_tune_keeps_client_heartbeat() {
        let client = TuneParams {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        };
        let broker = MethodInstance::connection_tune(0, 65_536, 30);
        let tuned = upstream_tune(&client, &broker);
        assert_eq!(
            tuned,
            TuneParams {
                channel_max: 2047,
                frame_max: 65_536,
                heartbeat: 60
            }
        );
    }

    #[test]
    fn test_upstream_tune_keeps_disabled_heartbeat() {
        let client = TuneParams {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
        };
        let broker = MethodInstance::connection_tune(2047, 131_072, 60);
        assert_eq!(upstream_tune(&client, &broker).heartbeat, 0);
    }
}
