//! Fake broker and scripted AMQP client over real localhost sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqp_gateway::lookup::ServiceLookupData;
use amqp_gateway::method::{FieldTable, MethodInstance, MethodKind, MethodRegistry};
use amqp_gateway::protocol::{write_frame, Frame, FrameReader, PROTOCOL_HEADER};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const FRAME_MAX: u32 = 131_072;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn send_method(
    writer: &mut OwnedWriteHalf,
    registry: &MethodRegistry,
    channel: u16,
    method: &MethodInstance,
) -> amqp_gateway::Result<()> {
    let frame = registry.encode_frame(channel, method)?;
    write_frame(writer, &frame).await
}

/// How the fake broker answers `connection.open`.
#[derive(Debug, Clone, Copy)]
pub enum OpenReply {
    Accept,
    /// Send `connection.close` with this reply code.
    Refuse(u16),
}

/// A broker that completes the handshake, records every frame it receives
/// afterwards, and answers channel.open and connection.close.
pub struct FakeBroker {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    pub frames: mpsc::UnboundedReceiver<Frame>,
    pub opened_vhosts: mpsc::UnboundedReceiver<String>,
    /// `(channel-max, frame-max, heartbeat)` of every tune-ok received.
    pub tuned: mpsc::UnboundedReceiver<(u16, u32, u16)>,
    kill: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start(reply: OpenReply) -> Self {
        Self::start_with_frame_max(reply, FRAME_MAX).await
    }

    /// Start a broker that offers `frame_max` in its tune.
    pub async fn start_with_frame_max(reply: OpenReply, frame_max: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (vhost_tx, opened_vhosts) = mpsc::unbounded_channel();
        let (tuned_tx, tuned) = mpsc::unbounded_channel();
        let (kill, kill_rx) = watch::channel(false);

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if *kill_rx.borrow() {
                    return;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(broker_session(
                    stream,
                    BrokerScript {
                        reply,
                        frame_max,
                        frames: frames_tx.clone(),
                        vhosts: vhost_tx.clone(),
                        tuned: tuned_tx.clone(),
                    },
                    kill_rx.clone(),
                ));
            }
        });

        Self {
            addr,
            accepted,
            frames,
            opened_vhosts,
            tuned,
            kill,
            task,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Lookup data advertising this broker under `web_service_url`.
    pub fn lookup_data(&self, web_service_url: &str) -> ServiceLookupData {
        ServiceLookupData::new(web_service_url)
            .with_protocol("amqp", format!("amqp://{}", self.addr))
    }

    /// Drop every open session and stop listening.
    pub fn kill(&self) {
        let _ = self.kill.send(true);
        self.task.abort();
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(IO_TIMEOUT, self.frames.recv())
            .await
            .expect("broker frame in time")
            .expect("broker still running")
    }
}

async fn expect_method(
    reader: &mut FrameReader<OwnedReadHalf>,
    registry: &MethodRegistry,
    kind: MethodKind,
) -> amqp_gateway::Result<MethodInstance> {
    loop {
        let frame = reader
            .read_frame()
            .await?
            .ok_or(amqp_gateway::GatewayError::ConnectionClosed)?;
        if frame.is_heartbeat() {
            continue;
        }
        let method = registry.decode_frame(&frame)?.expect("method frame");
        assert_eq!(method.kind(), kind, "broker got {}", method.method().name);
        return Ok(method);
    }
}

struct BrokerScript {
    reply: OpenReply,
    frame_max: u32,
    frames: mpsc::UnboundedSender<Frame>,
    vhosts: mpsc::UnboundedSender<String>,
    tuned: mpsc::UnboundedSender<(u16, u32, u16)>,
}

async fn broker_session(
    stream: TcpStream,
    script: BrokerScript,
    mut kill: watch::Receiver<bool>,
) -> amqp_gateway::Result<()> {
    let BrokerScript {
        reply,
        frame_max,
        frames,
        vhosts,
        tuned,
    } = script;
    let registry = MethodRegistry::standard();
    let (read_half, mut w) = stream.into_split();
    let mut reader = FrameReader::new(read_half, FRAME_MAX);

    let header = reader.read_protocol_header().await?;
    assert_eq!(header, PROTOCOL_HEADER);

    let start = MethodInstance::connection_start(FieldTable::new(), "PLAIN AMQPLAIN", "en_US");
    send_method(&mut w, &registry, 0, &start).await?;
    expect_method(&mut reader, &registry, MethodKind::ConnectionStartOk).await?;
    send_method(&mut w, &registry, 0, &MethodInstance::connection_tune(0, frame_max, 0)).await?;
    let tune_ok = expect_method(&mut reader, &registry, MethodKind::ConnectionTuneOk).await?;
    let _ = tuned.send((
        tune_ok.short("channel-max").unwrap_or_default(),
        tune_ok.long("frame-max").unwrap_or_default(),
        tune_ok.short("heartbeat").unwrap_or_default(),
    ));
    reader.set_frame_max(frame_max);
    let open = expect_method(&mut reader, &registry, MethodKind::ConnectionOpen).await?;
    let _ = vhosts.send(open.short_str("virtual-host").unwrap_or_default().to_owned());

    match reply {
        OpenReply::Accept => {
            send_method(&mut w, &registry, 0, &MethodInstance::connection_open_ok()).await?;
        }
        OpenReply::Refuse(code) => {
            let close = MethodInstance::connection_close(code, "refused by broker", (10, 40));
            send_method(&mut w, &registry, 0, &close).await?;
            let _ = expect_method(&mut reader, &registry, MethodKind::ConnectionCloseOk).await;
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            _ = kill.changed() => return Ok(()),
            read = reader.read_frame() => {
                let Some(frame) = read? else {
                    return Ok(());
                };
                let _ = frames.send(frame.clone());
                let Ok(Some(method)) = registry.decode_frame(&frame) else {
                    continue;
                };
                match method.kind() {
                    MethodKind::ChannelOpen => {
                        send_method(&mut w, &registry, frame.channel, &MethodInstance::channel_open_ok()).await?;
                    }
                    MethodKind::ConnectionClose => {
                        send_method(&mut w, &registry, 0, &MethodInstance::connection_close_ok()).await?;
                        let _ = w.shutdown().await;
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Scripted client speaking to the gateway.
pub struct TestClient {
    pub reader: FrameReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub registry: MethodRegistry,
}

impl TestClient {
    /// Connect and send the protocol header.
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        writer.write_all(&PROTOCOL_HEADER).await.unwrap();
        Self {
            reader: FrameReader::new(read_half, FRAME_MAX),
            writer,
            registry: MethodRegistry::standard(),
        }
    }

    /// Run the handshake through `connection.open` and return the gateway's
    /// answer to it (open-ok or close).
    pub async fn open(addr: SocketAddr, virtual_host: &str, heartbeat: u16) -> (Self, MethodInstance) {
        let mut client = Self::connect(addr).await;
        client.expect(MethodKind::ConnectionStart).await;
        client
            .send(
                0,
                &MethodInstance::connection_start_ok(
                    FieldTable::new().with("product", "integration-test"),
                    "PLAIN",
                    Bytes::from_static(b"\0guest\0guest"),
                    "en_US",
                ),
            )
            .await;
        let tune = client.expect(MethodKind::ConnectionTune).await;
        client
            .send(
                0,
                &MethodInstance::connection_tune_ok(
                    tune.short("channel-max").unwrap(),
                    tune.long("frame-max").unwrap(),
                    heartbeat,
                ),
            )
            .await;
        client
            .send(0, &MethodInstance::connection_open(virtual_host))
            .await;
        let answer = client.recv_method().await.1;
        (client, answer)
    }

    pub async fn send(&mut self, channel: u16, method: &MethodInstance) {
        send_method(&mut self.writer, &self.registry, channel, method)
            .await
            .unwrap();
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        write_frame(&mut self.writer, frame).await.unwrap();
    }

    /// Next non-heartbeat frame; `None` once the gateway closed the socket.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let frame = tokio::time::timeout(IO_TIMEOUT, self.reader.read_frame())
                .await
                .expect("gateway answered in time")
                .ok()??;
            if !frame.is_heartbeat() {
                return Some(frame);
            }
        }
    }

    pub async fn recv_method(&mut self) -> (u16, MethodInstance) {
        let frame = self.recv().await.expect("gateway closed the socket");
        let method = self.registry.decode_frame(&frame).unwrap().expect("method frame");
        (frame.channel, method)
    }

    pub async fn expect(&mut self, kind: MethodKind) -> MethodInstance {
        let (_, method) = self.recv_method().await;
        assert_eq!(method.kind(), kind, "client got {}", method.method().name);
        method
    }

    /// Wait for `connection.close`, acknowledge it, and return it.
    pub async fn expect_close(&mut self) -> MethodInstance {
        let close = self.expect(MethodKind::ConnectionClose).await;
        self.send(0, &MethodInstance::connection_close_ok()).await;
        close
    }
}
