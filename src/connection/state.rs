//! Connection state machine.
//!
//! Sans-io: the machine consumes the protocol header and decoded frames from
//! the client and answers with an [`Action`]; the gateway task owns the
//! sockets and carries the action out.
//!
//! ```text
//! AwaitingProtocolHeader
//!   -> Negotiating(StartOk)   connection.start sent
//!   -> Negotiating(TuneOk)    connection.tune sent
//!   -> Negotiating(Open)      tune-ok accepted
//!   -> Opening                connection.open received, routing
//!   -> Active                 broker open-ok relayed
//!   -> Closing -> Closed
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::channel::ChannelTable;
use super::close::CloseReason;
use crate::error::ProtocolError;
use crate::method::{FieldTable, MethodInstance, MethodKind, MethodRegistry, ProtocolClass};
use crate::protocol::{validate_protocol_header, Frame, FrameType, FRAME_MIN_SIZE};

/// Server side of the handshake, offered in Start and Tune.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Seconds; 0 disables heartbeats.
    pub heartbeat: u16,
    pub mechanisms: Vec<String>,
    pub locales: String,
    pub server_properties: FieldTable,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: crate::protocol::DEFAULT_FRAME_MAX,
            heartbeat: 60,
            mechanisms: vec!["PLAIN".to_owned(), "AMQPLAIN".to_owned()],
            locales: "en_US".to_owned(),
            server_properties: default_server_properties(),
        }
    }
}

/// Properties announced in `connection.start`.
pub fn default_server_properties() -> FieldTable {
    FieldTable::new()
        .with("product", env!("CARGO_PKG_NAME"))
        .with("version", env!("CARGO_PKG_VERSION"))
        .with("platform", "Rust")
        .with(
            "capabilities",
            FieldTable::new()
                .with("publisher_confirms", true)
                .with("exchange_exchange_bindings", true)
                .with("basic.nack", true)
                .with("consumer_cancel_notify", true)
                .with("connection.blocked", true),
        )
}

/// Negotiated connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneParams {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl TuneParams {
    /// Apply the client's `tune-ok` to the server's offer.
    ///
    /// A zero channel-max or frame-max means "the server's value"; a zero
    /// heartbeat means the client wants none and is kept. Anything above the
    /// offer, or a frame-max below the protocol minimum, is refused.
    pub fn negotiate(offer: TuneParams, requested: TuneParams) -> Result<Self, ProtocolError> {
        let channel_max = pick("channel-max", offer.channel_max.into(), requested.channel_max.into())?;
        let frame_max = pick("frame-max", offer.frame_max, requested.frame_max)?;
        let heartbeat = match requested.heartbeat {
            0 => 0,
            secs => pick("heartbeat", offer.heartbeat.into(), secs.into())?,
        };
        if frame_max < FRAME_MIN_SIZE {
            return Err(ProtocolError::TuneRejected {
                field: "frame-max",
                requested: frame_max,
                limit: FRAME_MIN_SIZE,
            });
        }
        Ok(Self {
            channel_max: channel_max as u16,
            frame_max,
            heartbeat: heartbeat as u16,
        })
    }

    fn from_method(method: &MethodInstance) -> Self {
        Self {
            channel_max: method.short("channel-max").unwrap_or(0),
            frame_max: method.long("frame-max").unwrap_or(0),
            heartbeat: method.short("heartbeat").unwrap_or(0),
        }
    }
}

fn pick(field: &'static str, offer: u32, requested: u32) -> Result<u32, ProtocolError> {
    match requested {
        0 => Ok(offer),
        r if offer != 0 && r > offer => Err(ProtocolError::TuneRejected {
            field,
            requested: r,
            limit: offer,
        }),
        r => Ok(r),
    }
}

/// Everything the client said during the handshake, replayed upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientHandshake {
    pub client_properties: FieldTable,
    pub mechanism: String,
    pub response: Bytes,
    pub locale: String,
    pub tune: TuneParams,
    pub virtual_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    StartOk,
    TuneOk,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingProtocolHeader,
    Negotiating(NegotiationStep),
    /// Open received; the session is being routed.
    Opening,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::AwaitingProtocolHeader => "awaiting protocol header",
            ConnectionState::Negotiating(NegotiationStep::StartOk) => "awaiting start-ok",
            ConnectionState::Negotiating(NegotiationStep::TuneOk) => "awaiting tune-ok",
            ConnectionState::Negotiating(NegotiationStep::Open) => "awaiting open",
            ConnectionState::Opening => "opening",
            ConnectionState::Active => "active",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }

    /// A close handshake is underway or done.
    pub fn is_closing(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// What the gateway must do with a client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send this method to the client on channel 0.
    Reply(MethodInstance),
    /// Tuning finished; apply the limits to the socket.
    Tuned(TuneParams),
    /// The client asked for a virtual host; resolve and attach.
    Route { virtual_host: String },
    /// Pass the frame through to the broker unchanged.
    Forward,
    Ignore,
    /// Send the optional method, then drop the connection.
    Terminate(Option<MethodInstance>),
}

#[derive(Debug, Clone)]
struct StartOk {
    client_properties: FieldTable,
    mechanism: String,
    response: Bytes,
    locale: String,
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    settings: Arc<ConnectionSettings>,
    registry: Arc<MethodRegistry>,
    state: ConnectionState,
    channels: ChannelTable,
    start_ok: Option<StartOk>,
    tune: Option<TuneParams>,
    virtual_host: Option<String>,
    routed: bool,
}

impl ConnectionStateMachine {
    pub fn new(settings: Arc<ConnectionSettings>, registry: Arc<MethodRegistry>) -> Self {
        let channels = ChannelTable::new(settings.channel_max);
        Self {
            settings,
            registry,
            state: ConnectionState::AwaitingProtocolHeader,
            channels,
            start_ok: None,
            tune: None,
            virtual_host: None,
            routed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Negotiated limits, once tune-ok has been accepted.
    pub fn tune(&self) -> Option<TuneParams> {
        self.tune
    }

    /// The virtual host from `connection.open`. Fixed once set.
    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    fn offer(&self) -> TuneParams {
        TuneParams {
            channel_max: self.settings.channel_max,
            frame_max: self.settings.frame_max,
            heartbeat: self.settings.heartbeat,
        }
    }

    /// The handshake as the client performed it, once Open has arrived.
    pub fn client_handshake(&self) -> Option<ClientHandshake> {
        let start_ok = self.start_ok.as_ref()?;
        Some(ClientHandshake {
            client_properties: start_ok.client_properties.clone(),
            mechanism: start_ok.mechanism.clone(),
            response: start_ok.response.clone(),
            locale: start_ok.locale.clone(),
            tune: self.tune?,
            virtual_host: self.virtual_host.clone()?,
        })
    }

    /// Accept the client's protocol header and produce `connection.start`.
    pub fn on_protocol_header(&mut self, header: &[u8; 8]) -> Result<MethodInstance, ProtocolError> {
        if self.state != ConnectionState::AwaitingProtocolHeader {
            return Err(ProtocolError::UnexpectedFrame {
                state: self.state.name(),
                frame_type: "protocol-header",
            });
        }
        validate_protocol_header(header)?;
        self.state = ConnectionState::Negotiating(NegotiationStep::StartOk);
        Ok(MethodInstance::connection_start(
            self.settings.server_properties.clone(),
            &self.settings.mechanisms.join(" "),
            &self.settings.locales,
        ))
    }

    /// The broker accepted the session and its open-ok was relayed.
    pub fn mark_open(&mut self) {
        if self.state == ConnectionState::Opening {
            self.state = ConnectionState::Active;
            self.routed = true;
        }
    }

    /// The gateway is closing the connection itself.
    pub fn begin_close(&mut self, reason: &CloseReason) -> MethodInstance {
        self.state = ConnectionState::Closing;
        reason.to_method()
    }

    /// Interpret one client frame, validating it against the current state.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Action, ProtocolError> {
        let state = self.state;
        match state {
            ConnectionState::AwaitingProtocolHeader => Err(ProtocolError::UnexpectedFrame {
                state: state.name(),
                frame_type: frame.frame_type.name(),
            }),
            ConnectionState::Closed => Ok(Action::Ignore),
            _ if frame.is_heartbeat() => Ok(Action::Ignore),
            ConnectionState::Closing => self.on_closing_frame(frame),
            ConnectionState::Active => self.on_active_frame(frame),
            ConnectionState::Negotiating(_) | ConnectionState::Opening => {
                if frame.frame_type != FrameType::Method || frame.channel != 0 {
                    return Err(ProtocolError::UnexpectedFrame {
                        state: state.name(),
                        frame_type: frame.frame_type.name(),
                    });
                }
                let method = self.registry.decode_payload(&frame.payload)?;
                self.on_handshake_method(method)
            }
        }
    }

    fn unexpected(&self, method: &MethodInstance) -> ProtocolError {
        ProtocolError::UnexpectedMethod {
            state: self.state.name(),
            class_id: method.class_id(),
            method_id: method.method_id(),
        }
    }

    fn on_handshake_method(&mut self, method: MethodInstance) -> Result<Action, ProtocolError> {
        trace!(method = method.method().name, state = self.state.name(), "handshake method");
        match (self.state, method.kind()) {
            (_, MethodKind::ConnectionClose) => {
                self.state = ConnectionState::Closed;
                Ok(Action::Terminate(Some(MethodInstance::connection_close_ok())))
            }
            (ConnectionState::Negotiating(NegotiationStep::StartOk), MethodKind::ConnectionStartOk) => {
                let mechanism = method.short_str("mechanism").unwrap_or_default().to_owned();
                if !self.settings.mechanisms.iter().any(|m| *m == mechanism) {
                    return Err(ProtocolError::UnsupportedMechanism(mechanism));
                }
                self.start_ok = Some(StartOk {
                    client_properties: method.table("client-properties").cloned().unwrap_or_default(),
                    mechanism,
                    response: method.long_str("response").cloned().unwrap_or_default(),
                    locale: method.short_str("locale").unwrap_or_default().to_owned(),
                });
                self.state = ConnectionState::Negotiating(NegotiationStep::TuneOk);
                let offer = self.offer();
                Ok(Action::Reply(MethodInstance::connection_tune(
                    offer.channel_max,
                    offer.frame_max,
                    offer.heartbeat,
                )))
            }
            (ConnectionState::Negotiating(NegotiationStep::TuneOk), MethodKind::ConnectionTuneOk) => {
                let tune = TuneParams::negotiate(self.offer(), TuneParams::from_method(&method))?;
                self.channels.set_channel_max(tune.channel_max);
                self.tune = Some(tune);
                self.state = ConnectionState::Negotiating(NegotiationStep::Open);
                Ok(Action::Tuned(tune))
            }
            (ConnectionState::Negotiating(NegotiationStep::Open), MethodKind::ConnectionOpen) => {
                let virtual_host = method.short_str("virtual-host").unwrap_or_default().to_owned();
                self.virtual_host = Some(virtual_host.clone());
                self.state = ConnectionState::Opening;
                Ok(Action::Route { virtual_host })
            }
            _ => Err(self.unexpected(&method)),
        }
    }

    fn on_active_frame(&mut self, frame: &Frame) -> Result<Action, ProtocolError> {
        if frame.channel == 0 {
            if frame.frame_type != FrameType::Method {
                return Err(ProtocolError::UnexpectedFrame {
                    state: self.state.name(),
                    frame_type: frame.frame_type.name(),
                });
            }
            let method = self.registry.decode_payload(&frame.payload)?;
            if method.method().class != ProtocolClass::Connection {
                return Err(ProtocolError::InvalidChannel {
                    class_id: method.class_id(),
                    channel: 0,
                });
            }
            return match method.kind() {
                MethodKind::ConnectionClose => {
                    self.state = ConnectionState::Closing;
                    Ok(Action::Forward)
                }
                MethodKind::ConnectionCloseOk => {
                    self.state = ConnectionState::Closed;
                    Ok(Action::Forward)
                }
                _ => Err(self.unexpected(&method)),
            };
        }

        let channel = frame.channel;
        self.channels.check_range(channel)?;

        if frame.frame_type.is_content() {
            self.channels.require_open(channel)?;
            return Ok(Action::Forward);
        }

        let Some((class_id, _)) = frame.method_ids() else {
            return Err(crate::error::DecodeError::PayloadTooShort.into());
        };
        if class_id == ProtocolClass::Connection.id() {
            return Err(ProtocolError::InvalidChannel { class_id, channel });
        }
        if !self.registry.has_class(class_id) {
            // Classes the gateway does not model only need an open channel.
            self.channels.require_open(channel)?;
            return Ok(Action::Forward);
        }

        let method = self.registry.decode_payload(&frame.payload)?;
        match method.kind() {
            MethodKind::ChannelOpen => self.channels.open(channel)?,
            MethodKind::ChannelClose => self.channels.begin_close(channel)?,
            MethodKind::ChannelCloseOk => {
                self.channels.require_open(channel)?;
                self.channels.remove(channel);
            }
            MethodKind::ChannelFlow | MethodKind::ChannelFlowOk => {
                self.channels.require_open(channel)?;
            }
            _ => return Err(self.unexpected(&method)),
        }
        Ok(Action::Forward)
    }

    fn on_closing_frame(&mut self, frame: &Frame) -> Result<Action, ProtocolError> {
        match connection_close_kind(frame) {
            Some(MethodKind::ConnectionCloseOk) => {
                self.state = ConnectionState::Closed;
                Ok(if self.routed {
                    Action::Forward
                } else {
                    Action::Terminate(None)
                })
            }
            Some(MethodKind::ConnectionClose) => {
                if self.routed {
                    Ok(Action::Forward)
                } else {
                    self.state = ConnectionState::Closed;
                    Ok(Action::Terminate(Some(MethodInstance::connection_close_ok())))
                }
            }
            // Everything else is discarded until the close completes.
            _ => Ok(if self.routed {
                Action::Forward
            } else {
                Action::Ignore
            }),
        }
    }

    /// Light tracking of a client frame in opaque forwarding.
    ///
    /// Connection close handshakes are observed, so a clean close is not
    /// mistaken for losing the broker, and channel lifecycle methods are
    /// recorded without being enforced.
    pub fn observe_client_frame(&mut self, frame: &Frame) {
        if self.observe_close(frame) {
            return;
        }
        let channel = frame.channel;
        match self.channel_method(frame) {
            Some(MethodKind::ChannelOpen) => {
                let _ = self.channels.open(channel);
            }
            Some(MethodKind::ChannelClose) => {
                let _ = self.channels.begin_close(channel);
            }
            Some(MethodKind::ChannelCloseOk) => {
                self.channels.remove(channel);
            }
            _ => {}
        }
    }

    /// Track a frame travelling from the broker to the client.
    ///
    /// Channel lifecycle methods keep the channel table in step with the
    /// broker's view.
    pub fn observe_upstream_frame(&mut self, frame: &Frame) {
        if self.observe_close(frame) {
            return;
        }
        let channel = frame.channel;
        match self.channel_method(frame) {
            Some(MethodKind::ChannelOpenOk) => self.channels.confirm(channel),
            Some(MethodKind::ChannelCloseOk) => {
                self.channels.remove(channel);
            }
            Some(MethodKind::ChannelClose) => {
                let _ = self.channels.begin_close(channel);
            }
            _ => {}
        }
    }

    /// Kind of a channel-class method frame on a non-zero channel.
    fn channel_method(&self, frame: &Frame) -> Option<MethodKind> {
        if frame.channel == 0 {
            return None;
        }
        let (class_id, _) = frame.method_ids()?;
        if class_id != ProtocolClass::Channel.id() {
            return None;
        }
        self.registry
            .decode_payload(&frame.payload)
            .ok()
            .map(|method| method.kind())
    }

    fn observe_close(&mut self, frame: &Frame) -> bool {
        match connection_close_kind(frame) {
            Some(MethodKind::ConnectionClose) => {
                if self.state != ConnectionState::Closed {
                    self.state = ConnectionState::Closing;
                }
                true
            }
            Some(MethodKind::ConnectionCloseOk) => {
                self.state = ConnectionState::Closed;
                true
            }
            _ => false,
        }
    }
}

/// Peek whether a frame is `connection.close` or `close-ok` on channel 0.
pub fn connection_close_kind(frame: &Frame) -> Option<MethodKind> {
    if frame.channel != 0 {
        return None;
    }
    match frame.method_ids()? {
        (10, 50) => Some(MethodKind::ConnectionClose),
        (10, 51) => Some(MethodKind::ConnectionCloseOk),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::reply_code;
    use crate::error::DecodeError;
    use crate::protocol::PROTOCOL_HEADER;

    fn machine() -> ConnectionStateMachine {
        ConnectionStateMachine::new(
            Arc::new(ConnectionSettings::default()),
            Arc::new(MethodRegistry::standard()),
        )
    }

    fn method_frame(channel: u16, method: &MethodInstance) -> Frame {
        MethodRegistry::standard().encode_frame(channel, method).unwrap()
    }

    fn start_ok(mechanism: &str) -> MethodInstance {
        MethodInstance::connection_start_ok(
            FieldTable::new().with("product", "test"),
            mechanism,
            Bytes::from_static(b"\0guest\0guest"),
            "en_US",
        )
    }

    fn open_machine() -> ConnectionStateMachine {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        sm.on_frame(&method_frame(0, &start_ok("PLAIN"))).unwrap();
        sm.on_frame(&method_frame(0, &MethodInstance::connection_tune_ok(0, 0, 0)))
            .unwrap();
        sm.on_frame(&method_frame(0, &MethodInstance::connection_open("/vhostA")))
            .unwrap();
        sm.mark_open();
        sm
    }

    #[test]
    fn test_full_handshake() {
        let mut sm = machine();
        let start = sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        assert_eq!(start.kind(), MethodKind::ConnectionStart);
        assert_eq!(
            start.long_str("mechanisms").map(|b| &b[..]),
            Some(&b"PLAIN AMQPLAIN"[..])
        );

        let tune = sm.on_frame(&method_frame(0, &start_ok("PLAIN"))).unwrap();
        assert_eq!(
            tune,
            Action::Reply(MethodInstance::connection_tune(2047, 131_072, 60))
        );

        let tuned = sm
            .on_frame(&method_frame(0, &MethodInstance::connection_tune_ok(100, 65_536, 30)))
            .unwrap();
        assert_eq!(
            tuned,
            Action::Tuned(TuneParams {
                channel_max: 100,
                frame_max: 65_536,
                heartbeat: 30
            })
        );

        let route = sm
            .on_frame(&method_frame(0, &MethodInstance::connection_open("/vhostA")))
            .unwrap();
        assert_eq!(
            route,
            Action::Route {
                virtual_host: "/vhostA".into()
            }
        );
        assert_eq!(sm.state(), ConnectionState::Opening);

        let handshake = sm.client_handshake().unwrap();
        assert_eq!(handshake.mechanism, "PLAIN");
        assert_eq!(handshake.virtual_host, "/vhostA");
        assert_eq!(handshake.tune.frame_max, 65_536);

        sm.mark_open();
        assert_eq!(sm.state(), ConnectionState::Active);
    }

    #[test]
    fn test_out_of_order_method_is_fatal() {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        let err = sm
            .on_frame(&method_frame(0, &MethodInstance::connection_open("/")))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnexpectedMethod {
                state: "awaiting start-ok",
                class_id: 10,
                method_id: 40
            }
        );
        assert_eq!(err.reply_code(), reply_code::UNEXPECTED_FRAME);
    }

    #[test]
    fn test_frame_before_header_rejected() {
        let mut sm = machine();
        assert!(matches!(
            sm.on_frame(&Frame::heartbeat()),
            Err(ProtocolError::UnexpectedFrame { .. })
        ));
    }

    #[test]
    fn test_bad_protocol_header() {
        let mut sm = machine();
        assert!(matches!(
            sm.on_protocol_header(b"AMQP\x01\x01\x00\x0a"),
            Err(ProtocolError::BadProtocolHeader(_))
        ));
    }

    #[test]
    fn test_unsupported_mechanism() {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        let err = sm
            .on_frame(&method_frame(0, &start_ok("EXTERNAL")))
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedMechanism("EXTERNAL".into()));
        assert_eq!(err.reply_code(), reply_code::ACCESS_REFUSED);
    }

    #[test]
    fn test_tune_negotiation_rules() {
        let offer = TuneParams {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 60,
        };
        let zeros = TuneParams {
            channel_max: 0,
            frame_max: 0,
            heartbeat: 0,
        };
        assert_eq!(
            TuneParams::negotiate(offer, zeros).unwrap(),
            TuneParams {
                heartbeat: 0,
                ..offer
            }
        );

        let slower = TuneParams {
            heartbeat: 90,
            ..offer
        };
        assert!(matches!(
            TuneParams::negotiate(offer, slower),
            Err(ProtocolError::TuneRejected { field: "heartbeat", .. })
        ));

        let too_big = TuneParams {
            frame_max: 262_144,
            ..offer
        };
        assert_eq!(
            TuneParams::negotiate(offer, too_big),
            Err(ProtocolError::TuneRejected {
                field: "frame-max",
                requested: 262_144,
                limit: 131_072
            })
        );

        let too_small = TuneParams {
            frame_max: 1024,
            ..offer
        };
        assert!(matches!(
            TuneParams::negotiate(offer, too_small),
            Err(ProtocolError::TuneRejected { field: "frame-max", .. })
        ));
    }

    #[test]
    fn test_zero_heartbeat_disables_heartbeats() {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        sm.on_frame(&method_frame(0, &start_ok("PLAIN"))).unwrap();
        let tuned = sm
            .on_frame(&method_frame(0, &MethodInstance::connection_tune_ok(0, 0, 0)))
            .unwrap();
        assert_eq!(
            tuned,
            Action::Tuned(TuneParams {
                channel_max: 2047,
                frame_max: 131_072,
                heartbeat: 0
            })
        );
    }

    #[test]
    fn test_unknown_method_during_handshake() {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        let frame = Frame::new(FrameType::Method, 0, Bytes::from_static(&[0, 10, 0, 99]));
        let err = sm.on_frame(&frame).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::Decode(DecodeError::UnknownMethod {
                class_id: 10,
                method_id: 99
            })
        );
        assert_eq!(err.reply_code(), reply_code::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_client_close_during_handshake() {
        let mut sm = machine();
        sm.on_protocol_header(&PROTOCOL_HEADER).unwrap();
        let close = MethodInstance::connection_close(200, "bye", (0, 0));
        assert_eq!(
            sm.on_frame(&method_frame(0, &close)).unwrap(),
            Action::Terminate(Some(MethodInstance::connection_close_ok()))
        );
        assert!(sm.is_closed());
    }

    #[test]
    fn test_channel_lifecycle_when_active() {
        let mut sm = open_machine();
        assert_eq!(
            sm.on_frame(&method_frame(1, &MethodInstance::channel_open())).unwrap(),
            Action::Forward
        );
        sm.observe_upstream_frame(&method_frame(1, &MethodInstance::channel_open_ok()));
        assert_eq!(sm.channels().state(1), Some(crate::connection::ChannelState::Active));

        let body = Frame::new(FrameType::Body, 1, Bytes::from_static(b"payload"));
        assert_eq!(sm.on_frame(&body).unwrap(), Action::Forward);

        // basic.publish is not modelled but still needs an open channel
        let publish = Frame::new(FrameType::Method, 1, Bytes::from_static(&[0, 60, 0, 40]));
        assert_eq!(sm.on_frame(&publish).unwrap(), Action::Forward);

        let close = MethodInstance::channel_close(200, "bye", (0, 0));
        sm.on_frame(&method_frame(1, &close)).unwrap();
        sm.observe_upstream_frame(&method_frame(1, &MethodInstance::channel_close_ok()));
        assert!(sm.channels().is_empty());
    }

    #[test]
    fn test_content_on_unopened_channel() {
        let mut sm = open_machine();
        let body = Frame::new(FrameType::Body, 3, Bytes::from_static(b"x"));
        assert_eq!(sm.on_frame(&body), Err(ProtocolError::ChannelNotOpen(3)));

        let far = Frame::new(FrameType::Body, 4000, Bytes::from_static(b"x"));
        assert!(matches!(
            sm.on_frame(&far),
            Err(ProtocolError::ChannelOutOfRange { channel: 4000, .. })
        ));
    }

    #[test]
    fn test_connection_method_on_channel() {
        let mut sm = open_machine();
        let err = sm
            .on_frame(&method_frame(2, &MethodInstance::connection_close_ok()))
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidChannel {
                class_id: 10,
                channel: 2
            }
        );
    }

    #[test]
    fn test_opaque_observation_tracks_channels() {
        let mut sm = open_machine();
        sm.observe_client_frame(&method_frame(2, &MethodInstance::channel_open()));
        assert_eq!(sm.channels().state(2), Some(crate::connection::ChannelState::Opening));
        sm.observe_upstream_frame(&method_frame(2, &MethodInstance::channel_open_ok()));
        assert_eq!(sm.channels().state(2), Some(crate::connection::ChannelState::Active));

        // Unmodelled classes and content pass without touching the table.
        sm.observe_client_frame(&Frame::new(FrameType::Method, 2, Bytes::from_static(&[0, 60, 0, 40])));
        sm.observe_client_frame(&Frame::new(FrameType::Body, 9, Bytes::from_static(b"x")));
        assert_eq!(sm.channels().len(), 1);

        // The broker closes the channel, the client confirms.
        let close = MethodInstance::channel_close(406, "precondition", (50, 10));
        sm.observe_upstream_frame(&method_frame(2, &close));
        assert_eq!(sm.channels().state(2), Some(crate::connection::ChannelState::Closing));
        sm.observe_client_frame(&method_frame(2, &MethodInstance::channel_close_ok()));
        assert!(sm.channels().is_empty());
    }

    #[test]
    fn test_close_observed_in_both_directions() {
        let mut sm = open_machine();
        let close = MethodInstance::connection_close(200, "bye", (0, 0));
        sm.observe_client_frame(&method_frame(0, &close));
        assert_eq!(sm.state(), ConnectionState::Closing);

        sm.observe_upstream_frame(&method_frame(0, &MethodInstance::connection_close_ok()));
        assert!(sm.is_closed());
    }

    #[test]
    fn test_routed_close_is_forwarded() {
        let mut sm = open_machine();
        let close = MethodInstance::connection_close(200, "bye", (0, 0));
        assert_eq!(sm.on_frame(&method_frame(0, &close)).unwrap(), Action::Forward);
        assert_eq!(sm.state(), ConnectionState::Closing);
    }
}
