//! Per-client connection handling.
//!
//! [`ConnectionStateMachine`] drives the handshake and validates client
//! traffic. [`ChannelTable`] and [`HeartbeatMonitor`] are its bookkeeping.
//! Everything here is synchronous; sockets live in the gateway.

mod channel;
mod close;
mod heartbeat;
mod state;

pub use channel::{ChannelState, ChannelTable};
pub use close::{reply_code, CloseReason};
pub use heartbeat::{HeartbeatMonitor, HeartbeatStatus};
pub use state::{
    connection_close_kind, default_server_properties, Action, ClientHandshake, ConnectionSettings,
    ConnectionState, ConnectionStateMachine, NegotiationStep, TuneParams,
};
