//! # amqp-gateway
//!
//! AMQP 0-9-1 gateway for a cluster whose namespaces are sharded across
//! broker nodes.
//!
//! The gateway negotiates the connection itself, reads the virtual host from
//! `connection.open`, resolves which broker currently owns that namespace
//! through a coordination service, and hands the session over to it. From
//! then on frames are relayed unmodified.
//!
//! ## Architecture
//!
//! - **Frame layer** ([`protocol`]): frame header, frame buffer, async reader
//! - **Method model** ([`method`]): method descriptors, field tables, registry
//! - **Connection** ([`connection`]): handshake state machine, channels, heartbeats
//! - **Lookup** ([`lookup`]): coordination client seam, single-flight ownership cache
//! - **Routing** ([`router`]): upstream handshake replay, retry, forwarding
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use amqp_gateway::lookup::{InMemoryCoordination, ServiceLookupData};
//! use amqp_gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> amqp_gateway::Result<()> {
//!     let coordination = Arc::new(InMemoryCoordination::new());
//!     coordination
//!         .register_broker(
//!             &ServiceLookupData::new("http://10.0.0.5:8080")
//!                 .with_protocol("amqp", "amqp://10.0.0.5:5673"),
//!         )
//!         .expect("valid lookup data");
//!     coordination.assign("vhostA", "http://10.0.0.5:8080");
//!
//!     let gateway = Gateway::builder()
//!         .coordination(coordination)
//!         .start()
//!         .await?;
//!
//!     gateway.wait().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod lookup;
pub mod method;
pub mod protocol;
pub mod router;
pub mod writer;

mod gateway;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayBuilder};
pub use router::ForwardMode;
