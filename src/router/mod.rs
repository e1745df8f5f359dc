//! Session routing.
//!
//! Once a client has named its virtual host, [`SessionRouter`] resolves the
//! owning broker, opens the same session there, and [`forward`] relays frames
//! until either side closes. Connect and handshake failures invalidate the
//! cached owner and retry with [`RetryPolicy`] backoff.

mod forward;
mod retry;
mod session;
mod upstream;

use serde::{Deserialize, Serialize};

pub use forward::{forward, ClientSide, SessionEnd};
pub use retry::RetryPolicy;
pub use session::{RoutedSession, SessionRouter};
pub use upstream::{open_upstream, UpstreamConnection};

/// How much of the client stream is interpreted after routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Frames are delimited and passed through; only connection close is observed.
    #[default]
    Opaque,
    /// Client frames also go through the connection state machine.
    Validated,
}
