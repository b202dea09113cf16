//! Relay gateway: the broadcast/point-to-point channel used for signaling.

mod websocket;

pub use websocket::{WebSocketRelay, decode_server_message, relay_socket_url};

use crate::error::RelayError;
use crate::protocol::{ClientMessage, ServerMessage};

/// Inbound side of a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message(ServerMessage),
    /// The underlying transport went away; no further messages will arrive.
    Disconnected,
}

/// Outbound side of a relay connection. Sends are fire-and-forget; ordering
/// between two participants is preserved by the relay.
pub trait RelayGateway: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), RelayError>;
}
