//! Transport collaborator interfaces.

use super::messages::{Envelope, Message};
use crate::error::NetworkError;
use crate::types::{ConnectionId, OsdId};

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// A peer OSD, by id.
    Osd(OsdId),
    /// The cluster monitor.
    Mon,
    /// An established connection (clients, admin sockets).
    Conn(ConnectionId),
}

/// Sends messages on behalf of this node.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, dest: Destination, msg: Message) -> Result<(), NetworkError>;
}

/// Receives messages from the transport.
pub trait Dispatcher: Send + Sync {
    /// Handle an inbound message. Returns false if the message was not claimed.
    fn ms_dispatch(&self, envelope: Envelope) -> bool;

    /// The connection was closed. Returns false if it was unknown.
    fn ms_handle_reset(&self, conn: ConnectionId) -> bool;
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::{Ping, PingOp};

    #[test]
    fn test_message_encoding() {
        let msg = Message::Ping(Ping {
            op: PingOp::Reply,
            epoch: 9,
        });
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        match decoded {
            Message::Ping(ping) => {
                assert_eq!(ping.op, PingOp::Reply);
                assert_eq!(ping.epoch, 9);
            }
            other => panic!("wrong message type: {:?}", other),
        }
    }
}
