//! Message catalogue and transport interfaces.

pub mod messages;
pub mod transport;

pub use messages::{Envelope, Message, MessageClass};
pub use transport::{decode_message, encode_message, Destination, Dispatcher, Transport};
