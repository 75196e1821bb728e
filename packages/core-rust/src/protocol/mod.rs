//! Listener registration protocol.
//!
//! A listener dials the relay, opens one dedicated stream, writes a
//! [`RegisterListenerRequest`], half-closes its write direction and then reads
//! a single [`RegisterListenerResponse`] from the same stream. After an
//! [`ResponseCode::Ok`] the connection carries HTTP traffic forwarded by the
//! relay.

pub mod code;
pub mod codec;
pub mod messages;

pub use code::ResponseCode;
pub use codec::{read_message, write_message, CodecError, Decoder, Encoder, MAX_MESSAGE_SIZE};
pub use messages::{RegisterListenerRequest, RegisterListenerResponse};

/// Protocol name, advertised as the TLS ALPN token.
pub const NAME: &str = "lightwave";

/// Current registration protocol version.
pub const VERSION: u32 = 1;

/// Application close code used when a listener shuts down cleanly.
pub const APPLICATION_OK: u32 = 0;
