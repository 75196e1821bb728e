//! `ops` core: the listener registration protocol, single-message framing,
//! and the service definitions document.

pub mod protocol;
pub mod servicedef;

pub use protocol::{
    CodecError, Decoder, Encoder, RegisterListenerRequest, RegisterListenerResponse, ResponseCode,
};
pub use servicedef::Definitions;
