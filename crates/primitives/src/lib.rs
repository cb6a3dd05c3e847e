//! Peer endpoint types, wire codec, and hashing shared across the seeder.

pub mod encoding;
pub mod endpoint;
pub mod hash;

pub use encoding::{DecodeError, Decoder, Encoder};
pub use endpoint::{Endpoint, EndpointParseError};
pub use hash::{sha256, sha256d, Hash256};
