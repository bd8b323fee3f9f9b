//! Session multiplexing primitives shared by every session of a proxy user:
//! frames, the per-user [`Valve`] that paces and accounts their traffic, and
//! the [`Session`] that ties a logical stream to its obfuscation capabilities.

pub mod frame;
pub mod obfs;
pub mod session;
pub mod valve;

pub use frame::{FRAME_HEADER_LEN, Frame};
pub use obfs::{
    Deobfser, LengthPrefixedRead, MAX_RECORD_LEN, ObfsedRead, Obfser, RawConn, plain_deobfser,
    plain_obfser,
};
pub use session::Session;
pub use valve::Valve;
