//! Length-prefixed framing over a [`reactor::TcpServer`].
//!
//! Wire format: `u32` little-endian payload length, then the payload.
//! Structured mode carries a JSON object with a numeric `"type"` field;
//! opaque mode carries a `u32` little-endian type followed by raw bytes.

pub mod codec;
pub mod server;

pub use codec::{PING_TYPE, PONG_TYPE, decode_frame, encode_frame, encode_json, encode_opaque};
pub use server::{FrameMode, FrameServer};
