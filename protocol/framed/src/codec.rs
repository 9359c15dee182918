//! Frame encoding and decoding.

use reactor::Buffer;

/// Liveness probe message type.
pub const PING_TYPE: u32 = 100;
/// Liveness reply message type.
pub const PONG_TYPE: u32 = 200;

const HEADER_LEN: usize = 4;

/// Frame a payload: the length prefix lands in the buffer's prepend area,
/// so the payload bytes are written exactly once.
pub fn encode_frame(payload: &[u8]) -> Buffer {
    let mut buf = Buffer::with_capacity(payload.len());
    buf.append(payload);
    buf.prepend(&(payload.len() as u32).to_le_bytes());
    buf
}

/// Frame a structured (JSON) message.
pub fn encode_json(value: &serde_json::Value) -> Buffer {
    encode_frame(value.to_string().as_bytes())
}

/// Frame an opaque message: `u32` LE type, then the raw bytes.
pub fn encode_opaque(msg_type: u32, body: &[u8]) -> Buffer {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&msg_type.to_le_bytes());
    payload.extend_from_slice(body);
    encode_frame(&payload)
}

/// Pop one complete frame's payload off the buffer, or `None` until the
/// prefix and the full payload are both buffered.
pub fn decode_frame(buf: &mut Buffer) -> Option<Vec<u8>> {
    if buf.readable_bytes() < HEADER_LEN {
        return None;
    }
    let header: [u8; 4] = buf.peek()[..HEADER_LEN].try_into().expect("checked");
    let len = u32::from_le_bytes(header) as usize;
    if buf.readable_bytes() < HEADER_LEN + len {
        return None;
    }
    buf.retrieve(HEADER_LEN);
    Some(buf.read(len))
}
