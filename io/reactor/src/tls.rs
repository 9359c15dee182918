//! TLS as a byte-in/byte-out filter.
//!
//! The provider itself lives outside this crate; the connection only needs
//! a filter that turns wire ciphertext into plaintext (and back) and tells
//! it when the handshake finished or the peer sent a close alert.

use std::io;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Handshake in progress; no application data yet.
    Handshaking,
    /// Application data flows.
    Established,
    /// Peer sent a close alert.
    Closed,
}

pub trait TlsFilter: Send {
    /// Feed ciphertext read from the wire. Decrypted application bytes
    /// are appended to `plaintext`; any handshake ciphertext the filter
    /// wants on the wire is appended to `outbound`.
    fn read_ciphertext(
        &mut self,
        input: &[u8],
        plaintext: &mut Buffer,
        outbound: &mut Buffer,
    ) -> io::Result<TlsState>;

    /// Encrypt application bytes; ciphertext is appended to `outbound`.
    fn write_plaintext(&mut self, input: &[u8], outbound: &mut Buffer) -> io::Result<()>;

    /// Append a close alert to `outbound`.
    fn close(&mut self, outbound: &mut Buffer);

    fn is_established(&self) -> bool;
}
