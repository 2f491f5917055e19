use async_trait::async_trait;

use crate::error::Result;

/// Conn is a datagram oriented connection produced by a transport layer
/// (ICE, DTLS, a mux endpoint) and consumed by the one above it.
///
/// `recv` resolves with `Error::ErrConnClosed` once the connection has been closed.
#[async_trait]
pub trait Conn: Send + Sync {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}
