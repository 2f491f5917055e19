//! Handshake and media protection engines consumed by the DTLS transport.

use std::sync::Arc;

use async_trait::async_trait;

use shared::Conn;
use shared::error::Result;

use crate::peer_connection::certificate::RTCCertificate;
use crate::rtp_transceiver::SSRC;

#[derive(Debug, Clone)]
pub struct DtlsHandshakeConfig {
    pub is_client: bool,
    pub certificate: RTCCertificate,
}

pub struct DtlsHandshakeResult {
    /// Application data channel on top of the handshake.
    pub conn: Arc<dyn Conn>,
    /// DER certificates presented by the remote peer, leaf first.
    pub peer_certificates: Vec<Vec<u8>>,
}

#[async_trait]
pub trait DtlsEngine: Send + Sync {
    async fn handshake(
        &self,
        conn: Arc<dyn Conn>,
        config: DtlsHandshakeConfig,
    ) -> Result<DtlsHandshakeResult>;
}

#[async_trait]
pub trait SrtpEngine: Send + Sync {
    /// Creates a session protecting RTP sent and received on `conn`.
    async fn new_session(&self, conn: Arc<dyn Conn>, is_client: bool)
    -> Result<Arc<dyn SrtpSession>>;
}

#[async_trait]
pub trait SrtpSession: Send + Sync {
    /// Opens the read stream of an SSRC announced in signaling.
    async fn open_read_stream(&self, ssrc: SSRC) -> Result<Arc<dyn RtpReadStream>>;

    /// Resolves with the next stream whose SSRC nobody opened.
    async fn accept(&self) -> Result<Arc<dyn RtpReadStream>>;

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RtpReadStream: Send + Sync {
    fn ssrc(&self) -> SSRC;

    /// Reads one marshalled RTP packet into `buf`.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}
