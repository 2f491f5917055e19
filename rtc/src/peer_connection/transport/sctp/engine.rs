//! Data channel association engine consumed by the SCTP transport.

use std::sync::Arc;

use async_trait::async_trait;

use shared::Conn;
use shared::error::Result;

/// DCEP parameters of a data channel, RFC 8832 section 5.1.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DataChannelConfig {
    pub label: String,
    pub protocol: String,
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub negotiated: bool,
}

#[async_trait]
pub trait SctpEngine: Send + Sync {
    async fn associate(
        &self,
        conn: Arc<dyn Conn>,
        is_client: bool,
        max_message_size: u32,
    ) -> Result<Arc<dyn SctpAssociation>>;
}

#[async_trait]
pub trait SctpAssociation: Send + Sync {
    /// Opens a stream and announces it to the remote peer, unless negotiated.
    async fn open_channel(
        &self,
        id: u16,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelStream>>;

    /// Resolves with the next stream opened by the remote peer.
    async fn accept_channel(&self) -> Result<(Arc<dyn DataChannelStream>, DataChannelConfig)>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait DataChannelStream: Send + Sync {
    fn stream_identifier(&self) -> u16;

    /// Reads one message, returning its length and whether it is text.
    async fn read(&self, buf: &mut [u8]) -> Result<(usize, bool)>;
    async fn write(&self, data: &[u8], is_string: bool) -> Result<usize>;
    async fn close(&self) -> Result<()>;
}
