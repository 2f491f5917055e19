//! In-process transport engines.
//!
//! `VNet` implements the ICE, DTLS, SRTP and SCTP engines on top of
//! in-memory pipes so that connections living in the same process can be
//! wired together without sockets. Install it with
//! `SettingEngine::set_vnet`; every connection sharing a `VNet` can reach
//! the others.
//!
//! The engines keep the layering of the real stack: the ICE agent yields a
//! datagram connection, the DTLS engine exchanges certificates over the DTLS
//! endpoint of the mux (the fingerprints in the SDP are verified against
//! them), the SRTP session carries RTP demultiplexed by SSRC, and the SCTP
//! association frames data channel messages over the DTLS application
//! channel. None of it is encrypted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use shared::Conn;
use shared::error::Result;

use crate::peer_connection::transport::dtls::engine::{
    DtlsEngine, DtlsHandshakeConfig, DtlsHandshakeResult, SrtpEngine, SrtpSession,
};
use crate::peer_connection::transport::ice::agent::{IceAgent, IceAgentConfig, IceAgentFactory};
use crate::peer_connection::transport::sctp::engine::{SctpAssociation, SctpEngine};

mod agent;
pub(crate) mod conn;
mod dtls;
mod sctp;
mod srtp;

/// Connections waiting to be accepted, keyed by (accepting ufrag, dialing ufrag).
#[derive(Default)]
pub(crate) struct Hub {
    next_host: u32,
    pending: HashMap<(String, String), conn::PipeConn>,
}

/// VNet is a virtual network shared by the connections of one process.
#[derive(Default, Clone)]
pub struct VNet {
    hub: Arc<Mutex<Hub>>,
}

impl VNet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IceAgentFactory for VNet {
    fn new_agent(&self, config: IceAgentConfig) -> Result<Arc<dyn IceAgent>> {
        Ok(Arc::new(agent::VNetAgent::new(Arc::clone(&self.hub), config)))
    }
}

#[async_trait]
impl DtlsEngine for VNet {
    async fn handshake(
        &self,
        conn: Arc<dyn Conn>,
        config: DtlsHandshakeConfig,
    ) -> Result<DtlsHandshakeResult> {
        dtls::handshake(conn, config).await
    }
}

#[async_trait]
impl SrtpEngine for VNet {
    async fn new_session(
        &self,
        conn: Arc<dyn Conn>,
        _is_client: bool,
    ) -> Result<Arc<dyn SrtpSession>> {
        Ok(Arc::new(srtp::VNetSrtpSession::new(conn)))
    }
}

#[async_trait]
impl SctpEngine for VNet {
    async fn associate(
        &self,
        conn: Arc<dyn Conn>,
        _is_client: bool,
        max_message_size: u32,
    ) -> Result<Arc<dyn SctpAssociation>> {
        Ok(Arc::new(sctp::VNetAssociation::new(conn, max_message_size)))
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::peer_connection::transport::ice::state::RTCIceTransportState;

    #[tokio::test]
    async fn test_vnet_agents_connect() -> Result<()> {
        let vnet = VNet::new();
        let a = vnet.new_agent(IceAgentConfig::default())?;
        let b = vnet.new_agent(IceAgentConfig::default())?;

        let connected = Arc::new(AtomicUsize::new(0));
        for agent in [&a, &b] {
            let connected = Arc::clone(&connected);
            agent.on_connection_state_change(Box::new(move |state| {
                if state == RTCIceTransportState::Connected {
                    connected.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        a.gather_candidates().await?;
        b.gather_candidates().await?;
        for candidate in b.get_local_candidates().await? {
            a.add_remote_candidate(candidate).await?;
        }
        let a_candidates = a.get_local_candidates().await?;
        assert_eq!(1, a_candidates.len());
        assert_eq!("10.0.0.1", a_candidates[0].address);

        let (a_ufrag, a_pwd) = a.get_local_user_credentials().await;
        let (b_ufrag, b_pwd) = b.get_local_user_credentials().await;

        let (_a_cancel_tx, a_cancel_rx) = mpsc::channel(1);
        let (_b_cancel_tx, b_cancel_rx) = mpsc::channel(1);
        let (a_conn, b_conn) = tokio::join!(
            a.dial(a_cancel_rx, b_ufrag, b_pwd),
            b.accept(b_cancel_rx, a_ufrag, a_pwd)
        );
        let (a_conn, b_conn) = (a_conn?, b_conn?);

        a_conn.send(b"hi").await?;
        let mut buf = [0u8; 4];
        let n = b_conn.recv(&mut buf).await?;
        assert_eq!(b"hi", &buf[..n]);
        assert_eq!(2, connected.load(Ordering::SeqCst));
        assert!(a.get_selected_candidate_pair().await.is_some());

        a.close().await?;
        b.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_vnet_dial_cancelled() -> Result<()> {
        let vnet = VNet::new();
        let a = vnet.new_agent(IceAgentConfig::default())?;

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        cancel_tx.send(()).await.ok();
        let result = a.dial(cancel_rx, "remote".to_owned(), "pwd".to_owned()).await;
        assert!(result.is_err());
        Ok(())
    }
}
