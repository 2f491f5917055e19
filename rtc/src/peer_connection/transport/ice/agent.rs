//! The contract an ICE implementation fulfils for the gatherer and the
//! transport. Connectivity checks and candidate discovery live behind it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use shared::Conn;
use shared::error::Result;

use super::candidate::RTCIceCandidate;
use super::candidate_pair::RTCIceCandidatePair;
use super::state::RTCIceTransportState;
use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
use crate::peer_connection::transport::ice::server::RTCIceServer;

/// `None` signals the end of gathering.
pub type OnCandidateHdlrFn = Box<dyn Fn(Option<RTCIceCandidate>) + Send + Sync>;
pub type OnConnectionStateChangeHdlrFn = Box<dyn Fn(RTCIceTransportState) + Send + Sync>;
pub type OnSelectedCandidatePairChangeHdlrFn = Box<dyn Fn(RTCIceCandidatePair) + Send + Sync>;

#[derive(Default, Debug, Clone)]
pub struct IceAgentConfig {
    pub ice_servers: Vec<RTCIceServer>,
    pub policy: RTCIceTransportPolicy,
    pub lite: bool,
    /// Empty credentials let the agent generate its own.
    pub local_ufrag: String,
    pub local_pwd: String,
}

pub trait IceAgentFactory: Send + Sync {
    fn new_agent(&self, config: IceAgentConfig) -> Result<Arc<dyn IceAgent>>;
}

#[async_trait]
pub trait IceAgent: Send + Sync {
    fn on_candidate(&self, f: OnCandidateHdlrFn);
    fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn);
    fn on_selected_candidate_pair_change(&self, f: OnSelectedCandidatePairChangeHdlrFn);

    /// Starts candidate discovery; candidates are reported through `on_candidate`.
    async fn gather_candidates(&self) -> Result<()>;
    async fn get_local_candidates(&self) -> Result<Vec<RTCIceCandidate>>;
    async fn add_remote_candidate(&self, candidate: RTCIceCandidate) -> Result<()>;

    async fn get_local_user_credentials(&self) -> (String, String);
    async fn get_remote_user_credentials(&self) -> (String, String);
    async fn set_remote_credentials(&self, ufrag: String, pwd: String) -> Result<()>;

    /// Replaces the local credentials and drops all candidates. Empty
    /// credentials are generated by the agent.
    async fn restart(&self, ufrag: String, pwd: String) -> Result<()>;

    /// Connects as the controlling agent. A message on `cancel_rx` aborts.
    async fn dial(
        &self,
        cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<dyn Conn>>;

    /// Connects as the controlled agent. A message on `cancel_rx` aborts.
    async fn accept(
        &self,
        cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<dyn Conn>>;

    async fn get_selected_candidate_pair(&self) -> Option<RTCIceCandidatePair>;
    async fn close(&self) -> Result<()>;
}
