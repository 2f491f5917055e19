use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::mpsc;

use shared::Conn;
use shared::error::{Error, Result};
use shared::util::math_rand_alpha;

use super::Hub;
use super::conn::{PipeConn, pipe};
use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
use crate::peer_connection::transport::ice::agent::{
    IceAgent, IceAgentConfig, OnCandidateHdlrFn, OnConnectionStateChangeHdlrFn,
    OnSelectedCandidatePairChangeHdlrFn,
};
use crate::peer_connection::transport::ice::candidate::RTCIceCandidate;
use crate::peer_connection::transport::ice::candidate_pair::RTCIceCandidatePair;
use crate::peer_connection::transport::ice::candidate_type::RTCIceCandidateType;
use crate::peer_connection::transport::ice::protocol::RTCIceProtocol;
use crate::peer_connection::transport::ice::state::RTCIceTransportState;

const UFRAG_LEN: usize = 16;
const PWD_LEN: usize = 32;
const HOST_PORT: u16 = 5000;
const HOST_PRIORITY: u32 = 2130706431;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type CandidateHandler = Arc<dyn Fn(Option<RTCIceCandidate>) + Send + Sync>;
type StateHandler = Arc<dyn Fn(RTCIceTransportState) + Send + Sync>;
type PairHandler = Arc<dyn Fn(RTCIceCandidatePair) + Send + Sync>;

#[derive(Default)]
struct AgentState {
    local_ufrag: String,
    local_pwd: String,
    remote_ufrag: String,
    remote_pwd: String,
    local_candidates: Vec<RTCIceCandidate>,
    remote_candidates: Vec<RTCIceCandidate>,
    selected_pair: Option<RTCIceCandidatePair>,
    conn: Option<Arc<PipeConn>>,
    closed: bool,

    on_candidate: Option<CandidateHandler>,
    on_state_change: Option<StateHandler>,
    on_selected_pair_change: Option<PairHandler>,
}

/// In-process ICE agent. Connectivity is established by pairing agents
/// through the hub by their username fragments, once a remote candidate
/// is known.
pub(crate) struct VNetAgent {
    hub: Arc<Mutex<Hub>>,
    policy: RTCIceTransportPolicy,
    state: Mutex<AgentState>,
}

impl VNetAgent {
    pub(crate) fn new(hub: Arc<Mutex<Hub>>, config: IceAgentConfig) -> Self {
        let (local_ufrag, local_pwd) = credentials_or_random(config.local_ufrag, config.local_pwd);
        VNetAgent {
            hub,
            policy: config.policy,
            state: Mutex::new(AgentState {
                local_ufrag,
                local_pwd,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RTCIceTransportState) {
        let handler = self.lock().on_state_change.clone();
        if let Some(f) = handler {
            f(state);
        }
    }

    async fn wait_or_cancel(cancel_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
            // a dropped sender cancels as well
            _ = cancel_rx.recv() => Err(Error::ErrCanceledByCaller),
        }
    }

    fn connected(&self, conn: PipeConn) -> Result<Arc<dyn Conn>> {
        let conn = Arc::new(conn);
        let (pair, handler) = {
            let mut s = self.lock();
            if s.closed {
                return Err(Error::ErrClosedPipe);
            }
            let pair = RTCIceCandidatePair::new(
                s.local_candidates.first().cloned().unwrap_or_default(),
                s.remote_candidates.first().cloned().unwrap_or_default(),
            );
            s.selected_pair = Some(pair.clone());
            s.conn = Some(Arc::clone(&conn));
            (pair, s.on_selected_pair_change.clone())
        };

        debug!("vnet agent selected pair {pair}");
        self.set_state(RTCIceTransportState::Connected);
        if let Some(f) = handler {
            f(pair);
        }

        Ok(conn)
    }
}

fn credentials_or_random(ufrag: String, pwd: String) -> (String, String) {
    let ufrag = if ufrag.is_empty() {
        math_rand_alpha(UFRAG_LEN)
    } else {
        ufrag
    };
    let pwd = if pwd.is_empty() {
        math_rand_alpha(PWD_LEN)
    } else {
        pwd
    };
    (ufrag, pwd)
}

#[async_trait]
impl IceAgent for VNetAgent {
    fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.lock().on_candidate = Some(Arc::from(f));
    }

    fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn) {
        self.lock().on_state_change = Some(Arc::from(f));
    }

    fn on_selected_candidate_pair_change(&self, f: OnSelectedCandidatePairChangeHdlrFn) {
        self.lock().on_selected_pair_change = Some(Arc::from(f));
    }

    async fn gather_candidates(&self) -> Result<()> {
        let candidate = if self.policy == RTCIceTransportPolicy::Relay {
            None
        } else {
            let host = {
                let mut hub = self.hub.lock().unwrap_or_else(PoisonError::into_inner);
                hub.next_host += 1;
                hub.next_host
            };
            let address = Ipv4Addr::from(0x0a00_0000 | host).to_string();
            let mut candidate = RTCIceCandidate {
                foundation: host.to_string(),
                priority: HOST_PRIORITY,
                address,
                protocol: RTCIceProtocol::Udp,
                port: HOST_PORT,
                typ: RTCIceCandidateType::Host,
                component: 1,
                ..Default::default()
            };
            candidate.stats_id = format!(
                "candidate:{}:{}:{}",
                candidate.address, candidate.port, candidate.typ
            );
            Some(candidate)
        };

        let handler = {
            let mut s = self.lock();
            if s.closed {
                return Err(Error::ErrClosedPipe);
            }
            if let Some(candidate) = &candidate {
                s.local_candidates.push(candidate.clone());
            }
            s.on_candidate.clone()
        };

        if let Some(f) = handler {
            tokio::spawn(async move {
                if let Some(candidate) = candidate {
                    f(Some(candidate));
                }
                f(None);
            });
        }

        Ok(())
    }

    async fn get_local_candidates(&self) -> Result<Vec<RTCIceCandidate>> {
        Ok(self.lock().local_candidates.clone())
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidate) -> Result<()> {
        trace!("vnet agent adds remote candidate {candidate}");
        self.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn get_local_user_credentials(&self) -> (String, String) {
        let s = self.lock();
        (s.local_ufrag.clone(), s.local_pwd.clone())
    }

    async fn get_remote_user_credentials(&self) -> (String, String) {
        let s = self.lock();
        (s.remote_ufrag.clone(), s.remote_pwd.clone())
    }

    async fn set_remote_credentials(&self, ufrag: String, pwd: String) -> Result<()> {
        let mut s = self.lock();
        s.remote_ufrag = ufrag;
        s.remote_pwd = pwd;
        Ok(())
    }

    async fn restart(&self, ufrag: String, pwd: String) -> Result<()> {
        let (ufrag, pwd) = credentials_or_random(ufrag, pwd);
        let mut s = self.lock();
        if s.closed {
            return Err(Error::ErrClosedPipe);
        }
        s.local_ufrag = ufrag;
        s.local_pwd = pwd;
        s.remote_ufrag.clear();
        s.remote_pwd.clear();
        s.local_candidates.clear();
        s.remote_candidates.clear();
        Ok(())
    }

    async fn dial(
        &self,
        mut cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<dyn Conn>> {
        self.set_remote_credentials(remote_ufrag.clone(), remote_pwd)
            .await?;
        self.set_state(RTCIceTransportState::Checking);

        let local_ufrag = loop {
            {
                let s = self.lock();
                if s.closed {
                    return Err(Error::ErrClosedPipe);
                }
                if !s.remote_candidates.is_empty() {
                    break s.local_ufrag.clone();
                }
            }
            VNetAgent::wait_or_cancel(&mut cancel_rx).await?;
        };

        let (local, remote) = pipe();
        self.hub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .insert((remote_ufrag, local_ufrag), remote);

        self.connected(local)
    }

    async fn accept(
        &self,
        mut cancel_rx: mpsc::Receiver<()>,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<dyn Conn>> {
        self.set_remote_credentials(remote_ufrag.clone(), remote_pwd)
            .await?;
        self.set_state(RTCIceTransportState::Checking);

        loop {
            let local_ufrag = {
                let s = self.lock();
                if s.closed {
                    return Err(Error::ErrClosedPipe);
                }
                s.local_ufrag.clone()
            };

            let conn = self
                .hub
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .remove(&(local_ufrag, remote_ufrag.clone()));
            if let Some(conn) = conn {
                return self.connected(conn);
            }

            VNetAgent::wait_or_cancel(&mut cancel_rx).await?;
        }
    }

    async fn get_selected_candidate_pair(&self) -> Option<RTCIceCandidatePair> {
        self.lock().selected_pair.clone()
    }

    async fn close(&self) -> Result<()> {
        let conn = {
            let mut s = self.lock();
            if s.closed {
                return Ok(());
            }
            s.closed = true;
            s.conn.take()
        };

        if let Some(conn) = conn {
            conn.close().await?;
        }
        self.set_state(RTCIceTransportState::Closed);
        Ok(())
    }
}
