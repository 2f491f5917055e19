use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use shared::Conn;
use shared::error::{Error, Result, flatten_errs};

use crate::peer_connection::transport::ice::candidate::RTCIceCandidate;
use crate::peer_connection::transport::ice::candidate_pair::RTCIceCandidatePair;
use crate::peer_connection::transport::ice::gatherer::RTCIceGatherer;
use crate::peer_connection::transport::ice::mux::{Endpoint, MatchFunc, Mux};
use crate::peer_connection::transport::ice::parameters::RTCIceParameters;
use crate::peer_connection::transport::ice::role::RTCIceRole;
use crate::peer_connection::transport::ice::state::RTCIceTransportState;

pub mod agent;
pub(crate) mod candidate;
pub(crate) mod candidate_pair;
pub(crate) mod candidate_type;
pub(crate) mod gatherer;
pub mod mux;
pub(crate) mod parameters;
pub(crate) mod protocol;
pub(crate) mod role;
pub(crate) mod server;
pub(crate) mod state;

pub(crate) type OnConnectionStateChangeHdlrFn = Arc<dyn Fn(RTCIceTransportState) + Send + Sync>;
pub(crate) type OnSelectedCandidatePairChangeHdlrFn = Arc<dyn Fn(RTCIceCandidatePair) + Send + Sync>;

#[derive(Default)]
struct IceTransportHandlers {
    on_connection_state_change: Option<OnConnectionStateChangeHdlrFn>,
    on_selected_candidate_pair_change: Option<OnSelectedCandidatePairChangeHdlrFn>,
}

#[derive(Default)]
struct IceTransportInternal {
    conn: Option<Arc<dyn Conn>>,
    mux: Option<Arc<Mux>>,
    cancel_tx: Option<mpsc::Sender<()>>,
    started: bool,
}

/// ICETransport allows an application access to information about the ICE
/// transport over which packets are sent and received.
///
/// The agent, connection and mux sit behind their own lock so that remote
/// candidates can be added while `start` waits for connectivity.
pub(crate) struct RTCIceTransport {
    gatherer: Arc<RTCIceGatherer>,

    state: Arc<Mutex<RTCIceTransportState>>,
    role: Mutex<RTCIceRole>,
    handlers: Arc<Mutex<IceTransportHandlers>>,

    internal: AsyncMutex<IceTransportInternal>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RTCIceTransport {
    /// creates a new RTCIceTransport
    pub(crate) fn new(gatherer: Arc<RTCIceGatherer>) -> Self {
        RTCIceTransport {
            gatherer,
            state: Arc::new(Mutex::new(RTCIceTransportState::New)),
            role: Mutex::new(RTCIceRole::Unspecified),
            handlers: Arc::new(Mutex::new(IceTransportHandlers::default())),
            internal: AsyncMutex::new(IceTransportInternal::default()),
        }
    }

    pub(crate) fn gatherer(&self) -> &Arc<RTCIceGatherer> {
        &self.gatherer
    }

    /// start begins connectivity checks against the remote parameters and
    /// returns once a connection is established. Controlling agents dial,
    /// controlled agents accept.
    pub(crate) async fn start(
        &self,
        params: RTCIceParameters,
        role: Option<RTCIceRole>,
    ) -> Result<()> {
        let (agent, role, cancel_rx) = {
            let mut internal = self.internal.lock().await;
            // the state only leaves New once checks run, so a second caller
            // must be turned away by the flag
            if internal.started || self.state() != RTCIceTransportState::New {
                return Err(Error::ErrICETransportNotInNew);
            }
            internal.started = true;

            let agent = self.gatherer.create_agent()?;

            let state = Arc::clone(&self.state);
            let handlers = Arc::clone(&self.handlers);
            agent.on_connection_state_change(Box::new(move |ice_state: RTCIceTransportState| {
                RTCIceTransport::do_state_change(&state, &handlers, ice_state);
            }));

            let handlers = Arc::clone(&self.handlers);
            agent.on_selected_candidate_pair_change(Box::new(move |pair: RTCIceCandidatePair| {
                debug!("ICE selected candidate pair changed: {pair}");
                let handler = lock(&handlers).on_selected_candidate_pair_change.clone();
                if let Some(f) = handler {
                    f(pair);
                }
            }));

            let role = role.unwrap_or(RTCIceRole::Controlled);
            *lock(&self.role) = role;

            let (cancel_tx, cancel_rx) = mpsc::channel(1);
            internal.cancel_tx = Some(cancel_tx);

            (agent, role, cancel_rx)
        };

        // the lock is released while waiting, candidates keep flowing in
        let conn = match role {
            RTCIceRole::Controlling => {
                agent
                    .dial(cancel_rx, params.username_fragment, params.password)
                    .await?
            }
            RTCIceRole::Controlled => {
                agent
                    .accept(cancel_rx, params.username_fragment, params.password)
                    .await?
            }
            RTCIceRole::Unspecified => return Err(Error::ErrICERoleUnknown),
        };

        let mut internal = self.internal.lock().await;
        if self.state() == RTCIceTransportState::Closed {
            conn.close().await?;
            return Err(Error::ErrClosedPipe);
        }
        internal.mux = Some(Mux::new(Arc::clone(&conn)));
        internal.conn = Some(conn);

        Ok(())
    }

    /// restart replaces the local credentials and gathers again.
    pub(crate) async fn restart(&self) -> Result<()> {
        self.gatherer.restart_agent().await?;
        self.gatherer.gather().await
    }

    /// stop irreversibly stops the ICETransport.
    pub(crate) async fn stop(&self) -> Result<()> {
        if self.state() == RTCIceTransportState::Closed {
            return Ok(());
        }
        RTCIceTransport::do_state_change(&self.state, &self.handlers, RTCIceTransportState::Closed);

        let (cancel_tx, mux) = {
            let mut internal = self.internal.lock().await;
            internal.conn.take();
            (internal.cancel_tx.take(), internal.mux.take())
        };

        // wakes a pending dial or accept; a full channel already holds the signal
        if let Some(cancel_tx) = cancel_tx {
            if let Err(err) = cancel_tx.try_send(()) {
                debug!("ICE start already signaled to stop: {err}");
            }
        }

        let mut errs = vec![];
        if let Some(mux) = mux {
            if let Err(err) = mux.close().await {
                errs.push(err);
            }
        }
        if let Err(err) = self.gatherer.close().await {
            errs.push(err);
        }

        flatten_errs(errs)
    }

    pub(crate) async fn set_remote_credentials(&self, ufrag: String, pwd: String) -> Result<()> {
        let agent = self.gatherer.create_agent()?;
        agent.set_remote_credentials(ufrag, pwd).await
    }

    /// have_remote_credentials_change reports whether the credentials differ
    /// from the ones the agent currently uses.
    pub(crate) async fn have_remote_credentials_change(&self, ufrag: &str, pwd: &str) -> bool {
        let Some(agent) = self.gatherer.get_agent() else {
            return false;
        };
        let (remote_ufrag, remote_pwd) = agent.get_remote_user_credentials().await;
        remote_ufrag != ufrag || remote_pwd != pwd
    }

    /// add_remote_candidate adds a candidate associated with the remote
    /// ICETransport. `None` marks the end of remote candidates.
    pub(crate) async fn add_remote_candidate(
        &self,
        remote_candidate: Option<RTCIceCandidate>,
    ) -> Result<()> {
        let agent = self.gatherer.create_agent()?;
        if let Some(candidate) = remote_candidate {
            agent.add_remote_candidate(candidate).await?;
        }
        Ok(())
    }

    /// new_endpoint registers a new endpoint on the mux; `None` until
    /// `start` succeeded.
    pub(crate) async fn new_endpoint(&self, match_fn: MatchFunc) -> Option<Arc<Endpoint>> {
        let internal = self.internal.lock().await;
        internal.mux.as_ref().map(|mux| mux.new_endpoint(match_fn))
    }

    pub(crate) async fn get_selected_candidate_pair(&self) -> Option<RTCIceCandidatePair> {
        let agent = self.gatherer.get_agent()?;
        agent.get_selected_candidate_pair().await
    }

    /// role indicates the current role of the ICE transport.
    pub(crate) fn role(&self) -> RTCIceRole {
        *lock(&self.role)
    }

    pub(crate) fn set_role(&self, role: RTCIceRole) {
        *lock(&self.role) = role;
    }

    /// state returns the current ice transport state.
    pub(crate) fn state(&self) -> RTCIceTransportState {
        *lock(&self.state)
    }

    pub(crate) fn on_connection_state_change(&self, f: OnConnectionStateChangeHdlrFn) {
        lock(&self.handlers).on_connection_state_change = Some(f);
    }

    pub(crate) fn on_selected_candidate_pair_change(&self, f: OnSelectedCandidatePairChangeHdlrFn) {
        lock(&self.handlers).on_selected_candidate_pair_change = Some(f);
    }

    fn do_state_change(
        state: &Mutex<RTCIceTransportState>,
        handlers: &Mutex<IceTransportHandlers>,
        ice_state: RTCIceTransportState,
    ) {
        {
            let mut s = lock(state);
            // closed is terminal
            if *s == RTCIceTransportState::Closed || *s == ice_state {
                return;
            }
            *s = ice_state;
        }
        info!("ICE transport state changed: {ice_state}");

        let handler = lock(handlers).on_connection_state_change.clone();
        if let Some(f) = handler {
            f(ice_state);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
    use crate::peer_connection::configuration::setting_engine::SettingEngine;
    use crate::peer_connection::transport::vnet::VNet;
    use shared::util::match_dtls;

    fn new_transport(vnet: &Arc<VNet>) -> RTCIceTransport {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::clone(vnet));
        RTCIceTransport::new(Arc::new(RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            Arc::new(s),
        )))
    }

    #[tokio::test]
    async fn test_ice_transport_start_and_stop() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let a = Arc::new(new_transport(&vnet));
        let b = Arc::new(new_transport(&vnet));

        let changes = Arc::new(AtomicUsize::new(0));
        let changes2 = Arc::clone(&changes);
        a.on_connection_state_change(Arc::new(move |_| {
            changes2.fetch_add(1, Ordering::SeqCst);
        }));

        a.gatherer().gather().await?;
        b.gatherer().gather().await?;
        for c in b.gatherer().get_local_candidates().await? {
            a.add_remote_candidate(Some(c)).await?;
        }
        a.add_remote_candidate(None).await?;

        let a_params = a.gatherer().get_local_parameters().await?;
        let b_params = b.gatherer().get_local_parameters().await?;

        let (ra, rb) = tokio::join!(
            a.start(b_params, Some(RTCIceRole::Controlling)),
            b.start(a_params.clone(), Some(RTCIceRole::Controlled))
        );
        ra?;
        rb?;

        assert_eq!(RTCIceTransportState::Connected, a.state());
        assert_eq!(RTCIceRole::Controlling, a.role());
        // checking, connected
        assert_eq!(2, changes.load(Ordering::SeqCst));
        assert!(a.new_endpoint(match_dtls).await.is_some());
        assert!(a.get_selected_candidate_pair().await.is_some());

        assert_eq!(
            Err(Error::ErrICETransportNotInNew),
            a.start(a_params, Some(RTCIceRole::Controlling)).await
        );

        a.stop().await?;
        a.stop().await?;
        assert_eq!(RTCIceTransportState::Closed, a.state());
        assert!(a.new_endpoint(match_dtls).await.is_none());
        b.stop().await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_ice_transport_concurrent_start_is_rejected() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let a = Arc::new(new_transport(&vnet));
        a.gatherer().gather().await?;

        let params = RTCIceParameters {
            username_fragment: "nobody".to_owned(),
            password: "secret".to_owned(),
            ..Default::default()
        };
        let first = {
            let a = Arc::clone(&a);
            let params = params.clone();
            tokio::spawn(async move { a.start(params, Some(RTCIceRole::Controlled)).await })
        };
        while !a.internal.lock().await.started {
            tokio::task::yield_now().await;
        }

        // the first call is still waiting for a peer
        assert_eq!(
            Err(Error::ErrICETransportNotInNew),
            a.start(params, Some(RTCIceRole::Controlled)).await
        );

        a.stop().await?;
        let first = first.await.map_err(|err| Error::Other(err.to_string()))?;
        assert!(first.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_ice_transport_stop_cancels_start() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let a = Arc::new(new_transport(&vnet));

        let a2 = Arc::clone(&a);
        let start = tokio::spawn(async move {
            a2.start(
                RTCIceParameters {
                    username_fragment: "nobody".to_owned(),
                    password: "nothing".to_owned(),
                    ice_lite: false,
                },
                Some(RTCIceRole::Controlled),
            )
            .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        a.stop().await?;
        let result = start.await.map_err(|err| Error::Other(err.to_string()))?;
        assert!(result.is_err());
        Ok(())
    }
}
