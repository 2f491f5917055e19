use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use shared::error::{Error, Result};

use super::agent::{IceAgent, IceAgentConfig};
use super::candidate::RTCIceCandidate;
use super::parameters::RTCIceParameters;
use super::server::RTCIceServer;
use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
use crate::peer_connection::configuration::setting_engine::SettingEngine;
use crate::peer_connection::state::ice_gathering_state::RTCIceGatheringState;

pub(crate) type OnLocalCandidateHdlrFn = Arc<dyn Fn(Option<RTCIceCandidate>) + Send + Sync>;
pub(crate) type OnGathererStateChangeHdlrFn = Arc<dyn Fn(RTCIceGatheringState) + Send + Sync>;
pub(crate) type OnGatheringCompleteHdlrFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct GathererHandlers {
    on_local_candidate: Option<OnLocalCandidateHdlrFn>,
    on_state_change: Option<OnGathererStateChangeHdlrFn>,
    on_gathering_complete: Option<OnGatheringCompleteHdlrFn>,
}

#[derive(Default)]
struct GathererState {
    state: RTCIceGatheringState,
    agent: Option<Arc<dyn IceAgent>>,
    closed: bool,
}

/// ICEGatherer gathers local host, server reflexive and relay
/// candidates, as well as enabling the retrieval of local Interactive
/// Connectivity Establishment (ICE) parameters which can be
/// exchanged in signaling.
///
/// The agent is created lazily, on the first call that needs it.
pub(crate) struct RTCIceGatherer {
    ice_servers: Vec<RTCIceServer>,
    gather_policy: RTCIceTransportPolicy,
    setting_engine: Arc<SettingEngine>,

    state: Arc<Mutex<GathererState>>,
    handlers: Arc<Mutex<GathererHandlers>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RTCIceGatherer {
    pub(crate) fn new(
        ice_servers: Vec<RTCIceServer>,
        gather_policy: RTCIceTransportPolicy,
        setting_engine: Arc<SettingEngine>,
    ) -> Self {
        RTCIceGatherer {
            ice_servers,
            gather_policy,
            setting_engine,
            state: Arc::new(Mutex::new(GathererState {
                state: RTCIceGatheringState::New,
                ..Default::default()
            })),
            handlers: Arc::new(Mutex::new(GathererHandlers::default())),
        }
    }

    pub(crate) fn create_agent(&self) -> Result<Arc<dyn IceAgent>> {
        let mut s = lock(&self.state);
        if let Some(agent) = &s.agent {
            return Ok(Arc::clone(agent));
        }
        if s.closed {
            return Err(Error::ErrICEAgentNotExist);
        }

        let factory = self
            .setting_engine
            .engines
            .ice_agent_factory
            .as_ref()
            .ok_or_else(|| Error::ErrTransportEngineNotSet("ICE".to_owned()))?;

        let agent = factory.new_agent(IceAgentConfig {
            ice_servers: self.ice_servers.clone(),
            policy: self.gather_policy,
            lite: self.setting_engine.candidates.ice_lite,
            local_ufrag: self.setting_engine.candidates.username_fragment.clone(),
            local_pwd: self.setting_engine.candidates.password.clone(),
        })?;
        s.agent = Some(Arc::clone(&agent));

        Ok(agent)
    }

    /// gather starts candidate discovery. Candidates are reported through
    /// the local candidate handler, end-of-candidates as `None`.
    pub(crate) async fn gather(&self) -> Result<()> {
        let agent = self.create_agent()?;
        self.set_state(RTCIceGatheringState::Gathering);

        let state = Arc::clone(&self.state);
        let handlers = Arc::clone(&self.handlers);
        agent.on_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let (on_local_candidate, on_state_change, on_gathering_complete) = {
                let h = lock(&handlers);
                (
                    h.on_local_candidate.clone(),
                    h.on_state_change.clone(),
                    h.on_gathering_complete.clone(),
                )
            };

            match candidate {
                Some(candidate) => {
                    debug!("gathered local candidate {candidate}");
                    if let Some(f) = on_local_candidate {
                        f(Some(candidate));
                    }
                }
                None => {
                    lock(&state).state = RTCIceGatheringState::Complete;
                    info!("ICE gathering state changed: {}", RTCIceGatheringState::Complete);
                    if let Some(f) = on_state_change {
                        f(RTCIceGatheringState::Complete);
                    }
                    if let Some(f) = on_gathering_complete {
                        f();
                    }
                    if let Some(f) = on_local_candidate {
                        f(None);
                    }
                }
            }
        }));

        agent.gather_candidates().await
    }

    /// restart_agent gives the agent new local credentials, or the fixed
    /// ones of the setting engine, and drops its candidates.
    pub(crate) async fn restart_agent(&self) -> Result<()> {
        let agent = self.create_agent()?;
        agent
            .restart(
                self.setting_engine.candidates.username_fragment.clone(),
                self.setting_engine.candidates.password.clone(),
            )
            .await?;
        self.set_state(RTCIceGatheringState::New);
        Ok(())
    }

    /// close prunes all local candidates and closes the agent.
    pub(crate) async fn close(&self) -> Result<()> {
        let agent = {
            let mut s = lock(&self.state);
            s.closed = true;
            s.agent.take()
        };

        match agent {
            Some(agent) => agent.close().await,
            None => Ok(()),
        }
    }

    /// get_local_parameters returns the ICE parameters of the ICEGatherer.
    pub(crate) async fn get_local_parameters(&self) -> Result<RTCIceParameters> {
        let agent = self.create_agent()?;
        let (username_fragment, password) = agent.get_local_user_credentials().await;

        Ok(RTCIceParameters {
            username_fragment,
            password,
            ice_lite: false,
        })
    }

    /// get_local_candidates returns the sequence of valid local candidates associated with the ICEGatherer.
    pub(crate) async fn get_local_candidates(&self) -> Result<Vec<RTCIceCandidate>> {
        let agent = self.create_agent()?;
        agent.get_local_candidates().await
    }

    /// state indicates the current state of the ICE gatherer.
    pub(crate) fn state(&self) -> RTCIceGatheringState {
        lock(&self.state).state
    }

    pub(crate) fn set_state(&self, state: RTCIceGatheringState) {
        lock(&self.state).state = state;
        info!("ICE gathering state changed: {state}");

        let handler = lock(&self.handlers).on_state_change.clone();
        if let Some(f) = handler {
            f(state);
        }
    }

    pub(crate) fn get_agent(&self) -> Option<Arc<dyn IceAgent>> {
        lock(&self.state).agent.clone()
    }

    pub(crate) fn on_local_candidate(&self, f: OnLocalCandidateHdlrFn) {
        lock(&self.handlers).on_local_candidate = Some(f);
    }

    pub(crate) fn on_state_change(&self, f: OnGathererStateChangeHdlrFn) {
        lock(&self.handlers).on_state_change = Some(f);
    }

    pub(crate) fn on_gathering_complete(&self, f: OnGatheringCompleteHdlrFn) {
        lock(&self.handlers).on_gathering_complete = Some(f);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::peer_connection::transport::vnet::VNet;

    fn vnet_setting_engine() -> Arc<SettingEngine> {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::new(VNet::new()));
        Arc::new(s)
    }

    #[tokio::test]
    async fn test_gatherer_reports_candidates_then_complete() -> Result<()> {
        let gatherer = RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            vnet_setting_engine(),
        );
        assert_eq!(RTCIceGatheringState::New, gatherer.state());

        let (tx, mut rx) = mpsc::unbounded_channel();
        gatherer.on_local_candidate(Arc::new(move |c| {
            let _ = tx.send(c);
        }));
        let completed = Arc::new(AtomicBool::new(false));
        let completed2 = Arc::clone(&completed);
        gatherer.on_gathering_complete(Arc::new(move || {
            completed2.store(true, Ordering::SeqCst);
        }));

        gatherer.gather().await?;

        let first = rx.recv().await.flatten();
        assert!(first.is_some());
        assert_eq!(None, rx.recv().await.flatten());
        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(RTCIceGatheringState::Complete, gatherer.state());
        assert_eq!(1, gatherer.get_local_candidates().await?.len());

        gatherer.close().await?;
        assert!(gatherer.get_agent().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_gatherer_fixed_credentials() -> Result<()> {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::new(VNet::new()));
        s.set_ice_credentials("ufragufrag".to_owned(), "pwdpwdpwdpwdpwdpwdpwdpwd".to_owned());

        let gatherer = RTCIceGatherer::new(vec![], RTCIceTransportPolicy::All, Arc::new(s));
        let params = gatherer.get_local_parameters().await?;
        assert_eq!("ufragufrag", params.username_fragment);
        assert_eq!("pwdpwdpwdpwdpwdpwdpwdpwd", params.password);
        Ok(())
    }

    #[tokio::test]
    async fn test_gatherer_without_engine() {
        let gatherer = RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            Arc::new(SettingEngine::default()),
        );
        assert_eq!(
            Err(Error::ErrTransportEngineNotSet("ICE".to_owned())),
            gatherer.gather().await
        );
    }
}
