use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::watch;

use shared::Conn;
use shared::error::{Error, Result, flatten_errs};
use shared::util::{match_dtls, match_srtp};

use crate::peer_connection::certificate::RTCCertificate;
use crate::peer_connection::configuration::setting_engine::SettingEngine;
use crate::peer_connection::transport::dtls::engine::{DtlsHandshakeConfig, RtpReadStream, SrtpSession};
use crate::peer_connection::transport::dtls::parameters::DTLSParameters;
use crate::peer_connection::transport::dtls::role::{DEFAULT_DTLS_ROLE_ANSWER, RTCDtlsRole};
use crate::peer_connection::transport::dtls::state::RTCDtlsTransportState;
use crate::peer_connection::transport::ice::RTCIceTransport;
use crate::peer_connection::transport::ice::role::RTCIceRole;

pub mod engine;
pub(crate) mod fingerprint;
pub(crate) mod parameters;
pub(crate) mod role;
pub(crate) mod state;

pub(crate) type OnDtlsStateChangeHdlrFn = Arc<dyn Fn(RTCDtlsTransportState) + Send + Sync>;

#[derive(Default)]
struct DtlsTransportInternal {
    state: RTCDtlsTransportState,
    remote_parameters: DTLSParameters,
    conn: Option<Arc<dyn Conn>>,
    srtp_session: Option<Arc<dyn SrtpSession>>,
    simulcast_streams: Vec<Arc<dyn RtpReadStream>>,
    on_state_change: Option<OnDtlsStateChangeHdlrFn>,
}

/// DTLSTransport allows an application access to information about the DTLS
/// transport over which RTP and RTCP packets are sent and received by
/// RTPSender and RTPReceiver, as well other data such as SCTP packets sent
/// and received by data channels.
pub(crate) struct RTCDtlsTransport {
    ice_transport: Arc<RTCIceTransport>,
    certificates: Vec<RTCCertificate>,
    setting_engine: Arc<SettingEngine>,

    internal: Mutex<DtlsTransportInternal>,
    srtp_ready_tx: watch::Sender<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RTCDtlsTransport {
    pub(crate) fn new(
        ice_transport: Arc<RTCIceTransport>,
        certificates: Vec<RTCCertificate>,
        setting_engine: Arc<SettingEngine>,
    ) -> Self {
        RTCDtlsTransport {
            ice_transport,
            certificates,
            setting_engine,
            internal: Mutex::new(DtlsTransportInternal {
                state: RTCDtlsTransportState::New,
                ..Default::default()
            }),
            srtp_ready_tx: watch::Sender::new(false),
        }
    }

    pub(crate) fn ice_transport(&self) -> &Arc<RTCIceTransport> {
        &self.ice_transport
    }

    /// state returns the current dtls transport state.
    pub(crate) fn state(&self) -> RTCDtlsTransportState {
        lock(&self.internal).state
    }

    pub(crate) fn on_state_change(&self, f: OnDtlsStateChangeHdlrFn) {
        lock(&self.internal).on_state_change = Some(f);
    }

    fn state_change(&self, state: RTCDtlsTransportState) {
        let handler = {
            let mut internal = lock(&self.internal);
            if internal.state == state {
                return;
            }
            internal.state = state;
            internal.on_state_change.clone()
        };
        info!("DTLS transport state changed: {state}");

        if let Some(f) = handler {
            f(state);
        }
    }

    /// role returns the current role of the DTLS transport.
    pub(crate) fn role(&self) -> RTCDtlsRole {
        // If remote has an explicit role use the inverse
        match lock(&self.internal).remote_parameters.role {
            RTCDtlsRole::Client => return RTCDtlsRole::Server,
            RTCDtlsRole::Server => return RTCDtlsRole::Client,
            _ => {}
        };

        // If SettingEngine has an explicit role
        match self.setting_engine.answering_dtls_role {
            RTCDtlsRole::Server => return RTCDtlsRole::Server,
            RTCDtlsRole::Client => return RTCDtlsRole::Client,
            _ => {}
        };

        // Remote was auto and no explicit role was configured via SettingEngine
        if self.ice_transport.role() == RTCIceRole::Controlling {
            return RTCDtlsRole::Server;
        }

        DEFAULT_DTLS_ROLE_ANSWER
    }

    /// start DTLS transport negotiation with the parameters of the remote
    /// DTLS transport. The ICE transport must be started.
    pub(crate) async fn start(&self, remote_parameters: DTLSParameters) -> Result<()> {
        {
            let mut internal = lock(&self.internal);
            if internal.state != RTCDtlsTransportState::New {
                return Err(Error::ErrInvalidDTLSStart);
            }
            internal.remote_parameters = remote_parameters;
        }

        let (Some(srtp_endpoint), Some(dtls_endpoint)) = (
            self.ice_transport.new_endpoint(match_srtp).await,
            self.ice_transport.new_endpoint(match_dtls).await,
        ) else {
            return Err(Error::ErrICEConnectionNotStarted);
        };

        let dtls_engine = self
            .setting_engine
            .engines
            .dtls
            .clone()
            .ok_or_else(|| Error::ErrTransportEngineNotSet("DTLS".to_owned()))?;
        let certificate = self
            .certificates
            .first()
            .cloned()
            .ok_or(Error::ErrNonCertificate)?;

        self.state_change(RTCDtlsTransportState::Connecting);

        let is_client = self.role() == RTCDtlsRole::Client;
        debug!("starting DTLS transport as {}", if is_client { "client" } else { "server" });

        let result = match dtls_engine
            .handshake(dtls_endpoint, DtlsHandshakeConfig { is_client, certificate })
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!("DTLS handshake failed: {err}");
                self.state_change(RTCDtlsTransportState::Failed);
                return Err(err);
            }
        };

        if let Err(err) = self.validate_peer_certificates(&result.peer_certificates) {
            self.state_change(RTCDtlsTransportState::Failed);
            let _ = result.conn.close().await;
            return Err(err);
        }

        let rejected = {
            let mut internal = lock(&self.internal);
            if internal.state == RTCDtlsTransportState::Closed {
                Some(result.conn)
            } else {
                internal.conn = Some(result.conn);
                None
            }
        };
        if let Some(conn) = rejected {
            if let Err(err) = conn.close().await {
                debug!("failed to close DTLS conn of a stopped transport: {err}");
            }
            return Err(Error::ErrClosedPipe);
        }
        self.state_change(RTCDtlsTransportState::Connected);

        self.start_srtp(srtp_endpoint, is_client).await
    }

    fn validate_peer_certificates(&self, peer_certificates: &[Vec<u8>]) -> Result<()> {
        let Some(der) = peer_certificates.first() else {
            return Err(Error::ErrNoRemoteCertificate);
        };

        if self.setting_engine.disable_certificate_fingerprint_verification {
            return Ok(());
        }

        let fingerprints = lock(&self.internal).remote_parameters.fingerprints.clone();
        let mut last_err = Error::ErrNoMatchingCertificateFingerprint;
        for fp in &fingerprints {
            match fp.verify(der) {
                Ok(()) => return Ok(()),
                Err(err) => last_err = err,
            }
        }

        Err(last_err)
    }

    async fn start_srtp(&self, srtp_endpoint: Arc<dyn Conn>, is_client: bool) -> Result<()> {
        let srtp_engine = self
            .setting_engine
            .engines
            .srtp
            .clone()
            .ok_or_else(|| Error::ErrTransportEngineNotSet("SRTP".to_owned()))?;

        let session = srtp_engine.new_session(srtp_endpoint, is_client).await?;
        lock(&self.internal).srtp_session = Some(session);
        self.srtp_ready_tx.send_replace(true);

        Ok(())
    }

    /// conn is the DTLS application data channel, set once connected.
    pub(crate) fn conn(&self) -> Option<Arc<dyn Conn>> {
        lock(&self.internal).conn.clone()
    }

    pub(crate) fn get_srtp_session(&self) -> Option<Arc<dyn SrtpSession>> {
        lock(&self.internal).srtp_session.clone()
    }

    /// srtp_ready resolves once the SRTP session exists, or with `None` if
    /// the transport stops first.
    pub(crate) async fn srtp_ready(&self) -> Option<Arc<dyn SrtpSession>> {
        let mut rx = self.srtp_ready_tx.subscribe();
        // stop flips the flag too, to release waiters
        rx.wait_for(|ready| *ready).await.ok()?;
        self.get_srtp_session()
    }

    /// store_simulcast_stream keeps a stream whose owner could not be
    /// determined, so that it is closed along with the transport.
    pub(crate) fn store_simulcast_stream(&self, stream: Arc<dyn RtpReadStream>) {
        lock(&self.internal).simulcast_streams.push(stream);
    }

    /// stop stops and closes the DTLSTransport object.
    pub(crate) async fn stop(&self) -> Result<()> {
        if self.state() == RTCDtlsTransportState::Closed {
            return Ok(());
        }
        self.state_change(RTCDtlsTransportState::Closed);

        let (srtp_session, streams, conn) = {
            let mut internal = lock(&self.internal);
            (
                internal.srtp_session.take(),
                std::mem::take(&mut internal.simulcast_streams),
                internal.conn.take(),
            )
        };
        self.srtp_ready_tx.send_replace(true);

        let mut close_errs = vec![];
        if let Some(session) = srtp_session {
            if let Err(err) = session.close().await {
                close_errs.push(err);
            }
        }
        for stream in streams {
            if let Err(err) = stream.close().await {
                close_errs.push(err);
            }
        }
        if let Some(conn) = conn {
            // dtls connection may be closed on sctp close.
            match conn.close().await {
                Ok(()) | Err(Error::ErrConnClosed) => {}
                Err(err) => close_errs.push(err),
            }
        }

        flatten_errs(close_errs)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
    use crate::peer_connection::transport::dtls::fingerprint::RTCDtlsFingerprint;
    use crate::peer_connection::transport::ice::gatherer::RTCIceGatherer;
    use crate::peer_connection::transport::vnet::VNet;

    fn setting_engine(vnet: &Arc<VNet>) -> Arc<SettingEngine> {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::clone(vnet));
        Arc::new(s)
    }

    async fn connected_ice_pair(vnet: &Arc<VNet>) -> Result<(Arc<RTCIceTransport>, Arc<RTCIceTransport>)> {
        let new_transport = || {
            Arc::new(RTCIceTransport::new(Arc::new(RTCIceGatherer::new(
                vec![],
                RTCIceTransportPolicy::All,
                setting_engine(vnet),
            ))))
        };
        let (a, b) = (new_transport(), new_transport());

        a.gatherer().gather().await?;
        b.gatherer().gather().await?;
        for c in b.gatherer().get_local_candidates().await? {
            a.add_remote_candidate(Some(c)).await?;
        }
        let a_params = a.gatherer().get_local_parameters().await?;
        let b_params = b.gatherer().get_local_parameters().await?;

        let (ra, rb) = tokio::join!(
            a.start(b_params, Some(RTCIceRole::Controlling)),
            b.start(a_params, Some(RTCIceRole::Controlled))
        );
        ra?;
        rb?;

        Ok((a, b))
    }

    #[test]
    fn test_dtls_role_resolution() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let ice = Arc::new(RTCIceTransport::new(Arc::new(RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            setting_engine(&vnet),
        ))));
        let dtls = RTCDtlsTransport::new(Arc::clone(&ice), vec![], setting_engine(&vnet));

        ice.set_role(RTCIceRole::Controlled);
        assert_eq!(RTCDtlsRole::Client, dtls.role());
        ice.set_role(RTCIceRole::Controlling);
        assert_eq!(RTCDtlsRole::Server, dtls.role());

        lock(&dtls.internal).remote_parameters.role = RTCDtlsRole::Server;
        assert_eq!(RTCDtlsRole::Client, dtls.role());

        let mut s = SettingEngine::default();
        s.set_answering_dtls_role(RTCDtlsRole::Server)?;
        let dtls = RTCDtlsTransport::new(ice, vec![], Arc::new(s));
        assert_eq!(RTCDtlsRole::Server, dtls.role());

        Ok(())
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_dtls_transport_futures_are_send() {
        let vnet = Arc::new(VNet::new());
        let ice = Arc::new(RTCIceTransport::new(Arc::new(RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            setting_engine(&vnet),
        ))));
        let dtls = RTCDtlsTransport::new(ice, vec![], setting_engine(&vnet));
        assert_send(&dtls.start(DTLSParameters::default()));
        assert_send(&dtls.stop());
    }

    #[tokio::test]
    async fn test_dtls_transport_start_verifies_fingerprints() -> Result<()> {
        let vnet = Arc::new(VNet::new());
        let (a_ice, b_ice) = connected_ice_pair(&vnet).await?;

        let a_cert = RTCCertificate::generate()?;
        let b_cert = RTCCertificate::generate()?;
        let a = RTCDtlsTransport::new(a_ice, vec![a_cert.clone()], setting_engine(&vnet));
        let b = RTCDtlsTransport::new(b_ice, vec![b_cert.clone()], setting_engine(&vnet));

        let (ra, rb) = tokio::join!(
            a.start(DTLSParameters {
                role: RTCDtlsRole::Auto,
                fingerprints: b_cert.get_fingerprints(),
            }),
            b.start(DTLSParameters {
                role: RTCDtlsRole::Auto,
                fingerprints: vec![RTCDtlsFingerprint {
                    algorithm: "sha-256".to_owned(),
                    value: "00:11".to_owned(),
                }],
            })
        );

        ra?;
        assert_eq!(RTCDtlsTransportState::Connected, a.state());
        assert!(a.conn().is_some());
        assert!(a.srtp_ready().await.is_some());

        assert_eq!(Err(Error::ErrNoMatchingCertificateFingerprint), rb);
        assert_eq!(RTCDtlsTransportState::Failed, b.state());

        assert_eq!(
            Err(Error::ErrInvalidDTLSStart),
            a.start(DTLSParameters::default()).await
        );

        a.stop().await?;
        a.stop().await?;
        assert_eq!(RTCDtlsTransportState::Closed, a.state());
        assert!(a.get_srtp_session().is_none());
        b.stop().await?;

        Ok(())
    }
}
