use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::watch;

use shared::error::{Error, Result};

use crate::data_channel::parameters::DataChannelParameters;
use crate::data_channel::state::RTCDataChannelState;
use crate::data_channel::{RTCDataChannel, RTCDataChannelId};
use crate::peer_connection::configuration::setting_engine::SettingEngine;
use crate::peer_connection::transport::dtls::RTCDtlsTransport;
use crate::peer_connection::transport::dtls::role::RTCDtlsRole;
use crate::peer_connection::transport::sctp::capabilities::SCTPTransportCapabilities;
use crate::peer_connection::transport::sctp::engine::SctpAssociation;
use crate::peer_connection::transport::sctp::state::RTCSctpTransportState;

pub(crate) mod capabilities;
pub mod engine;
pub(crate) mod state;

const SCTP_MAX_CHANNELS: u16 = u16::MAX;

pub(crate) type OnDataChannelHdlrFn = Arc<dyn Fn(Arc<RTCDataChannel>) + Send + Sync>;

#[derive(Default)]
struct SctpTransportInternal {
    state: RTCSctpTransportState,

    // SCTPTransportState doesn't have an enum to distinguish between New/Connecting
    // so we need a dedicated field
    is_started: bool,

    // max_message_size represents the maximum size of data that can be passed to
    // DataChannel's send() method.
    max_message_size: u32,

    association: Option<Arc<dyn SctpAssociation>>,
    data_channels: Vec<Arc<RTCDataChannel>>,

    on_data_channel: Option<OnDataChannelHdlrFn>,
}

#[derive(Default)]
struct DataChannelCounters {
    requested: AtomicU32,
    opened: AtomicU32,
    accepted: AtomicU32,
}

/// SCTPTransport provides details about the SCTP transport.
pub(crate) struct RTCSctpTransport {
    dtls_transport: Arc<RTCDtlsTransport>,
    setting_engine: Arc<SettingEngine>,

    // max_channels represents the maximum amount of DataChannel's that can
    // be used simultaneously.
    max_channels: u16,

    internal: Arc<Mutex<SctpTransportInternal>>,
    counters: Arc<DataChannelCounters>,
    closed_tx: watch::Sender<bool>,
}

fn lock(m: &Mutex<SctpTransportInternal>) -> MutexGuard<'_, SctpTransportInternal> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct AcceptDataChannelParams {
    association: Arc<dyn SctpAssociation>,
    internal: Arc<Mutex<SctpTransportInternal>>,
    counters: Arc<DataChannelCounters>,
    closed_rx: watch::Receiver<bool>,
}

impl RTCSctpTransport {
    pub(crate) fn new(
        dtls_transport: Arc<RTCDtlsTransport>,
        setting_engine: Arc<SettingEngine>,
    ) -> Self {
        let max_message_size = setting_engine.sctp_max_message_size.as_u32();
        RTCSctpTransport {
            dtls_transport,
            setting_engine,
            max_channels: SCTP_MAX_CHANNELS,
            internal: Arc::new(Mutex::new(SctpTransportInternal {
                state: RTCSctpTransportState::Connecting,
                max_message_size,
                ..Default::default()
            })),
            counters: Arc::new(DataChannelCounters::default()),
            closed_tx: watch::Sender::new(false),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<RTCDtlsTransport> {
        &self.dtls_transport
    }

    /// get_capabilities returns the SCTPCapabilities of the SCTPTransport.
    pub(crate) fn get_capabilities(&self) -> SCTPTransportCapabilities {
        SCTPTransportCapabilities {
            max_message_size: self.setting_engine.sctp_max_message_size.as_u32(),
        }
    }

    /// Start the SCTPTransport. Since both local and remote parties must mutually
    /// create an SCTPTransport, SCTP SO (Simultaneous Open) is used to establish
    /// a connection over SCTP.
    pub(crate) async fn start(&self, remote_caps: SCTPTransportCapabilities) -> Result<()> {
        let max_message_size = {
            let mut internal = lock(&self.internal);
            if internal.is_started {
                return Ok(());
            }
            internal.is_started = true;
            internal.max_message_size = RTCSctpTransport::calc_message_size(
                remote_caps.max_message_size,
                self.get_capabilities().max_message_size,
            );
            internal.max_message_size
        };

        let conn = self.dtls_transport.conn().ok_or(Error::ErrSCTPTransportDTLS)?;
        let engine = self
            .setting_engine
            .engines
            .sctp
            .clone()
            .ok_or_else(|| Error::ErrTransportEngineNotSet("SCTP".to_owned()))?;

        let is_client = self.dtls_transport.role() == RTCDtlsRole::Client;
        let mut closed_rx = self.closed_tx.subscribe();
        let association = tokio::select! {
            association = engine.associate(conn, is_client, max_message_size) => association?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::ErrSCTPTransportDTLS),
        };

        let stopped = {
            let mut internal = lock(&self.internal);
            if internal.state == RTCSctpTransportState::Closed {
                true
            } else {
                internal.association = Some(Arc::clone(&association));
                internal.state = RTCSctpTransportState::Connected;
                false
            }
        };
        if stopped {
            association.close().await?;
            return Err(Error::ErrSCTPTransportDTLS);
        }
        info!("SCTP transport state changed: {}", RTCSctpTransportState::Connected);

        tokio::spawn(RTCSctpTransport::accept_data_channels(AcceptDataChannelParams {
            association: Arc::clone(&association),
            internal: Arc::clone(&self.internal),
            counters: Arc::clone(&self.counters),
            closed_rx: self.closed_tx.subscribe(),
        }));

        // channels created before the association existed
        let pending: Vec<Arc<RTCDataChannel>> = lock(&self.internal)
            .data_channels
            .iter()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Connecting)
            .cloned()
            .collect();
        for dc in pending {
            if let Err(err) = self.open_data_channel(&dc, &association).await {
                warn!("failed to open data channel '{}': {err}", dc.label());
            }
        }

        Ok(())
    }

    async fn accept_data_channels(param: AcceptDataChannelParams) {
        let AcceptDataChannelParams {
            association,
            internal,
            counters,
            mut closed_rx,
        } = param;

        loop {
            let (stream, config) = tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => break,
                result = association.accept_channel() => match result {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        debug!("failed to accept data channel: {err}");
                        break;
                    }
                },
            };

            let dc = Arc::new(RTCDataChannel::new(DataChannelParameters::from(config)));
            let on_data_channel = {
                let mut internal = lock(&internal);
                internal.data_channels.push(Arc::clone(&dc));
                internal.on_data_channel.clone()
            };
            counters.accepted.fetch_add(1, Ordering::SeqCst);

            dc.handle_open(stream);
            counters.opened.fetch_add(1, Ordering::SeqCst);

            if let Some(f) = on_data_channel {
                f(dc);
            }
        }
    }

    /// add_data_channel registers a locally created channel. It is opened
    /// right away if the association exists, otherwise on start.
    pub(crate) async fn add_data_channel(&self, dc: Arc<RTCDataChannel>) -> Result<()> {
        self.counters.requested.fetch_add(1, Ordering::SeqCst);
        let association = {
            let mut internal = lock(&self.internal);
            internal.data_channels.push(Arc::clone(&dc));
            internal.association.clone()
        };

        match association {
            Some(association) => self.open_data_channel(&dc, &association).await,
            None => Ok(()),
        }
    }

    async fn open_data_channel(
        &self,
        dc: &Arc<RTCDataChannel>,
        association: &Arc<dyn SctpAssociation>,
    ) -> Result<()> {
        if dc.id().is_none() {
            let id = self.generate_and_set_data_channel_id(self.dtls_transport.role())?;
            dc.set_id(id);
        }
        dc.open(association).await?;
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn calc_message_size(remote_max_message_size: u32, can_send_size: u32) -> u32 {
        if remote_max_message_size == 0 && can_send_size == 0 {
            u32::MAX
        } else if remote_max_message_size == 0 {
            can_send_size
        } else if can_send_size == 0 || can_send_size > remote_max_message_size {
            remote_max_message_size
        } else {
            can_send_size
        }
    }

    /// max_channels is the maximum number of RTCDataChannels that can be open simultaneously.
    pub(crate) fn max_channels(&self) -> u16 {
        if self.max_channels == 0 {
            SCTP_MAX_CHANNELS
        } else {
            self.max_channels
        }
    }

    pub(crate) fn max_message_size(&self) -> u32 {
        lock(&self.internal).max_message_size
    }

    /// state returns the current state of the SCTPTransport
    pub(crate) fn state(&self) -> RTCSctpTransportState {
        lock(&self.internal).state
    }

    pub(crate) fn on_data_channel(&self, f: OnDataChannelHdlrFn) {
        lock(&self.internal).on_data_channel = Some(f);
    }

    pub(crate) fn data_channels(&self) -> Vec<Arc<RTCDataChannel>> {
        lock(&self.internal).data_channels.clone()
    }

    /// generate_and_set_data_channel_id picks the lowest free id of the
    /// parity owned by the DTLS role: even for the client, odd for the server.
    pub(crate) fn generate_and_set_data_channel_id(
        &self,
        dtls_role: RTCDtlsRole,
    ) -> Result<RTCDataChannelId> {
        let mut id = 0u16;
        if dtls_role != RTCDtlsRole::Client {
            id += 1;
        }

        // Create map of ids so we can compare without double-looping each time.
        let ids_map: HashSet<RTCDataChannelId> = lock(&self.internal)
            .data_channels
            .iter()
            .filter_map(|dc| dc.id())
            .collect();

        let max = self.max_channels();
        while id < max - 1 {
            if ids_map.contains(&id) {
                id += 2;
            } else {
                return Ok(id);
            }
        }

        Err(Error::ErrMaxDataChannelID)
    }

    pub(crate) fn data_channels_requested(&self) -> u32 {
        self.counters.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn data_channels_opened(&self) -> u32 {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn data_channels_accepted(&self) -> u32 {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    /// Stop stops the SCTPTransport
    pub(crate) async fn stop(&self) -> Result<()> {
        let association = {
            let mut internal = lock(&self.internal);
            if internal.state == RTCSctpTransportState::Closed {
                return Ok(());
            }
            internal.state = RTCSctpTransportState::Closed;
            internal.association.take()
        };
        self.closed_tx.send_replace(true);
        info!("SCTP transport state changed: {}", RTCSctpTransportState::Closed);

        match association {
            Some(association) => association.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::transport::ice::RTCIceTransport;
    use crate::peer_connection::transport::ice::gatherer::RTCIceGatherer;
    use crate::peer_connection::configuration::ice_transport_policy::RTCIceTransportPolicy;
    use crate::peer_connection::configuration::setting_engine::SctpMaxMessageSize;

    fn new_sctp_transport(setting_engine: SettingEngine) -> RTCSctpTransport {
        let setting_engine = Arc::new(setting_engine);
        let ice = Arc::new(RTCIceTransport::new(Arc::new(RTCIceGatherer::new(
            vec![],
            RTCIceTransportPolicy::All,
            Arc::clone(&setting_engine),
        ))));
        let dtls = Arc::new(RTCDtlsTransport::new(ice, vec![], Arc::clone(&setting_engine)));
        RTCSctpTransport::new(dtls, setting_engine)
    }

    #[tokio::test]
    async fn test_generate_data_channel_id() -> Result<()> {
        let sctp = new_sctp_transport(SettingEngine::default());

        assert_eq!(0, sctp.generate_and_set_data_channel_id(RTCDtlsRole::Client)?);
        assert_eq!(1, sctp.generate_and_set_data_channel_id(RTCDtlsRole::Server)?);

        for id in [0u16, 1, 2, 4] {
            let dc = Arc::new(RTCDataChannel::new(DataChannelParameters {
                negotiated: Some(id),
                ..Default::default()
            }));
            sctp.add_data_channel(dc).await?;
        }
        assert_eq!(4, sctp.data_channels_requested());
        assert_eq!(0, sctp.data_channels_opened());
        assert_eq!(0, sctp.data_channels_accepted());

        assert_eq!(6, sctp.generate_and_set_data_channel_id(RTCDtlsRole::Client)?);
        assert_eq!(3, sctp.generate_and_set_data_channel_id(RTCDtlsRole::Server)?);

        Ok(())
    }

    #[tokio::test]
    async fn test_sctp_transport_start_requires_dtls() -> Result<()> {
        let mut s = SettingEngine::default();
        s.set_sctp_max_message_size(SctpMaxMessageSize::Bounded(1024));
        let sctp = new_sctp_transport(s);

        assert_eq!(1024, sctp.get_capabilities().max_message_size);
        assert_eq!(RTCSctpTransportState::Connecting, sctp.state());
        assert_eq!(
            Err(Error::ErrSCTPTransportDTLS),
            sctp.start(SCTPTransportCapabilities {
                max_message_size: 0
            })
            .await
        );
        assert_eq!(1024, sctp.max_message_size());

        sctp.stop().await?;
        sctp.stop().await?;
        assert_eq!(RTCSctpTransportState::Closed, sctp.state());

        Ok(())
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_sctp_transport_futures_are_send() {
        let sctp = new_sctp_transport(SettingEngine::default());
        assert_send(&sctp.start(SCTPTransportCapabilities {
            max_message_size: 0,
        }));
        assert_send(&sctp.stop());
    }

    #[test]
    fn test_calc_message_size() {
        assert_eq!(u32::MAX, RTCSctpTransport::calc_message_size(0, 0));
        assert_eq!(100, RTCSctpTransport::calc_message_size(0, 100));
        assert_eq!(50, RTCSctpTransport::calc_message_size(50, 100));
        assert_eq!(50, RTCSctpTransport::calc_message_size(100, 50));
        assert_eq!(100, RTCSctpTransport::calc_message_size(100, 0));
    }
}
