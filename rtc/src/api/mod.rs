use std::sync::{Arc, Mutex, PoisonError};

use shared::error::Result;

use crate::peer_connection::RTCPeerConnection;
use crate::peer_connection::configuration::RTCConfiguration;
use crate::peer_connection::configuration::media_engine::MediaEngine;
use crate::peer_connection::configuration::setting_engine::SettingEngine;

/// API bundles the engines shared by every PeerConnection it creates.
pub struct API {
    pub(crate) setting_engine: Arc<SettingEngine>,
    pub(crate) media_engine: Arc<Mutex<MediaEngine>>,
}

impl API {
    /// new_peer_connection creates a new PeerConnection with the provided configuration against the received API object
    pub async fn new_peer_connection(
        &self,
        configuration: RTCConfiguration,
    ) -> Result<Arc<RTCPeerConnection>> {
        RTCPeerConnection::new(self, configuration)
    }

    /// Each connection negotiates codecs on its own copy of the media engine
    /// unless copying was disabled in the setting engine.
    pub(crate) fn media_engine_for_connection(&self) -> Arc<Mutex<MediaEngine>> {
        if self.setting_engine.disable_media_engine_copy {
            Arc::clone(&self.media_engine)
        } else {
            let media_engine = self
                .media_engine
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone_to();
            Arc::new(Mutex::new(media_engine))
        }
    }

    /// Returns the internal [`SettingEngine`].
    pub fn setting_engine(&self) -> &SettingEngine {
        &self.setting_engine
    }
}

#[derive(Default)]
pub struct APIBuilder {
    setting_engine: Option<Arc<SettingEngine>>,
    media_engine: Option<MediaEngine>,
}

impl APIBuilder {
    pub fn new() -> Self {
        APIBuilder::default()
    }

    pub fn build(mut self) -> API {
        API {
            setting_engine: self.setting_engine.take().unwrap_or_default(),
            media_engine: Arc::new(Mutex::new(self.media_engine.take().unwrap_or_default())),
        }
    }

    /// WithSettingEngine allows providing a SettingEngine to the API.
    /// Settings should not be changed after passing the engine to an API.
    pub fn with_setting_engine(mut self, setting_engine: Arc<SettingEngine>) -> Self {
        self.setting_engine = Some(setting_engine);
        self
    }

    /// WithMediaEngine allows providing a MediaEngine to the API.
    pub fn with_media_engine(mut self, media_engine: MediaEngine) -> Self {
        self.media_engine = Some(media_engine);
        self
    }
}

#[cfg(test)]
mod test {
    use shared::error::Error;

    use super::*;
    use crate::peer_connection::transport::vnet::VNet;
    use crate::rtp_transceiver::rtp_codec::RtpCodecKind;

    #[test]
    fn test_new_api() {
        let s = SettingEngine::default();

        let mut m = MediaEngine::default();
        m.register_default_codecs().ok();

        let api = APIBuilder::new()
            .with_setting_engine(Arc::new(s))
            .with_media_engine(m)
            .build();

        let copy = api.media_engine_for_connection();
        assert!(!Arc::ptr_eq(&copy, &api.media_engine));
        assert!(
            !copy
                .lock()
                .unwrap()
                .get_codecs_by_kind(RtpCodecKind::Audio)
                .is_empty()
        );
    }

    #[test]
    fn test_shared_media_engine_when_copy_disabled() {
        let mut s = SettingEngine::default();
        s.disable_media_engine_copy(true);

        let api = APIBuilder::new().with_setting_engine(Arc::new(s)).build();
        let shared = api.media_engine_for_connection();
        assert!(Arc::ptr_eq(&shared, &api.media_engine));
    }

    fn vnet_api() -> API {
        let mut s = SettingEngine::default();
        s.set_vnet(Arc::new(VNet::new()));
        APIBuilder::new().with_setting_engine(Arc::new(s)).build()
    }

    #[test]
    fn test_new_peer_connection_outside_runtime() {
        let api = vnet_api();
        let result = RTCPeerConnection::new(&api, RTCConfiguration::default());
        assert_eq!(result.err(), Some(Error::ErrNoAsyncRuntime));
    }

    #[tokio::test]
    async fn test_new_peer_connection() -> Result<()> {
        let api = vnet_api();
        let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
        pc.close().await?;
        Ok(())
    }
}
