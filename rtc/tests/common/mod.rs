#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use rtc_signaling::api::APIBuilder;
use rtc_signaling::peer_connection::RTCPeerConnection;
use rtc_signaling::peer_connection::configuration::RTCConfiguration;
use rtc_signaling::peer_connection::configuration::media_engine::MediaEngine;
use rtc_signaling::peer_connection::configuration::setting_engine::SettingEngine;
use rtc_signaling::peer_connection::transport::vnet::VNet;

pub fn default_media_engine() -> Result<MediaEngine> {
    let mut m = MediaEngine::default();
    m.register_default_codecs()?;
    Ok(m)
}

pub async fn new_peer_connection_with(
    vnet: &Arc<VNet>,
    mut setting_engine: SettingEngine,
    media_engine: MediaEngine,
) -> Result<Arc<RTCPeerConnection>> {
    setting_engine.set_vnet(Arc::clone(vnet));
    let api = APIBuilder::new()
        .with_setting_engine(Arc::new(setting_engine))
        .with_media_engine(media_engine)
        .build();
    Ok(api.new_peer_connection(RTCConfiguration::default()).await?)
}

pub async fn new_peer_connection(vnet: &Arc<VNet>) -> Result<Arc<RTCPeerConnection>> {
    new_peer_connection_with(vnet, SettingEngine::default(), default_media_engine()?).await
}

pub async fn new_pair() -> Result<(Arc<RTCPeerConnection>, Arc<RTCPeerConnection>)> {
    let vnet = Arc::new(VNet::new());
    Ok((
        new_peer_connection(&vnet).await?,
        new_peer_connection(&vnet).await?,
    ))
}

/// Runs one full offer/answer exchange, offerer first. The descriptions
/// carry the gathered candidates, so no trickling is needed.
pub async fn signal_pair(
    offerer: &Arc<RTCPeerConnection>,
    answerer: &Arc<RTCPeerConnection>,
) -> Result<()> {
    let offer = offerer.create_offer(None).await?;
    offerer.set_local_description(offer).await?;
    let offer = offerer
        .local_description()
        .await
        .context("offerer has no local description")?;
    answerer.set_remote_description(offer).await?;

    let answer = answerer.create_answer(None).await?;
    answerer.set_local_description(answer).await?;
    let answer = answerer
        .local_description()
        .await
        .context("answerer has no local description")?;
    offerer.set_remote_description(answer).await?;

    Ok(())
}

pub async fn close_pair(
    offerer: &Arc<RTCPeerConnection>,
    answerer: &Arc<RTCPeerConnection>,
) -> Result<()> {
    offerer.close().await?;
    answerer.close().await?;
    Ok(())
}
