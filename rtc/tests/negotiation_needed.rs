mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rtc_signaling::peer_connection::RTCPeerConnection;
use rtc_signaling::rtp_transceiver::direction::RTCRtpTransceiverDirection;
use rtc_signaling::rtp_transceiver::rtp_codec::RtpCodecKind;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use common::*;

fn count_negotiation_needed(pc: &Arc<RTCPeerConnection>) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    pc.on_negotiation_needed(Arc::new(move || {
        let _ = tx.send(());
    }));
    rx
}

async fn expect_fired(rx: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
    timeout(Duration::from_secs(5), rx.recv())
        .await?
        .context("negotiation needed handler dropped")
}

/// Gives the operations queue time to run before asserting nothing fired.
async fn expect_quiet(rx: &mut mpsc::UnboundedReceiver<()>) {
    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "unexpected negotiation needed event");
}

#[tokio::test]
async fn test_negotiation_needed_lifecycle() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    let mut fired = count_negotiation_needed(&offerer);

    // first change fires once, later changes are folded into the same event
    let audio = offerer
        .add_transceiver_from_kind(RtpCodecKind::Audio, None)
        .await?;
    expect_fired(&mut fired).await?;
    let video = offerer
        .add_transceiver_from_kind(RtpCodecKind::Video, None)
        .await?;
    expect_quiet(&mut fired).await;

    // a completed exchange covering every transceiver leaves nothing to do
    signal_pair(&offerer, &answerer).await?;
    expect_quiet(&mut fired).await;

    // a direction change needs a new exchange
    audio.set_direction(RTCRtpTransceiverDirection::Recvonly);
    expect_fired(&mut fired).await?;

    // setting the same direction again is not a change
    audio.set_direction(RTCRtpTransceiverDirection::Recvonly);
    expect_quiet(&mut fired).await;

    signal_pair(&offerer, &answerer).await?;
    expect_quiet(&mut fired).await;

    // a stopped transceiver whose section is still offered must be removed
    video.stop().await?;
    expect_fired(&mut fired).await?;

    close_pair(&offerer, &answerer).await
}

#[tokio::test]
async fn test_negotiation_needed_for_first_data_channel() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Audio, None)
        .await?;
    signal_pair(&offerer, &answerer).await?;

    let mut fired = count_negotiation_needed(&offerer);
    expect_quiet(&mut fired).await;

    // the first data channel needs an application section
    offerer.create_data_channel("data", None).await?;
    expect_fired(&mut fired).await?;

    close_pair(&offerer, &answerer).await
}

#[tokio::test]
async fn test_negotiation_needed_waits_for_stable() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();

    let (offerer, answerer) = new_pair().await?;
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Audio, None)
        .await?;

    let offer = offerer.create_offer(None).await?;
    offerer.set_local_description(offer).await?;

    // changes made mid-negotiation are checked once the state is stable again
    let mut fired = count_negotiation_needed(&offerer);
    offerer
        .add_transceiver_from_kind(RtpCodecKind::Video, None)
        .await?;
    expect_quiet(&mut fired).await;

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

    expect_fired(&mut fired).await?;

    close_pair(&offerer, &answerer).await
}
