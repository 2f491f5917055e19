use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use util::Marshal;

use shared::Conn;
use shared::error::{Error, Result};

use crate::peer_connection::transport::dtls::engine::{RtpReadStream, SrtpSession};
use crate::rtp_transceiver::SSRC;

const MAX_PACKET_SIZE: usize = 8192;
const SSRC_OFFSET: usize = 8;

#[derive(Default)]
struct SessionState {
    streams: HashMap<SSRC, Arc<VNetRtpStream>>,
}

/// RTP session over the SRTP endpoint of the mux. Packets travel
/// unprotected and are demultiplexed by SSRC.
pub(crate) struct VNetSrtpSession {
    conn: Arc<dyn Conn>,
    state: Arc<Mutex<SessionState>>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<Arc<VNetRtpStream>>>,
    closed_tx: watch::Sender<bool>,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VNetSrtpSession {
    pub(crate) fn new(conn: Arc<dyn Conn>) -> Self {
        let state = Arc::new(Mutex::new(SessionState::default()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(VNetSrtpSession::read_loop(
            Arc::clone(&conn),
            Arc::clone(&state),
            accept_tx,
            closed_rx,
        ));

        VNetSrtpSession {
            conn,
            state,
            accept_rx: AsyncMutex::new(accept_rx),
            closed_tx,
        }
    }

    async fn read_loop(
        conn: Arc<dyn Conn>,
        state: Arc<Mutex<SessionState>>,
        accept_tx: mpsc::UnboundedSender<Arc<VNetRtpStream>>,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = tokio::select! {
                res = conn.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(err) => {
                        debug!("srtp session read loop exits: {err}");
                        break;
                    }
                },
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };

            if n < SSRC_OFFSET + 4 {
                trace!("drop short rtp packet of {n} bytes");
                continue;
            }
            let ssrc = u32::from_be_bytes([
                buf[SSRC_OFFSET],
                buf[SSRC_OFFSET + 1],
                buf[SSRC_OFFSET + 2],
                buf[SSRC_OFFSET + 3],
            ]);

            let packet = Bytes::copy_from_slice(&buf[..n]);
            let (stream, is_new) = {
                let mut s = lock(&state);
                match s.streams.get(&ssrc) {
                    Some(stream) => (Arc::clone(stream), false),
                    None => {
                        let stream = Arc::new(VNetRtpStream::new(ssrc));
                        s.streams.insert(ssrc, Arc::clone(&stream));
                        (stream, true)
                    }
                }
            };

            stream.push(packet);
            if is_new && accept_tx.send(stream).is_err() {
                break;
            }
        }

        for (_, stream) in lock(&state).streams.drain() {
            stream.closed_tx.send_replace(true);
        }
    }
}

#[async_trait]
impl SrtpSession for VNetSrtpSession {
    async fn open_read_stream(&self, ssrc: SSRC) -> Result<Arc<dyn RtpReadStream>> {
        let mut s = lock(&self.state);
        let stream = s
            .streams
            .entry(ssrc)
            .or_insert_with(|| Arc::new(VNetRtpStream::new(ssrc)));
        Ok(Arc::clone(stream) as Arc<dyn RtpReadStream>)
    }

    async fn accept(&self) -> Result<Arc<dyn RtpReadStream>> {
        let mut accept_rx = self.accept_rx.lock().await;
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            stream = accept_rx.recv() => match stream {
                Some(stream) => Ok(stream as Arc<dyn RtpReadStream>),
                None => Err(Error::ErrConnClosed),
            },
            _ = closed_rx.wait_for(|closed| *closed) => Err(Error::ErrConnClosed),
        }
    }

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<usize> {
        let raw = packet.marshal()?;
        self.conn.send(&raw).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }
        self.conn.close().await
    }
}

pub(crate) struct VNetRtpStream {
    ssrc: SSRC,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed_tx: watch::Sender<bool>,
}

impl VNetRtpStream {
    fn new(ssrc: SSRC) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        VNetRtpStream {
            ssrc,
            tx,
            rx: AsyncMutex::new(rx),
            closed_tx: watch::Sender::new(false),
        }
    }

    fn push(&self, packet: Bytes) {
        if !*self.closed_tx.borrow() {
            let _ = self.tx.send(packet);
        }
    }
}

#[async_trait]
impl RtpReadStream for VNetRtpStream {
    fn ssrc(&self) -> SSRC {
        self.ssrc
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let mut closed_rx = self.closed_tx.subscribe();
        let packet = tokio::select! {
            packet = rx.recv() => packet.ok_or(Error::ErrConnClosed)?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::ErrConnClosed),
        };

        if packet.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed_tx.send_replace(true);
        Ok(())
    }
}
