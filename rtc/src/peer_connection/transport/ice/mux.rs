use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use shared::Conn;
use shared::error::{Error, Result};

/// MatchFunc decides whether a packet belongs to an endpoint, judging by its
/// first bytes. See `shared::util` for the RFC 7983 ranges.
pub type MatchFunc = fn(&[u8]) -> bool;

/// Large enough for a whole data channel message of the maximum size.
const MAX_PACKET_SIZE: usize = 270 * 1024;

struct MuxEndpointEntry {
    match_fn: MatchFunc,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct MuxState {
    endpoints: Vec<MuxEndpointEntry>,
}

/// Mux demultiplexes packets read from the ICE connection between the
/// protocols sharing it (DTLS, SRTP). Packets matching no endpoint are dropped.
pub struct Mux {
    next_conn: Arc<dyn Conn>,
    state: Arc<Mutex<MuxState>>,
    closed_tx: watch::Sender<bool>,
}

fn lock(state: &Mutex<MuxState>) -> MutexGuard<'_, MuxState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Mux {
    /// new starts reading from `next_conn` on a background task.
    pub fn new(next_conn: Arc<dyn Conn>) -> Arc<Self> {
        let (closed_tx, closed_rx) = watch::channel(false);
        let mux = Arc::new(Mux {
            next_conn: Arc::clone(&next_conn),
            state: Arc::new(Mutex::new(MuxState::default())),
            closed_tx,
        });

        tokio::spawn(Mux::read_loop(
            next_conn,
            Arc::clone(&mux.state),
            closed_rx,
        ));

        mux
    }

    /// new_endpoint registers a reader for the packets accepted by `match_fn`.
    /// The first registered endpoint matching a packet receives it.
    pub fn new_endpoint(&self, match_fn: MatchFunc) -> Arc<Endpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state)
            .endpoints
            .push(MuxEndpointEntry { match_fn, tx });

        Arc::new(Endpoint {
            next_conn: Arc::clone(&self.next_conn),
            rx: AsyncMutex::new(rx),
            closed_tx: watch::Sender::new(false),
            mux_closed_rx: self.closed_tx.subscribe(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }
        lock(&self.state).endpoints.clear();
        self.next_conn.close().await
    }

    async fn read_loop(
        next_conn: Arc<dyn Conn>,
        state: Arc<Mutex<MuxState>>,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = tokio::select! {
                res = next_conn.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(err) => {
                        debug!("mux read loop exits: {err}");
                        break;
                    }
                },
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };

            if n == 0 {
                debug!("drop invalid packet due to zero length");
                continue;
            }

            let packet = Bytes::copy_from_slice(&buf[..n]);
            let mut s = lock(&state);
            match s.endpoints.iter().position(|e| (e.match_fn)(&packet)) {
                Some(index) => {
                    if s.endpoints[index].tx.send(packet).is_err() {
                        // endpoint was dropped, stop routing to it
                        s.endpoints.remove(index);
                    }
                }
                None => trace!("mux dropped a packet of {n} bytes, first byte {}", buf[0]),
            }
        }

        lock(&state).endpoints.clear();
    }
}

/// Endpoint is one protocol's view of the muxed connection. Writes go
/// straight to the underlying connection.
pub struct Endpoint {
    next_conn: Arc<dyn Conn>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed_tx: watch::Sender<bool>,
    mux_closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Conn for Endpoint {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let mut closed_rx = self.closed_tx.subscribe();
        let mut mux_closed_rx = self.mux_closed_rx.clone();

        let packet = tokio::select! {
            packet = rx.recv() => packet.ok_or(Error::ErrConnClosed)?,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::ErrConnClosed),
            _ = mux_closed_rx.wait_for(|closed| *closed) => return Err(Error::ErrConnClosed),
        };

        if packet.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if *self.closed_tx.borrow() {
            return Err(Error::ErrConnClosed);
        }
        self.next_conn.send(buf).await
    }

    async fn close(&self) -> Result<()> {
        self.closed_tx.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::transport::vnet::conn::pipe;
    use shared::util::{match_dtls, match_srtp};

    #[tokio::test]
    async fn test_mux_routes_by_first_byte() -> Result<()> {
        let (a, b) = pipe();
        let mux = Mux::new(Arc::new(b));
        let dtls = mux.new_endpoint(match_dtls);
        let srtp = mux.new_endpoint(match_srtp);

        // STUN range, nobody listens
        a.send(&[0x01, 0x01]).await?;
        a.send(&[22, 1, 2]).await?;
        a.send(&[0x80, 96, 0, 1]).await?;

        let mut buf = [0u8; 16];
        let n = dtls.recv(&mut buf).await?;
        assert_eq!(&[22, 1, 2], &buf[..n]);
        let n = srtp.recv(&mut buf).await?;
        assert_eq!(&[0x80, 96, 0, 1], &buf[..n]);

        mux.close().await?;
        assert_eq!(Err(Error::ErrConnClosed), dtls.recv(&mut buf).await);

        Ok(())
    }
}
