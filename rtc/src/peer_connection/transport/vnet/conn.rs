use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use shared::Conn;
use shared::error::{Error, Result};

/// One end of an in-memory datagram pipe. Closing either end closes both.
pub struct PipeConn {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: Arc<watch::Sender<bool>>,
}

/// pipe returns two connected ends.
pub fn pipe() -> (PipeConn, PipeConn) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(watch::Sender::new(false));

    (
        PipeConn {
            tx: a_tx,
            rx: AsyncMutex::new(b_rx),
            closed: Arc::clone(&closed),
        },
        PipeConn {
            tx: b_tx,
            rx: AsyncMutex::new(a_rx),
            closed,
        },
    )
}

#[async_trait]
impl Conn for PipeConn {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.rx.lock().await;
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow() {
            return Err(Error::ErrConnClosed);
        }

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

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if *self.closed.borrow() {
            return Err(Error::ErrConnClosed);
        }
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| Error::ErrConnClosed)?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_pipe_close_closes_both_ends() -> Result<()> {
        let (a, b) = pipe();
        a.send(b"hello").await?;

        let mut buf = [0u8; 8];
        let n = b.recv(&mut buf).await?;
        assert_eq!(b"hello", &buf[..n]);

        b.close().await?;
        assert_eq!(Err(Error::ErrConnClosed), a.recv(&mut buf).await);
        assert_eq!(Err(Error::ErrConnClosed), a.send(b"x").await);

        Ok(())
    }
}
