use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};

use shared::Conn;
use shared::error::{Error, Result};

use crate::peer_connection::transport::sctp::engine::{
    DataChannelConfig, DataChannelStream, SctpAssociation,
};

const FRAME_OPEN: u8 = 0;
const FRAME_DATA: u8 = 1;
const FRAME_CLOSE: u8 = 2;

const FRAME_HEADER_LEN: usize = 4;

type AcceptedChannel = (Arc<VNetDataChannelStream>, DataChannelConfig);

#[derive(Default)]
struct AssociationState {
    streams: HashMap<u16, Arc<VNetDataChannelStream>>,
}

/// Message oriented association over the DTLS application channel. Every
/// message is one frame `[type][stream id][is string][payload]`; the pipe
/// underneath keeps frames in order.
pub(crate) struct VNetAssociation {
    conn: Arc<dyn Conn>,
    max_message_size: u32,
    state: Arc<Mutex<AssociationState>>,
    accept_rx: AsyncMutex<mpsc::UnboundedReceiver<AcceptedChannel>>,
    closed_tx: watch::Sender<bool>,
}

fn lock(state: &Mutex<AssociationState>) -> MutexGuard<'_, AssociationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn frame(typ: u8, id: u16, is_string: bool, payload: &[u8]) -> Bytes {
    let mut b = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    b.put_u8(typ);
    b.put_u16(id);
    b.put_u8(is_string as u8);
    b.put_slice(payload);
    b.freeze()
}

fn marshal_open(config: &DataChannelConfig) -> Bytes {
    let mut b = BytesMut::new();
    b.put_u8(config.ordered as u8);
    b.put_u16(config.label.len() as u16);
    b.put_slice(config.label.as_bytes());
    b.put_u16(config.protocol.len() as u16);
    b.put_slice(config.protocol.as_bytes());
    b.freeze()
}

fn unmarshal_open(mut raw: &[u8]) -> Result<DataChannelConfig> {
    fn read_string(raw: &mut &[u8]) -> Result<String> {
        if raw.remaining() < 2 {
            return Err(Error::ErrShortPacket);
        }
        let len = raw.get_u16() as usize;
        if raw.remaining() < len {
            return Err(Error::ErrShortPacket);
        }
        let s = String::from_utf8(raw[..len].to_vec())?;
        raw.advance(len);
        Ok(s)
    }

    if !raw.has_remaining() {
        return Err(Error::ErrShortPacket);
    }
    let ordered = raw.get_u8() == 1;
    let label = read_string(&mut raw)?;
    let protocol = read_string(&mut raw)?;

    Ok(DataChannelConfig {
        label,
        protocol,
        ordered,
        ..Default::default()
    })
}

impl VNetAssociation {
    pub(crate) fn new(conn: Arc<dyn Conn>, max_message_size: u32) -> Self {
        let state = Arc::new(Mutex::new(AssociationState::default()));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(VNetAssociation::read_loop(
            Arc::clone(&conn),
            Arc::clone(&state),
            accept_tx,
            closed_rx,
            max_message_size,
        ));

        VNetAssociation {
            conn,
            max_message_size,
            state,
            accept_rx: AsyncMutex::new(accept_rx),
            closed_tx,
        }
    }

    fn new_stream(&self, id: u16) -> Arc<VNetDataChannelStream> {
        let stream = Arc::new(VNetDataChannelStream::new(
            id,
            Arc::clone(&self.conn),
            self.max_message_size,
        ));
        lock(&self.state).streams.insert(id, Arc::clone(&stream));
        stream
    }

    async fn read_loop(
        conn: Arc<dyn Conn>,
        state: Arc<Mutex<AssociationState>>,
        accept_tx: mpsc::UnboundedSender<AcceptedChannel>,
        mut closed_rx: watch::Receiver<bool>,
        max_message_size: u32,
    ) {
        let mut buf = vec![0u8; FRAME_HEADER_LEN + max_message_size as usize];
        loop {
            let n = tokio::select! {
                res = conn.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(err) => {
                        debug!("sctp association read loop exits: {err}");
                        break;
                    }
                },
                _ = closed_rx.wait_for(|closed| *closed) => break,
            };

            if n < FRAME_HEADER_LEN {
                trace!("drop short sctp frame of {n} bytes");
                continue;
            }
            let typ = buf[0];
            let id = u16::from_be_bytes([buf[1], buf[2]]);
            let is_string = buf[3] == 1;
            let payload = &buf[FRAME_HEADER_LEN..n];

            match typ {
                FRAME_OPEN => {
                    let config = match unmarshal_open(payload) {
                        Ok(config) => config,
                        Err(err) => {
                            debug!("drop malformed open for stream {id}: {err}");
                            continue;
                        }
                    };
                    let stream = Arc::new(VNetDataChannelStream::new(
                        id,
                        Arc::clone(&conn),
                        max_message_size,
                    ));
                    lock(&state).streams.insert(id, Arc::clone(&stream));
                    if accept_tx.send((stream, config)).is_err() {
                        break;
                    }
                }
                FRAME_DATA => {
                    let stream = lock(&state).streams.get(&id).cloned();
                    match stream {
                        Some(stream) => stream.push(Bytes::copy_from_slice(payload), is_string),
                        None => trace!("drop data for unknown stream {id}"),
                    }
                }
                FRAME_CLOSE => {
                    if let Some(stream) = lock(&state).streams.remove(&id) {
                        stream.closed_tx.send_replace(true);
                    }
                }
                _ => trace!("drop sctp frame of unknown type {typ}"),
            }
        }

        for (_, stream) in lock(&state).streams.drain() {
            stream.closed_tx.send_replace(true);
        }
    }
}

#[async_trait]
impl SctpAssociation for VNetAssociation {
    async fn open_channel(
        &self,
        id: u16,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelStream>> {
        if *self.closed_tx.borrow() {
            return Err(Error::ErrSCTPNotEstablished);
        }

        let stream = self.new_stream(id);
        if !config.negotiated {
            self.conn
                .send(&frame(FRAME_OPEN, id, false, &marshal_open(&config)))
                .await?;
        }
        Ok(stream)
    }

    async fn accept_channel(&self) -> Result<(Arc<dyn DataChannelStream>, DataChannelConfig)> {
        let mut accept_rx = self.accept_rx.lock().await;
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            accepted = accept_rx.recv() => match accepted {
                Some((stream, config)) => Ok((stream as Arc<dyn DataChannelStream>, config)),
                None => Err(Error::ErrConnClosed),
            },
            _ = closed_rx.wait_for(|closed| *closed) => Err(Error::ErrConnClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }
        self.conn.close().await
    }
}

pub(crate) struct VNetDataChannelStream {
    id: u16,
    conn: Arc<dyn Conn>,
    max_message_size: u32,
    tx: mpsc::UnboundedSender<(Bytes, bool)>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<(Bytes, bool)>>,
    closed_tx: watch::Sender<bool>,
}

impl VNetDataChannelStream {
    fn new(id: u16, conn: Arc<dyn Conn>, max_message_size: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        VNetDataChannelStream {
            id,
            conn,
            max_message_size,
            tx,
            rx: AsyncMutex::new(rx),
            closed_tx: watch::Sender::new(false),
        }
    }

    fn push(&self, data: Bytes, is_string: bool) {
        if !*self.closed_tx.borrow() {
            let _ = self.tx.send((data, is_string));
        }
    }
}

#[async_trait]
impl DataChannelStream for VNetDataChannelStream {
    fn stream_identifier(&self) -> u16 {
        self.id
    }

    async fn read(&self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let mut rx = self.rx.lock().await;
        // deliver what arrived before the close first
        let message = match rx.try_recv() {
            Ok(message) => message,
            Err(_) => {
                let mut closed_rx = self.closed_tx.subscribe();
                tokio::select! {
                    message = rx.recv() => message.ok_or(Error::ErrClosedPipe)?,
                    _ = closed_rx.wait_for(|closed| *closed) => return Err(Error::ErrClosedPipe),
                }
            }
        };

        let (data, is_string) = message;
        if data.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall);
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok((data.len(), is_string))
    }

    async fn write(&self, data: &[u8], is_string: bool) -> Result<usize> {
        if *self.closed_tx.borrow() {
            return Err(Error::ErrClosedPipe);
        }
        if data.len() > self.max_message_size as usize {
            return Err(Error::ErrOutboundPacketTooLarge);
        }
        self.conn
            .send(&frame(FRAME_DATA, self.id, is_string, data))
            .await?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<()> {
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }
        match self.conn.send(&frame(FRAME_CLOSE, self.id, false, &[])).await {
            // the peer tore the association down first
            Err(Error::ErrConnClosed | Error::ErrClosedPipe) => Ok(()),
            res => res.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer_connection::transport::vnet::conn::pipe;

    #[tokio::test]
    async fn test_association_open_accept_in_order() -> Result<()> {
        let (a, b) = pipe();
        let client = VNetAssociation::new(Arc::new(a), 65536);
        let server = VNetAssociation::new(Arc::new(b), 65536);

        let config = DataChannelConfig {
            label: "chat".to_owned(),
            protocol: "json".to_owned(),
            ordered: true,
            ..Default::default()
        };
        let local = client.open_channel(0, config.clone()).await?;
        for i in 0..10u8 {
            local.write(&[i], false).await?;
        }
        local.write(b"done", true).await?;

        let (remote, remote_config) = server.accept_channel().await?;
        assert_eq!(0, remote.stream_identifier());
        assert_eq!(config.label, remote_config.label);
        assert_eq!(config.protocol, remote_config.protocol);
        assert!(remote_config.ordered);

        let mut buf = [0u8; 16];
        for i in 0..10u8 {
            let (n, is_string) = remote.read(&mut buf).await?;
            assert_eq!((&[i][..], false), (&buf[..n], is_string));
        }
        let (n, is_string) = remote.read(&mut buf).await?;
        assert_eq!((&b"done"[..], true), (&buf[..n], is_string));

        local.close().await?;
        assert_eq!(Err(Error::ErrClosedPipe), remote.read(&mut buf).await);

        Ok(())
    }

    #[tokio::test]
    async fn test_close_stream_after_peer_closed() -> Result<()> {
        let (a, b) = pipe();
        let client = VNetAssociation::new(Arc::new(a), 65536);
        let server = VNetAssociation::new(Arc::new(b), 65536);

        let local = client.open_channel(0, DataChannelConfig::default()).await?;
        let (_remote, _) = server.accept_channel().await?;

        server.close().await?;
        local.close().await?;
        local.close().await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_write_larger_than_max_message_size() -> Result<()> {
        let (a, _b) = pipe();
        let client = VNetAssociation::new(Arc::new(a), 4);
        let stream = client
            .open_channel(
                2,
                DataChannelConfig {
                    negotiated: true,
                    ..Default::default()
                },
            )
            .await?;

        assert_eq!(
            Err(Error::ErrOutboundPacketTooLarge),
            stream.write(b"12345", false).await
        );
        Ok(())
    }
}
