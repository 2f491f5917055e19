use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use log::{debug, info};

use shared::error::{Error, Result};

use crate::data_channel::message::RTCDataChannelMessage;
use crate::data_channel::parameters::DataChannelParameters;
use crate::data_channel::state::RTCDataChannelState;
use crate::peer_connection::transport::sctp::engine::{DataChannelStream, SctpAssociation};

pub mod init;
pub mod message;
pub(crate) mod parameters;
pub mod state;

/// Identifier for a data channel within a particular peer connection
pub type RTCDataChannelId = u16;

/// Fits the largest message an association accepts.
const DATA_CHANNEL_BUFFER_SIZE: usize = 256 * 1024;

pub type OnOpenHdlrFn = Arc<dyn Fn() + Send + Sync>;
pub type OnMessageHdlrFn = Arc<dyn Fn(RTCDataChannelMessage) + Send + Sync>;
pub type OnCloseHdlrFn = Arc<dyn Fn() + Send + Sync>;
pub type OnErrorHdlrFn = Arc<dyn Fn(Error) + Send + Sync>;

#[derive(Default)]
struct DataChannelHandlers {
    on_open: Option<OnOpenHdlrFn>,
    on_message: Option<OnMessageHdlrFn>,
    on_close: Option<OnCloseHdlrFn>,
    on_error: Option<OnErrorHdlrFn>,
}

#[derive(Default)]
struct DataChannelInternal {
    id: Option<RTCDataChannelId>,
    ready_state: RTCDataChannelState,
    stream: Option<Arc<dyn DataChannelStream>>,
    /// Messages that arrived before an on_message handler was set.
    pending: Vec<RTCDataChannelMessage>,
    handlers: DataChannelHandlers,
}

/// DataChannel represents a WebRTC DataChannel
/// The DataChannel interface represents a network channel
/// which can be used for bidirectional peer-to-peer transfers of arbitrary data
///
/// ## Specifications
///
/// * [MDN]
/// * [W3C]
///
/// [MDN]: https://developer.mozilla.org/en-US/docs/Web/API/RTCDataChannel
/// [W3C]: https://w3c.github.io/webrtc-pc/#dom-rtcdatachannel
pub struct RTCDataChannel {
    params: DataChannelParameters,
    internal: Mutex<DataChannelInternal>,
}

impl std::fmt::Debug for RTCDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let internal = lock(&self.internal);
        f.debug_struct("RTCDataChannel")
            .field("label", &self.params.label)
            .field("id", &internal.id)
            .field("ready_state", &internal.ready_state)
            .finish()
    }
}

fn lock(m: &Mutex<DataChannelInternal>) -> MutexGuard<'_, DataChannelInternal> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RTCDataChannel {
    /// create the DataChannel object before the networking is set up.
    pub(crate) fn new(params: DataChannelParameters) -> Self {
        RTCDataChannel {
            internal: Mutex::new(DataChannelInternal {
                id: params.negotiated,
                ready_state: RTCDataChannelState::Connecting,
                ..Default::default()
            }),
            params,
        }
    }

    /// label represents a label that can be used to distinguish this
    /// DataChannel object from other DataChannel objects. Scripts are
    /// allowed to create multiple DataChannel objects with the same label.
    pub fn label(&self) -> &str {
        &self.params.label
    }

    /// Ordered returns true if the DataChannel is ordered, and false if
    /// out-of-order delivery is allowed.
    pub fn ordered(&self) -> bool {
        self.params.ordered
    }

    /// max_packet_lifetime represents the length of the time window (msec) during
    /// which transmissions and retransmissions may occur in unreliable mode.
    pub fn max_packet_life_time(&self) -> Option<u16> {
        self.params.max_packet_life_time
    }

    /// max_retransmits represents the maximum number of retransmissions that are
    /// attempted in unreliable mode.
    pub fn max_retransmits(&self) -> Option<u16> {
        self.params.max_retransmits
    }

    /// protocol represents the name of the sub-protocol used with this
    /// DataChannel.
    pub fn protocol(&self) -> &str {
        &self.params.protocol
    }

    /// negotiated represents whether this DataChannel was negotiated by the
    /// application (true), or not (false).
    pub fn negotiated(&self) -> bool {
        self.params.negotiated.is_some()
    }

    /// ID represents the ID for this DataChannel. The value is initially
    /// None, which is what will be returned if the ID was not provided at
    /// channel creation time, and the DTLS role of the SCTP transport has not
    /// yet been negotiated. Once set it does not change.
    pub fn id(&self) -> Option<RTCDataChannelId> {
        lock(&self.internal).id
    }

    pub(crate) fn set_id(&self, id: RTCDataChannelId) {
        lock(&self.internal).id.get_or_insert(id);
    }

    /// ready_state represents the state of the DataChannel object.
    pub fn ready_state(&self) -> RTCDataChannelState {
        lock(&self.internal).ready_state
    }

    /// on_open sets an event handler which is invoked when the underlying
    /// data transport has been established. If the channel is already open
    /// the handler runs right away.
    pub fn on_open(&self, f: OnOpenHdlrFn) {
        let already_open = {
            let mut internal = lock(&self.internal);
            internal.handlers.on_open = Some(Arc::clone(&f));
            internal.ready_state == RTCDataChannelState::Open
        };

        if already_open {
            f();
        }
    }

    /// on_message sets an event handler which is invoked on a binary or
    /// text message arrival over the sctp transport from a remote peer.
    /// Messages received before any handler was set are handed over first.
    pub fn on_message(&self, f: OnMessageHdlrFn) {
        let pending = {
            let mut internal = lock(&self.internal);
            internal.handlers.on_message = Some(Arc::clone(&f));
            std::mem::take(&mut internal.pending)
        };

        for msg in pending {
            f(msg);
        }
    }

    /// on_close sets an event handler which is invoked when
    /// the underlying data transport has been closed.
    pub fn on_close(&self, f: OnCloseHdlrFn) {
        lock(&self.internal).handlers.on_close = Some(f);
    }

    pub fn on_error(&self, f: OnErrorHdlrFn) {
        lock(&self.internal).handlers.on_error = Some(f);
    }

    /// open announces the channel on the association and starts reading.
    pub(crate) async fn open(
        self: &Arc<Self>,
        association: &Arc<dyn SctpAssociation>,
    ) -> Result<()> {
        let id = {
            let internal = lock(&self.internal);
            if internal.stream.is_some() || internal.ready_state != RTCDataChannelState::Connecting {
                return Ok(());
            }
            internal.id.ok_or(Error::ErrNegotiatedWithoutID)?
        };

        let stream = association.open_channel(id, self.params.to_config()).await?;
        self.handle_open(stream);
        Ok(())
    }

    /// handle_open binds an established stream, either dialed locally or
    /// accepted from the remote peer.
    pub(crate) fn handle_open(self: &Arc<Self>, stream: Arc<dyn DataChannelStream>) {
        let on_open = {
            let mut internal = lock(&self.internal);
            if internal.ready_state != RTCDataChannelState::Connecting {
                return;
            }
            internal.id.get_or_insert(stream.stream_identifier());
            internal.stream = Some(Arc::clone(&stream));
            internal.ready_state = RTCDataChannelState::Open;
            internal.handlers.on_open.clone()
        };
        info!("data channel '{}' opened", self.params.label);

        if let Some(f) = on_open {
            f();
        }

        tokio::spawn(RTCDataChannel::read_loop(Arc::clone(self), stream));
    }

    async fn read_loop(dc: Arc<RTCDataChannel>, stream: Arc<dyn DataChannelStream>) {
        let mut buf = vec![0u8; DATA_CHANNEL_BUFFER_SIZE];
        loop {
            let (n, is_string) = match stream.read(&mut buf).await {
                Ok(r) => r,
                Err(Error::ErrBufferTooSmall) => {
                    dc.handle_error(Error::ErrBufferTooSmall);
                    continue;
                }
                Err(err) => {
                    debug!("data channel '{}' read loop exits: {err}", dc.params.label);
                    break;
                }
            };

            let msg = RTCDataChannelMessage {
                is_string,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            let on_message = {
                let mut internal = lock(&dc.internal);
                match &internal.handlers.on_message {
                    Some(f) => Some(Arc::clone(f)),
                    None => {
                        internal.pending.push(msg.clone());
                        None
                    }
                }
            };
            if let Some(f) = on_message {
                f(msg);
            }
        }

        dc.set_closed();
    }

    fn handle_error(&self, err: Error) {
        let on_error = lock(&self.internal).handlers.on_error.clone();
        if let Some(f) = on_error {
            f(err);
        }
    }

    fn set_closed(&self) {
        let on_close = {
            let mut internal = lock(&self.internal);
            if internal.ready_state == RTCDataChannelState::Closed {
                return;
            }
            internal.ready_state = RTCDataChannelState::Closed;
            internal.handlers.on_close.clone()
        };
        info!("data channel '{}' closed", self.params.label);

        if let Some(f) = on_close {
            f();
        }
    }

    fn open_stream(&self) -> Result<Arc<dyn DataChannelStream>> {
        let internal = lock(&self.internal);
        match (&internal.stream, internal.ready_state) {
            (Some(stream), RTCDataChannelState::Open) => Ok(Arc::clone(stream)),
            _ => Err(Error::ErrDataChannelNotOpen),
        }
    }

    /// send sends the binary message to the DataChannel peer
    pub async fn send(&self, data: &Bytes) -> Result<usize> {
        self.open_stream()?.write(data, false).await
    }

    /// send_text sends the text message to the DataChannel peer
    pub async fn send_text(&self, s: impl Into<String>) -> Result<usize> {
        let s = s.into();
        self.open_stream()?.write(s.as_bytes(), true).await
    }

    /// close closes the DataChannel. It may be called regardless of whether
    /// the DataChannel object was created by this peer or the remote peer.
    pub async fn close(&self) -> Result<()> {
        let stream = {
            let mut internal = lock(&self.internal);
            if matches!(
                internal.ready_state,
                RTCDataChannelState::Closing | RTCDataChannelState::Closed
            ) {
                return Ok(());
            }
            internal.ready_state = RTCDataChannelState::Closing;
            internal.stream.take()
        };

        let result = match stream {
            Some(stream) => stream.close().await,
            None => Ok(()),
        };
        self.set_closed();

        result
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;
    use crate::peer_connection::transport::sctp::engine::SctpEngine;
    use crate::peer_connection::transport::vnet::VNet;
    use crate::peer_connection::transport::vnet::conn::pipe;

    #[tokio::test]
    async fn test_data_channel_send_receive_and_close() -> Result<()> {
        let vnet = VNet::new();
        let (a, b) = pipe();
        let client = vnet.associate(Arc::new(a), true, 65536).await?;
        let server = vnet.associate(Arc::new(b), false, 65536).await?;

        let dc = Arc::new(RTCDataChannel::new(DataChannelParameters::new("chat", None)?));
        assert_eq!(
            Err(Error::ErrDataChannelNotOpen),
            dc.send_text("too early").await
        );
        dc.set_id(0);

        let opened = Arc::new(AtomicUsize::new(0));
        let opened2 = Arc::clone(&opened);
        dc.on_open(Arc::new(move || {
            opened2.fetch_add(1, Ordering::SeqCst);
        }));
        dc.open(&client).await?;
        assert_eq!(RTCDataChannelState::Open, dc.ready_state());
        assert_eq!(1, opened.load(Ordering::SeqCst));

        dc.send_text("hello").await?;
        dc.send(&Bytes::from_static(&[1, 2, 3])).await?;

        let (stream, config) = server.accept_channel().await?;
        let remote = Arc::new(RTCDataChannel::new(DataChannelParameters::from(config)));
        remote.handle_open(stream);
        assert_eq!(Some(0), remote.id());
        assert_eq!("chat", remote.label());

        let (tx, mut rx) = mpsc::unbounded_channel();
        remote.on_message(Arc::new(move |msg| {
            let _ = tx.send(msg);
        }));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        remote.on_close(Arc::new(move || {
            let _ = closed_tx.send(());
        }));

        let msg = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        assert!(msg.is_string);
        assert_eq!(&b"hello"[..], &msg.data[..]);
        let msg = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        assert!(!msg.is_string);
        assert_eq!(&[1, 2, 3][..], &msg.data[..]);

        dc.close().await?;
        dc.close().await?;
        assert_eq!(RTCDataChannelState::Closed, dc.ready_state());
        closed_rx.recv().await;
        assert_eq!(RTCDataChannelState::Closed, remote.ready_state());

        Ok(())
    }
}
