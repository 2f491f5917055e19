//! Delivery of peer connection events to the application.
//!
//! State changes are posted to a per-connection queue and handed to the
//! registered handlers by a single dispatcher task, so a handler never runs
//! while the connection holds one of its locks and may call back into the
//! connection freely. Each category has at most one handler; registering a
//! new one replaces the previous.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, trace};
use shared::error::{Error, Result};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::data_channel::RTCDataChannel;
use crate::peer_connection::state::{
    RTCIceConnectionState, RTCIceGatheringState, RTCPeerConnectionState, RTCSignalingState,
};
use crate::peer_connection::transport::RTCIceCandidate;

pub mod track_event;

pub use track_event::RTCTrackEvent;

pub type OnSignalingStateChangeHdlrFn = Arc<dyn Fn(RTCSignalingState) + Send + Sync>;
pub type OnICEConnectionStateChangeHdlrFn = Arc<dyn Fn(RTCIceConnectionState) + Send + Sync>;
pub type OnPeerConnectionStateChangeHdlrFn = Arc<dyn Fn(RTCPeerConnectionState) + Send + Sync>;
pub type OnICEGatheringStateChangeHdlrFn = Arc<dyn Fn(RTCIceGatheringState) + Send + Sync>;
pub type OnNegotiationNeededHdlrFn = Arc<dyn Fn() + Send + Sync>;
/// Called with `None` once gathering has finished.
pub type OnLocalCandidateHdlrFn = Arc<dyn Fn(Option<RTCIceCandidate>) + Send + Sync>;
pub type OnTrackHdlrFn = Arc<dyn Fn(RTCTrackEvent) + Send + Sync>;
pub type OnDataChannelHdlrFn = Arc<dyn Fn(Arc<RTCDataChannel>) + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) enum RTCPeerConnectionEvent {
    SignalingStateChange(RTCSignalingState),
    IceConnectionStateChange(RTCIceConnectionState),
    PeerConnectionStateChange(RTCPeerConnectionState),
    IceGatheringStateChange(RTCIceGatheringState),
    NegotiationNeeded,
    IceCandidate(Option<RTCIceCandidate>),
    Track(RTCTrackEvent),
    DataChannel(Arc<RTCDataChannel>),
    /// Last event of a closed connection; the dispatcher drops every handler.
    Shutdown,
}

#[derive(Default)]
struct Handlers {
    on_signaling_state_change: Option<OnSignalingStateChangeHdlrFn>,
    on_ice_connection_state_change: Option<OnICEConnectionStateChangeHdlrFn>,
    on_peer_connection_state_change: Option<OnPeerConnectionStateChangeHdlrFn>,
    on_ice_gathering_state_change: Option<OnICEGatheringStateChangeHdlrFn>,
    on_negotiation_needed: Option<OnNegotiationNeededHdlrFn>,
    on_ice_candidate: Option<OnLocalCandidateHdlrFn>,
    on_track: Option<OnTrackHdlrFn>,
    on_data_channel: Option<OnDataChannelHdlrFn>,
}

fn lock(handlers: &Mutex<Handlers>) -> MutexGuard<'_, Handlers> {
    handlers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// deliver runs one handler. A panicking handler is logged and the
/// dispatcher moves on to the next event.
fn deliver(name: &str, f: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!("{name} handler panicked: {msg}");
    }
}

/// EventDispatcher owns the event queue of one connection.
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<RTCPeerConnectionEvent>,
    handlers: Arc<Mutex<Handlers>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl EventDispatcher {
    /// new spawns the dispatcher task on the current tokio runtime.
    pub(crate) fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| Error::ErrNoAsyncRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handlers = Arc::new(Mutex::new(Handlers::default()));
        runtime.spawn(EventDispatcher::run(rx, Arc::clone(&handlers)));
        Ok(EventDispatcher { tx, handlers })
    }

    pub(crate) fn post(&self, event: RTCPeerConnectionEvent) {
        trace!("post {event:?}");
        if self.tx.send(event).is_err() {
            trace!("event dispatcher already stopped");
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<RTCPeerConnectionEvent>,
        handlers: Arc<Mutex<Handlers>>,
    ) {
        while let Some(event) = rx.recv().await {
            use RTCPeerConnectionEvent::*;

            // clone the handler under the lock, call it outside
            match event {
                SignalingStateChange(state) => {
                    let f = lock(&handlers).on_signaling_state_change.clone();
                    if let Some(f) = f {
                        deliver("on_signaling_state_change", || f(state));
                    }
                }
                IceConnectionStateChange(state) => {
                    let f = lock(&handlers).on_ice_connection_state_change.clone();
                    if let Some(f) = f {
                        deliver("on_ice_connection_state_change", || f(state));
                    }
                }
                PeerConnectionStateChange(state) => {
                    let f = lock(&handlers).on_peer_connection_state_change.clone();
                    if let Some(f) = f {
                        deliver("on_peer_connection_state_change", || f(state));
                    }
                }
                IceGatheringStateChange(state) => {
                    let f = lock(&handlers).on_ice_gathering_state_change.clone();
                    if let Some(f) = f {
                        deliver("on_ice_gathering_state_change", || f(state));
                    }
                }
                NegotiationNeeded => {
                    let f = lock(&handlers).on_negotiation_needed.clone();
                    if let Some(f) = f {
                        deliver("on_negotiation_needed", || f());
                    }
                }
                IceCandidate(candidate) => {
                    let f = lock(&handlers).on_ice_candidate.clone();
                    if let Some(f) = f {
                        deliver("on_ice_candidate", || f(candidate));
                    }
                }
                Track(event) => {
                    let f = lock(&handlers).on_track.clone();
                    if let Some(f) = f {
                        deliver("on_track", || f(event));
                    }
                }
                DataChannel(d) => {
                    let f = lock(&handlers).on_data_channel.clone();
                    if let Some(f) = f {
                        deliver("on_data_channel", || f(d));
                    }
                }
                Shutdown => {
                    *lock(&handlers) = Handlers::default();
                    break;
                }
            }
        }
        trace!("event dispatcher stopped");
    }

    pub(crate) fn on_signaling_state_change(&self, f: OnSignalingStateChangeHdlrFn) {
        lock(&self.handlers).on_signaling_state_change = Some(f);
    }

    pub(crate) fn on_ice_connection_state_change(&self, f: OnICEConnectionStateChangeHdlrFn) {
        lock(&self.handlers).on_ice_connection_state_change = Some(f);
    }

    pub(crate) fn on_peer_connection_state_change(&self, f: OnPeerConnectionStateChangeHdlrFn) {
        lock(&self.handlers).on_peer_connection_state_change = Some(f);
    }

    pub(crate) fn on_ice_gathering_state_change(&self, f: OnICEGatheringStateChangeHdlrFn) {
        lock(&self.handlers).on_ice_gathering_state_change = Some(f);
    }

    pub(crate) fn on_negotiation_needed(&self, f: OnNegotiationNeededHdlrFn) {
        lock(&self.handlers).on_negotiation_needed = Some(f);
    }

    pub(crate) fn on_ice_candidate(&self, f: OnLocalCandidateHdlrFn) {
        lock(&self.handlers).on_ice_candidate = Some(f);
    }

    pub(crate) fn on_track(&self, f: OnTrackHdlrFn) {
        lock(&self.handlers).on_track = Some(f);
    }

    pub(crate) fn on_data_channel(&self, f: OnDataChannelHdlrFn) {
        lock(&self.handlers).on_data_channel = Some(f);
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let dispatcher = EventDispatcher::new().unwrap();
        let (tx, mut rx) = unbounded_channel();
        dispatcher.on_signaling_state_change(Arc::new(move |s| {
            let _ = tx.send(s);
        }));

        dispatcher.post(RTCPeerConnectionEvent::SignalingStateChange(
            RTCSignalingState::HaveLocalOffer,
        ));
        dispatcher.post(RTCPeerConnectionEvent::SignalingStateChange(
            RTCSignalingState::Stable,
        ));

        assert_eq!(rx.recv().await, Some(RTCSignalingState::HaveLocalOffer));
        assert_eq!(rx.recv().await, Some(RTCSignalingState::Stable));
    }

    #[tokio::test]
    async fn test_handler_replaced() {
        let dispatcher = EventDispatcher::new().unwrap();
        let (first_tx, mut first_rx) = unbounded_channel();
        let (second_tx, mut second_rx) = unbounded_channel();

        dispatcher.on_negotiation_needed(Arc::new(move || {
            let _ = first_tx.send(());
        }));
        dispatcher.on_negotiation_needed(Arc::new(move || {
            let _ = second_tx.send(());
        }));
        dispatcher.post(RTCPeerConnectionEvent::NegotiationNeeded);

        assert_eq!(second_rx.recv().await, Some(()));
        // the replaced handler was dropped along with its sender
        assert_eq!(first_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_drops_handlers() {
        let dispatcher = EventDispatcher::new().unwrap();
        let (tx, mut rx) = unbounded_channel::<RTCIceGatheringState>();
        dispatcher.on_ice_gathering_state_change(Arc::new(move |s| {
            let _ = tx.send(s);
        }));

        dispatcher.post(RTCPeerConnectionEvent::IceGatheringStateChange(
            RTCIceGatheringState::Complete,
        ));
        dispatcher.post(RTCPeerConnectionEvent::Shutdown);
        dispatcher.post(RTCPeerConnectionEvent::IceGatheringStateChange(
            RTCIceGatheringState::Gathering,
        ));

        assert_eq!(rx.recv().await, Some(RTCIceGatheringState::Complete));
        let closed = timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed, Ok(None));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatch() {
        let dispatcher = EventDispatcher::new().unwrap();
        let (tx, mut rx) = unbounded_channel();
        dispatcher.on_signaling_state_change(Arc::new(move |s| {
            if s == RTCSignalingState::HaveLocalOffer {
                panic!("handler failure");
            }
            let _ = tx.send(s);
        }));

        dispatcher.post(RTCPeerConnectionEvent::SignalingStateChange(
            RTCSignalingState::HaveLocalOffer,
        ));
        dispatcher.post(RTCPeerConnectionEvent::SignalingStateChange(
            RTCSignalingState::Stable,
        ));

        let next = timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(next, Ok(Some(RTCSignalingState::Stable)));
    }

    #[test]
    fn test_new_outside_runtime() {
        assert_eq!(
            EventDispatcher::new().err(),
            Some(Error::ErrNoAsyncRuntime)
        );
    }
}
