//! # RTC Signaling
//!
//! A WebRTC signaling and negotiation engine: the [`RTCPeerConnection`](peer_connection::RTCPeerConnection)
//! state machine that produces and consumes SDP offers and answers, tracks transceivers,
//! fires negotiation-needed, and drives the ICE, DTLS and SCTP transports it owns.
//!
//! ## Module Organization
//!
//! - **[`api`]** - [`API`](api::API) and [`APIBuilder`](api::APIBuilder), the factory that
//!   shares a media engine and setting engine between connections
//! - **[`peer_connection`]** - the peer connection, its configuration, SDP types, states and events
//! - **[`rtp_transceiver`]** - transceivers, senders, receivers and codec parameters
//! - **[`data_channel`]** - data channels negotiated over the SCTP association
//! - **[`media_stream`]** - local and remote media tracks
//!
//! ## Specification Compliance
//!
//! - [W3C WebRTC 1.0] - Main WebRTC API specification
//! - [RFC 8829] - JSEP: JavaScript Session Establishment Protocol
//! - [RFC 8866] - SDP: Session Description Protocol
//!
//! [W3C WebRTC 1.0]: https://www.w3.org/TR/webrtc/
//! [RFC 8829]: https://datatracker.ietf.org/doc/html/rfc8829
//! [RFC 8866]: https://datatracker.ietf.org/doc/html/rfc8866

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub use {rtp, sdp, shared};

pub mod api;
pub mod data_channel;
pub mod media_stream;
pub mod peer_connection;
pub mod rtp_transceiver;
