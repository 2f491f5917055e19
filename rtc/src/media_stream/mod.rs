//! Local and remote media tracks.
//!
//! A [`track_local::TrackLocal`] is media produced by the application and
//! bound to one or more senders. A [`track_remote::TrackRemote`] is created
//! by a receiver once the remote peer starts sending a stream.

pub mod track_local;
pub mod track_remote;

/// MediaStreamId groups tracks that should be played in sync, the `msid`
/// stream identifier of a media section.
pub type MediaStreamId = String;

/// MediaStreamTrackId identifies a single track within its stream.
pub type MediaStreamTrackId = String;
