use std::fmt;
use std::io::Cursor;

use sdp::description::session::SessionDescription;
use serde::{Deserialize, Serialize};
use shared::error::Result;

use super::sdp_type::RTCSdpType;

/// RTCSessionDescription is used to expose local and remote session descriptions.
///
/// Once constructed the value is not mutated; the negotiation engine replaces
/// whole descriptions instead. `parsed` caches the structured form of `sdp`.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct RTCSessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: RTCSdpType,

    pub sdp: String,

    /// This will never be initialized by callers, internal use only
    #[serde(skip)]
    pub(crate) parsed: Option<SessionDescription>,
}

impl PartialEq for RTCSessionDescription {
    fn eq(&self, other: &Self) -> bool {
        self.sdp_type == other.sdp_type && self.sdp == other.sdp
    }
}

impl fmt::Display for RTCSessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type: {}, sdp:\n{}",
            self.sdp_type,
            self.sdp.replace("\r\n", "\n")
        )
    }
}

impl RTCSessionDescription {
    fn parse(sdp_type: RTCSdpType, sdp: String) -> Result<RTCSessionDescription> {
        let mut desc = RTCSessionDescription {
            sdp_type,
            sdp,
            parsed: None,
        };
        desc.parsed = Some(desc.unmarshal()?);
        Ok(desc)
    }

    /// Given SDP representing an answer, wrap it in an RTCSessionDescription
    /// that can be given to a peer connection.
    pub fn answer(sdp: String) -> Result<RTCSessionDescription> {
        Self::parse(RTCSdpType::Answer, sdp)
    }

    /// Given SDP representing an offer, wrap it in an RTCSessionDescription
    /// that can be given to a peer connection.
    pub fn offer(sdp: String) -> Result<RTCSessionDescription> {
        Self::parse(RTCSdpType::Offer, sdp)
    }

    /// Given SDP representing a provisional answer, wrap it in an
    /// RTCSessionDescription that can be given to a peer connection.
    pub fn pranswer(sdp: String) -> Result<RTCSessionDescription> {
        Self::parse(RTCSdpType::Pranswer, sdp)
    }

    /// A rollback carries no SDP.
    pub fn rollback() -> RTCSessionDescription {
        RTCSessionDescription {
            sdp_type: RTCSdpType::Rollback,
            sdp: String::new(),
            parsed: None,
        }
    }

    /// Unmarshal is a helper to deserialize the sdp
    pub fn unmarshal(&self) -> Result<SessionDescription> {
        let mut reader = Cursor::new(self.sdp.as_bytes());
        Ok(SessionDescription::unmarshal(&mut reader)?)
    }

    pub(crate) fn from_parsed(sdp_type: RTCSdpType, parsed: SessionDescription) -> Self {
        RTCSessionDescription {
            sdp_type,
            sdp: parsed.marshal(),
            parsed: Some(parsed),
        }
    }
}
