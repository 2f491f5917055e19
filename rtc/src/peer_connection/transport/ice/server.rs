use serde::{Deserialize, Serialize};
use url::Url;

use shared::error::{Error, Result};

/// ICEServer describes a single STUN and TURN server that can be used by
/// the ICEAgent to establish a connection with a peer.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RTCIceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl RTCIceServer {
    /// validate parses every url and checks that TURN urls carry credentials.
    pub(crate) fn validate(&self) -> Result<()> {
        for raw in &self.urls {
            let url = Url::parse(raw)?;
            match url.scheme() {
                "stun" | "stuns" => {}
                "turn" | "turns" => {
                    // https://www.w3.org/TR/webrtc/#set-the-configuration (step #11.3.2)
                    if self.username.is_empty() || self.credential.is_empty() {
                        return Err(Error::ErrNoTurnCredentials);
                    }
                }
                scheme => {
                    return Err(Error::Other(format!("unknown ICE server scheme: {scheme}")));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ice_server_validate_success() {
        let tests = vec![
            RTCIceServer {
                urls: vec!["turn:192.158.29.39?transport=udp".to_owned()],
                username: "unittest".to_owned(),
                credential: "placeholder".to_owned(),
            },
            RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            },
        ];

        for ice_server in tests {
            assert!(ice_server.validate().is_ok(), "{ice_server:?}");
        }
    }

    #[test]
    fn test_ice_server_validate_failure() {
        let server = RTCIceServer {
            urls: vec!["turn:192.158.29.39?transport=udp".to_owned()],
            ..Default::default()
        };
        assert_eq!(Err(Error::ErrNoTurnCredentials), server.validate());

        let server = RTCIceServer {
            urls: vec!["http://example.org".to_owned()],
            ..Default::default()
        };
        assert!(server.validate().is_err());

        let server = RTCIceServer {
            urls: vec!["not a url".to_owned()],
            ..Default::default()
        };
        assert!(server.validate().is_err());
    }
}
