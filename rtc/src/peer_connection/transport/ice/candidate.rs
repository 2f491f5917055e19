use std::fmt;

use serde::{Deserialize, Serialize};

use super::candidate_type::RTCIceCandidateType;
use super::protocol::RTCIceProtocol;
use shared::error::{Error, Result};

const CANDIDATE_PREFIX: &str = "candidate:";

/// TCP candidate type as described in <https://tools.ietf.org/html/rfc6544#section-4.5>.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone, Serialize, Deserialize)]
pub enum RTCIceTcpCandidateType {
    #[default]
    Unspecified,

    #[serde(rename = "active")]
    Active,

    #[serde(rename = "passive")]
    Passive,

    #[serde(rename = "so")]
    SimultaneousOpen,
}

impl From<&str> for RTCIceTcpCandidateType {
    fn from(raw: &str) -> Self {
        match raw {
            "active" => RTCIceTcpCandidateType::Active,
            "passive" => RTCIceTcpCandidateType::Passive,
            "so" => RTCIceTcpCandidateType::SimultaneousOpen,
            _ => RTCIceTcpCandidateType::Unspecified,
        }
    }
}

impl fmt::Display for RTCIceTcpCandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RTCIceTcpCandidateType::Active => "active",
            RTCIceTcpCandidateType::Passive => "passive",
            RTCIceTcpCandidateType::SimultaneousOpen => "so",
            RTCIceTcpCandidateType::Unspecified => "",
        };
        write!(f, "{s}")
    }
}

/// ICECandidate represents a ice candidate
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RTCIceCandidate {
    pub stats_id: String,
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: RTCIceProtocol,
    pub port: u16,
    pub typ: RTCIceCandidateType,
    pub component: u16,
    pub related_address: String,
    pub related_port: u16,
    pub tcp_type: RTCIceTcpCandidateType,
}

impl RTCIceCandidate {
    /// marshal renders the candidate in the `candidate-attribute` grammar of
    /// RFC 8839 section 5.1, without the `candidate:` prefix.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.typ
        );

        if self.tcp_type != RTCIceTcpCandidateType::Unspecified {
            val += format!(" tcptype {}", self.tcp_type).as_str();
        }

        if !self.related_address.is_empty() {
            val += format!(
                " raddr {} rport {}",
                self.related_address, self.related_port
            )
            .as_str();
        }

        val
    }

    /// unmarshal parses a candidate attribute value, with or without the
    /// `candidate:` prefix.
    pub fn unmarshal(raw: &str) -> Result<Self> {
        let raw = raw.strip_prefix(CANDIDATE_PREFIX).unwrap_or(raw);
        let split: Vec<&str> = raw.split_whitespace().collect();
        if split.len() < 8 {
            return Err(Error::ErrICECandidateAttributeTooShort(split.len()));
        }

        let foundation = split[0].to_owned();
        let component: u16 = split[1].parse()?;
        let protocol = RTCIceProtocol::from(split[2]);
        if protocol == RTCIceProtocol::Unspecified {
            return Err(Error::ErrICEProtocolUnknown);
        }
        let priority: u32 = split[3].parse()?;
        let address = split[4].to_owned();
        let port: u16 = split[5].parse()?;
        if split[6] != "typ" {
            return Err(Error::Other(format!(
                "expected 'typ' in candidate attribute, got '{}'",
                split[6]
            )));
        }
        let typ = RTCIceCandidateType::from(split[7]);
        if typ == RTCIceCandidateType::Unspecified {
            return Err(Error::ErrICECandidateTypeUnknown);
        }

        let mut candidate = RTCIceCandidate {
            stats_id: String::new(),
            foundation,
            priority,
            address,
            protocol,
            port,
            typ,
            component,
            ..Default::default()
        };

        // extension attributes come in name/value pairs
        for pair in split[8..].chunks(2) {
            let [name, value] = pair else {
                break;
            };
            match *name {
                "raddr" => candidate.related_address = (*value).to_owned(),
                "rport" => candidate.related_port = value.parse()?,
                "tcptype" => candidate.tcp_type = RTCIceTcpCandidateType::from(*value),
                _ => {}
            }
        }

        candidate.stats_id = format!(
            "candidate:{}:{}:{}",
            candidate.address, candidate.port, candidate.typ
        );

        Ok(candidate)
    }

    /// to_json returns an ICECandidateInit
    /// as indicated by <https://w3c.github.io/webrtc-pc/#dom-rtcicecandidate-tojson>
    pub fn to_json(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("{CANDIDATE_PREFIX}{}", self.marshal()),
            sdp_mid: Some(String::new()),
            sdp_mline_index: Some(0u16),
            username_fragment: None,
        }
    }
}

impl fmt::Display for RTCIceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{}{}",
            self.protocol, self.typ, self.address, self.port, self.related_address,
        )
    }
}

/// ICECandidateInit is used to serialize ice candidates
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RTCIceCandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ice_candidate_unmarshal() -> Result<()> {
        let tests = vec![
            (
                "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
                RTCIceCandidate {
                    foundation: "1".to_owned(),
                    component: 1,
                    protocol: RTCIceProtocol::Udp,
                    priority: 2130706431,
                    address: "10.0.0.1".to_owned(),
                    port: 5000,
                    typ: RTCIceCandidateType::Host,
                    ..Default::default()
                },
            ),
            (
                "842163049 1 udp 1677729535 1.2.3.4 61665 typ srflx raddr 192.168.0.2 rport 61665 generation 0",
                RTCIceCandidate {
                    foundation: "842163049".to_owned(),
                    component: 1,
                    protocol: RTCIceProtocol::Udp,
                    priority: 1677729535,
                    address: "1.2.3.4".to_owned(),
                    port: 61665,
                    typ: RTCIceCandidateType::Srflx,
                    related_address: "192.168.0.2".to_owned(),
                    related_port: 61665,
                    ..Default::default()
                },
            ),
            (
                "4 1 tcp 1518280447 10.0.0.1 9 typ host tcptype active",
                RTCIceCandidate {
                    foundation: "4".to_owned(),
                    component: 1,
                    protocol: RTCIceProtocol::Tcp,
                    priority: 1518280447,
                    address: "10.0.0.1".to_owned(),
                    port: 9,
                    typ: RTCIceCandidateType::Host,
                    tcp_type: RTCIceTcpCandidateType::Active,
                    ..Default::default()
                },
            ),
        ];

        for (raw, expected) in tests {
            let actual = RTCIceCandidate::unmarshal(raw)?;
            assert_eq!(expected.foundation, actual.foundation, "{raw}");
            assert_eq!(expected.component, actual.component, "{raw}");
            assert_eq!(expected.protocol, actual.protocol, "{raw}");
            assert_eq!(expected.priority, actual.priority, "{raw}");
            assert_eq!(expected.address, actual.address, "{raw}");
            assert_eq!(expected.port, actual.port, "{raw}");
            assert_eq!(expected.typ, actual.typ, "{raw}");
            assert_eq!(expected.related_address, actual.related_address, "{raw}");
            assert_eq!(expected.related_port, actual.related_port, "{raw}");
            assert_eq!(expected.tcp_type, actual.tcp_type, "{raw}");

            let again = RTCIceCandidate::unmarshal(&actual.marshal())?;
            assert_eq!(actual, again, "{raw}");
        }

        Ok(())
    }

    #[test]
    fn test_ice_candidate_unmarshal_errors() {
        let tests = vec![
            (
                "1 1 udp 2130706431 10.0.0.1",
                Error::ErrICECandidateAttributeTooShort(5),
            ),
            (
                "1 1 sctp 2130706431 10.0.0.1 5000 typ host",
                Error::ErrICEProtocolUnknown,
            ),
            (
                "1 1 udp 2130706431 10.0.0.1 5000 typ bogus",
                Error::ErrICECandidateTypeUnknown,
            ),
        ];

        for (raw, expected) in tests {
            assert_eq!(Err(expected), RTCIceCandidate::unmarshal(raw), "{raw}");
        }
        assert!(RTCIceCandidate::unmarshal("1 x udp 1 10.0.0.1 5000 typ host").is_err());
    }

    #[test]
    fn test_ice_candidate_serialization() {
        let tests = vec![
            (
                RTCIceCandidateInit {
                    candidate: "candidate:abc123".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: Some("def".to_string()),
                },
                r#"{"candidate":"candidate:abc123","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"def"}"#,
            ),
            (
                RTCIceCandidateInit {
                    candidate: "candidate:abc123".to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                },
                r#"{"candidate":"candidate:abc123","sdpMid":null,"sdpMLineIndex":null,"usernameFragment":null}"#,
            ),
        ];

        for (candidate_init, expected_string) in tests {
            let candidate_data = serde_json::to_string(&candidate_init).unwrap();
            assert_eq!(expected_string, candidate_data);

            let actual: RTCIceCandidateInit = serde_json::from_str(&candidate_data).unwrap();
            assert_eq!(candidate_init, actual);
        }
    }
}
