use serde::{Deserialize, Serialize};

use shared::error::{Error, Result};

use crate::data_channel::init::RTCDataChannelInit;
use crate::peer_connection::transport::sctp::engine::DataChannelConfig;

/// Labels and protocols are carried in 16 bit length fields.
const MAX_STRING_SIZE: usize = 65535;

/// Internal parameters describing the configuration of a DataChannel.
///
/// This structure captures the essential parameters needed to establish and
/// configure a data channel, including reliability settings and negotiation details.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DataChannelParameters {
    /// The label that can be used to distinguish this DataChannel from others.
    pub(crate) label: String,

    /// The name of the sub-protocol in use.
    pub(crate) protocol: String,

    /// Whether the data channel guarantees in-order delivery of messages.
    pub(crate) ordered: bool,

    /// The maximum time in milliseconds during which transmissions and
    /// retransmissions may occur in unreliable mode.
    pub(crate) max_packet_life_time: Option<u16>,

    /// The maximum number of retransmission attempts in unreliable mode.
    pub(crate) max_retransmits: Option<u16>,

    /// The data channel ID if this channel was negotiated by the application.
    /// None if the channel was not pre-negotiated.
    pub(crate) negotiated: Option<u16>,
}

impl DataChannelParameters {
    /// new validates the options given to create_data_channel, following
    /// <https://w3c.github.io/webrtc-pc/#dom-peerconnection-createdatachannel>
    pub(crate) fn new(label: &str, options: Option<RTCDataChannelInit>) -> Result<Self> {
        let options = options.unwrap_or_default();

        if label.len() > MAX_STRING_SIZE {
            return Err(Error::ErrStringSizeLimit);
        }

        let protocol = options.protocol.unwrap_or_default();
        if protocol.len() > MAX_STRING_SIZE {
            return Err(Error::ErrProtocolTooLarge);
        }

        if options.max_packet_life_time.is_some() && options.max_retransmits.is_some() {
            return Err(Error::ErrRetransmitsOrPacketLifeTime);
        }

        Ok(DataChannelParameters {
            label: label.to_owned(),
            protocol,
            ordered: options.ordered.unwrap_or(true),
            max_packet_life_time: options.max_packet_life_time,
            max_retransmits: options.max_retransmits,
            negotiated: options.negotiated,
        })
    }

    pub(crate) fn to_config(&self) -> DataChannelConfig {
        DataChannelConfig {
            label: self.label.clone(),
            protocol: self.protocol.clone(),
            ordered: self.ordered,
            max_packet_life_time: self.max_packet_life_time,
            max_retransmits: self.max_retransmits,
            negotiated: self.negotiated.is_some(),
        }
    }
}

impl From<DataChannelConfig> for DataChannelParameters {
    fn from(config: DataChannelConfig) -> Self {
        DataChannelParameters {
            label: config.label,
            protocol: config.protocol,
            ordered: config.ordered,
            max_packet_life_time: config.max_packet_life_time,
            max_retransmits: config.max_retransmits,
            negotiated: None,
        }
    }
}
