#![allow(dead_code)]

use std::io;
use std::num::ParseIntError;
use std::string::FromUtf8Error;
use std::time::SystemTimeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    //RTC
    /// ErrConnectionClosed indicates an operation executed after connection
    /// has already been closed.
    #[error("connection closed")]
    ErrConnectionClosed,

    /// ErrNoAsyncRuntime indicates a PeerConnection was created outside a
    /// tokio runtime, which its event dispatcher needs.
    #[error("peer connection must be created within a tokio runtime")]
    ErrNoAsyncRuntime,

    /// ErrCertificateExpired indicates that an x509 certificate has expired.
    #[error("x509Cert expired")]
    ErrCertificateExpired,

    /// ErrNoTurnCredentials indicates that a TURN server URL was provided
    /// without required credentials.
    #[error("turn server credentials required")]
    ErrNoTurnCredentials,

    /// ErrPrivateKeyType indicates that a particular private key encryption
    /// chosen to generate a certificate is not supported.
    #[error("private key type not supported")]
    ErrPrivateKeyType,

    /// ErrModifyingPeerIdentity indicates that an attempt to modify
    /// PeerIdentity was made after PeerConnection has been initialized.
    #[error("peerIdentity cannot be modified")]
    ErrModifyingPeerIdentity,

    /// ErrModifyingCertificates indicates that an attempt to modify
    /// Certificates was made after PeerConnection has been initialized.
    #[error("certificates cannot be modified")]
    ErrModifyingCertificates,

    /// ErrNonCertificate indicates that there is no certificate
    #[error("no certificate")]
    ErrNonCertificate,

    /// ErrModifyingBundlePolicy indicates that an attempt to modify
    /// BundlePolicy was made after PeerConnection has been initialized.
    #[error("bundle policy cannot be modified")]
    ErrModifyingBundlePolicy,

    /// ErrModifyingRTCPMuxPolicy indicates that an attempt to modify
    /// RTCPMuxPolicy was made after PeerConnection has been initialized.
    #[error("rtcp mux policy cannot be modified")]
    ErrModifyingRTCPMuxPolicy,

    /// ErrModifyingICECandidatePoolSize indicates that an attempt to modify
    /// ICECandidatePoolSize was made after PeerConnection has been initialized.
    #[error("ice candidate pool size cannot be modified")]
    ErrModifyingICECandidatePoolSize,

    /// ErrStringSizeLimit indicates that the character size limit of string is
    /// exceeded. The limit is hardcoded to 65535 according to specifications.
    #[error("data channel label exceeds size limit")]
    ErrStringSizeLimit,

    /// ErrNegotiatedWithoutID indicates that an attempt to create a data channel
    /// was made while setting the negotiated option to true without providing
    /// the negotiated channel ID.
    #[error("negotiated set without channel id")]
    ErrNegotiatedWithoutID,

    /// ErrRetransmitsOrPacketLifeTime indicates that an attempt to create a data
    /// channel was made with both options max_packet_life_time and max_retransmits
    /// set together.
    #[error("both max_packet_life_time and max_retransmits was set")]
    ErrRetransmitsOrPacketLifeTime,

    /// ErrCodecNotFound is returned when a codec search to the Media Engine fails
    #[error("codec not found")]
    ErrCodecNotFound,

    /// ErrNoRemoteDescription indicates that an operation was rejected because
    /// the remote description is not set
    #[error("remote description is not set")]
    ErrNoRemoteDescription,

    /// ErrIncorrectSDPSemantics indicates that the PeerConnection was configured to
    /// generate SDP Answers with different SDP Semantics than the received Offer
    #[error("offer SDP semantics does not match configuration")]
    ErrIncorrectSDPSemantics,

    /// ErrIncorrectSignalingState indicates that the signaling state of PeerConnection is not correct
    #[error("operation can not be run in current signaling state")]
    ErrIncorrectSignalingState,

    /// ErrProtocolTooLarge indicates that value given for a DataChannelInit protocol is
    /// longer then 65535 bytes
    #[error("protocol is larger then 65535 bytes")]
    ErrProtocolTooLarge,

    /// ErrSenderNotCreatedByConnection indicates remove_track was called with a RtpSender not created
    /// by this PeerConnection
    #[error("RtpSender not created by this PeerConnection")]
    ErrSenderNotCreatedByConnection,

    /// ErrSessionDescriptionNoFingerprint indicates set_remote_description was called with a SessionDescription that has no
    /// fingerprint
    #[error("set_remote_description called with no fingerprint")]
    ErrSessionDescriptionNoFingerprint,

    /// ErrSessionDescriptionInvalidFingerprint indicates set_remote_description was called with a SessionDescription that
    /// has an invalid fingerprint
    #[error("set_remote_description called with an invalid fingerprint")]
    ErrSessionDescriptionInvalidFingerprint,

    /// ErrSessionDescriptionConflictingFingerprints indicates set_remote_description was called with a SessionDescription that
    /// has an conflicting fingerprints
    #[error("set_remote_description called with multiple conflicting fingerprint")]
    ErrSessionDescriptionConflictingFingerprints,

    /// ErrSessionDescriptionMissingIceUfrag indicates set_remote_description was called with a SessionDescription that
    /// is missing an ice-ufrag value
    #[error("set_remote_description called with no ice-ufrag")]
    ErrSessionDescriptionMissingIceUfrag,

    /// ErrSessionDescriptionMissingIcePwd indicates set_remote_description was called with a SessionDescription that
    /// is missing an ice-pwd value
    #[error("set_remote_description called with no ice-pwd")]
    ErrSessionDescriptionMissingIcePwd,

    /// ErrSessionDescriptionConflictingIceUfrag indicates set_remote_description was called with a SessionDescription that
    /// contains multiple conflicting ice-ufrag values
    #[error("set_remote_description called with multiple conflicting ice-ufrag values")]
    ErrSessionDescriptionConflictingIceUfrag,

    /// ErrSessionDescriptionConflictingIcePwd indicates set_remote_description was called with a SessionDescription that
    /// contains multiple conflicting ice-pwd values
    #[error("set_remote_description called with multiple conflicting ice-pwd values")]
    ErrSessionDescriptionConflictingIcePwd,

    /// ErrNoCodecsAvailable indicates that operation isn't possible because the MediaEngine has no codecs available
    #[error("operation failed no codecs are available")]
    ErrNoCodecsAvailable,

    /// ErrUnsupportedCodec indicates the remote peer doesn't support the requested codec
    #[error("unable to start track, codec is not supported by remote")]
    ErrUnsupportedCodec,

    /// ErrRTPSenderNewTrackHasIncorrectKind indicates that the new track is of a different kind than the previous/original
    #[error("new track must be of the same kind as previous")]
    ErrRTPSenderNewTrackHasIncorrectKind,

    /// ErrUnbindFailed indicates that a TrackLocal was not able to be unbind
    #[error("failed to unbind TrackLocal from PeerConnection")]
    ErrUnbindFailed,

    /// ErrRegisterHeaderExtensionInvalidDirection indicates that a extension was registered with different
    /// directions for two different calls.
    #[error("a header extension must be registered with the same direction each time")]
    ErrRegisterHeaderExtensionInvalidDirection,

    /// ErrRegisterHeaderExtensionNoFreeID indicates that there was no extension ID available which
    /// in turn means that all 15 available id(1 through 14) have been used.
    #[error(
        "no header extension ID was free to use(this means the maximum of 15 extensions have been registered)"
    )]
    ErrRegisterHeaderExtensionNoFreeID,

    /// ErrSimulcastProbeOverflow indicates that too many Simulcast probe streams are in flight and the requested SSRC was ignored
    #[error("simulcast probe limit has been reached, new SSRC has been discarded")]
    ErrSimulcastProbeOverflow,

    #[error("attempted to start DTLSTransport that is not in new state")]
    ErrInvalidDTLSStart,
    #[error("peer didn't provide certificate via DTLS")]
    ErrNoRemoteCertificate,
    #[error("identity provider is not implemented")]
    ErrIdentityProviderNotImplemented,
    #[error("remote certificate does not match any fingerprint")]
    ErrNoMatchingCertificateFingerprint,
    #[error("unsupported fingerprint algorithm")]
    ErrUnsupportedFingerprintAlgorithm,
    #[error("ICE connection not started")]
    ErrICEConnectionNotStarted,
    #[error("unknown candidate type")]
    ErrICECandidateTypeUnknown,
    #[error("ICEAgent does not exist")]
    ErrICEAgentNotExist,
    #[error("unknown ICE Role")]
    ErrICERoleUnknown,
    #[error("unknown protocol")]
    ErrICEProtocolUnknown,
    #[error("attribute not long enough to be ICE candidate ({0})")]
    ErrICECandidateAttributeTooShort(usize),
    #[error("new sdp does not match previous offer")]
    ErrSDPDoesNotMatchOffer,
    #[error("new sdp does not match previous answer")]
    ErrSDPDoesNotMatchAnswer,
    #[error("provided value is not a valid enum value of type SDPType")]
    ErrPeerConnSDPTypeInvalidValue,
    #[error("invalid SDP type supplied to SetLocalDescription()")]
    ErrPeerConnSDPTypeInvalidValueSetLocalDescription,
    #[error("remoteDescription contained media section without mid value")]
    ErrPeerConnRemoteDescriptionWithoutMidValue,
    #[error("remoteDescription has not been set yet")]
    ErrPeerConnRemoteDescriptionNil,
    #[error("single media section has an explicit SSRC")]
    ErrPeerConnSingleMediaSectionHasExplicitSSRC,
    #[error("could not add transceiver for remote SSRC")]
    ErrPeerConnRemoteSSRCAddTransceiver,
    #[error("mid RTP Extensions required for Simulcast")]
    ErrPeerConnSimulcastMidRTPExtensionRequired,
    #[error("stream id RTP Extensions required for Simulcast")]
    ErrPeerConnSimulcastStreamIDRTPExtensionRequired,
    #[error("incoming SSRC failed Simulcast probing")]
    ErrPeerConnSimulcastIncomingSSRCFailed,
    #[error("negotiated header extension id {0} does not fit an RTP header")]
    ErrHeaderExtensionIdOutOfRange(u16),
    #[error("add_transceiver_from_kind currently only supports recvonly")]
    ErrPeerConnAddTransceiverFromKindSupport,
    #[error("add_transceiver_from_track currently only supports sendonly and sendrecv")]
    ErrPeerConnAddTransceiverFromTrackSupport,
    #[error("cannot find transceiver with mid")]
    ErrPeerConnTransceiverMidNil,
    #[error("Receive has already been called")]
    ErrRTPReceiverReceiveAlreadyCalled,
    #[error("no trackStreams found for RID")]
    ErrRTPReceiverForRIDTrackStreamNotFound,
    #[error("Track must not be nil")]
    ErrRTPSenderTrackNil,
    #[error("transceiver has no sender")]
    ErrRTPSenderNotExisted,
    #[error("Send has already been called")]
    ErrRTPSenderSendAlreadyCalled,
    #[error("cannot change transceiver mid once it is set")]
    ErrRTPTransceiverCannotChangeMid,
    #[error("invalid state change in RTCRtpTransceiver.set_sending")]
    ErrRTPTransceiverSetSendingInvalidState,
    #[error("unsupported codec type by this transceiver")]
    ErrRTPTransceiverCodecUnsupported,
    #[error("DTLS not established")]
    ErrSCTPTransportDTLS,
    #[error("add_transceiver_sdp() called with 0 transceivers")]
    ErrSDPZeroTransceivers,
    #[error("invalid Media Section. Media + DataChannel both enabled")]
    ErrSDPMediaSectionMediaDataChanInvalid,
    #[error("invalid Media Section. Can not have multiple tracks in one MediaSection in UnifiedPlan")]
    ErrSDPMediaSectionMultipleTrackInvalid,
    #[error("set_answering_dtlsrole must DTLSRoleClient or DTLSRoleServer")]
    ErrSettingEngineSetAnsweringDTLSRole,
    #[error("can't rollback from stable state")]
    ErrSignalingStateCannotRollback,
    #[error("invalid proposed signaling state transition: {0}")]
    ErrSignalingStateProposedTransitionInvalid(String),
    #[error("ICETransport can only be called in ICETransportStateNew")]
    ErrICETransportNotInNew,
    #[error("SCTP is not established")]
    ErrSCTPNotEstablished,
    #[error("DataChannel is not opened")]
    ErrClosedPipe,
    #[error("Max Data Channel ID")]
    ErrMaxDataChannelID,
    #[error("excessive retries in CreateOffer")]
    ErrExcessiveRetries,
    #[error("{0} engine is not set in SettingEngine")]
    ErrTransportEngineNotSet(String),
    #[error("conn is closed")]
    ErrConnClosed,
    #[error("operation canceled by caller")]
    ErrCanceledByCaller,
    #[error("unknown type")]
    ErrUnknownType,
    #[error("DataChannel is not opened")]
    ErrDataChannelNotOpen,
    #[error("outbound packet larger than maximum message size")]
    ErrOutboundPacketTooLarge,
    #[error("DTLS handshake failed: {0}")]
    ErrDtlsHandshake(String),

    //RTP
    #[error("not long enough to be a RTP Packet")]
    ErrRTPTooShort,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("buffer too small")]
    ErrBufferTooSmall,

    //Third Party Error
    #[error("mutex poison: {0}")]
    PoisonError(String),
    #[error("{0}")]
    RcGen(#[from] rcgen::Error),
    #[error("{0}")]
    Sdp(#[from] sdp::Error),
    #[error("{0}")]
    Rtp(#[from] rtp::Error),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("url parse: {0}")]
    Url(#[from] url::ParseError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Std(#[source] StdError),

    //Other Errors
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], mirroring the DOMException names
/// an application is expected to branch on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    InvalidModification,
    Type,
    Operation,
    NotFound,
    ResourceExhausted,
    Unsupported,
    Other,
}

impl Error {
    pub fn from_std<T>(error: T) -> Self
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        Error::Std(StdError(Box::new(error)))
    }

    pub fn downcast_ref<T: std::error::Error + 'static>(&self) -> Option<&T> {
        if let Error::Std(s) = self {
            return s.0.downcast_ref();
        }

        None
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ErrConnectionClosed
            | Error::ErrClosedPipe
            | Error::ErrIncorrectSignalingState
            | Error::ErrSignalingStateCannotRollback
            | Error::ErrICETransportNotInNew
            | Error::ErrInvalidDTLSStart
            | Error::ErrSCTPNotEstablished
            | Error::ErrICEConnectionNotStarted
            | Error::ErrRTPReceiverReceiveAlreadyCalled
            | Error::ErrRTPSenderSendAlreadyCalled
            | Error::ErrRTPTransceiverSetSendingInvalidState => ErrorKind::InvalidState,

            Error::ErrModifyingPeerIdentity
            | Error::ErrModifyingCertificates
            | Error::ErrModifyingBundlePolicy
            | Error::ErrModifyingRTCPMuxPolicy
            | Error::ErrModifyingICECandidatePoolSize
            | Error::ErrRTPTransceiverCannotChangeMid
            | Error::ErrSDPDoesNotMatchOffer
            | Error::ErrSDPDoesNotMatchAnswer => ErrorKind::InvalidModification,

            Error::ErrStringSizeLimit
            | Error::ErrProtocolTooLarge
            | Error::ErrNegotiatedWithoutID
            | Error::ErrRetransmitsOrPacketLifeTime
            | Error::ErrPeerConnSDPTypeInvalidValue
            | Error::ErrPeerConnSDPTypeInvalidValueSetLocalDescription
            | Error::ErrRTPSenderNewTrackHasIncorrectKind
            | Error::ErrCertificateExpired
            | Error::ErrNoTurnCredentials
            | Error::Sdp(_) => ErrorKind::Type,

            Error::ErrSignalingStateProposedTransitionInvalid(_)
            | Error::ErrIncorrectSDPSemantics
            | Error::ErrNoMatchingCertificateFingerprint
            | Error::ErrPeerConnSimulcastIncomingSSRCFailed => ErrorKind::Operation,

            Error::ErrNoRemoteDescription
            | Error::ErrPeerConnRemoteDescriptionNil
            | Error::ErrSenderNotCreatedByConnection
            | Error::ErrCodecNotFound
            | Error::ErrPeerConnTransceiverMidNil
            | Error::ErrRTPSenderNotExisted
            | Error::ErrICEAgentNotExist => ErrorKind::NotFound,

            Error::ErrExcessiveRetries
            | Error::ErrSimulcastProbeOverflow
            | Error::ErrMaxDataChannelID
            | Error::ErrRegisterHeaderExtensionNoFreeID => ErrorKind::ResourceExhausted,

            Error::ErrIdentityProviderNotImplemented
            | Error::ErrUnsupportedFingerprintAlgorithm
            | Error::ErrPeerConnAddTransceiverFromKindSupport
            | Error::ErrPeerConnAddTransceiverFromTrackSupport
            | Error::ErrUnsupportedCodec
            | Error::ErrRTPTransceiverCodecUnsupported => ErrorKind::Unsupported,

            _ => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

/// An escape hatch to preserve stack traces when we don't know the error.
///
/// Collaborator engines (ICE agents, DTLS stacks, SCTP associations) produce
/// their own error types. `Error::from_std` keeps the underlying error so it
/// can be recovered with `downcast_ref`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StdError(pub Box<dyn std::error::Error + Send + Sync>);

impl PartialEq for StdError {
    fn eq(&self, _: &Self) -> bool {
        false
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::PoisonError(e.to_string())
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(ErrorKind::InvalidState, Error::ErrConnectionClosed.kind());
        assert_eq!(
            ErrorKind::InvalidModification,
            Error::ErrModifyingBundlePolicy.kind()
        );
        assert_eq!(ErrorKind::Type, Error::ErrProtocolTooLarge.kind());
        assert_eq!(ErrorKind::NotFound, Error::ErrNoRemoteDescription.kind());
        assert_eq!(ErrorKind::ResourceExhausted, Error::ErrExcessiveRetries.kind());
        assert_eq!(
            ErrorKind::Unsupported,
            Error::ErrIdentityProviderNotImplemented.kind()
        );
        assert_eq!(
            ErrorKind::Operation,
            Error::ErrSignalingStateProposedTransitionInvalid("x".to_owned()).kind()
        );
    }

    #[test]
    fn test_flatten_errs() {
        assert!(flatten_errs(Vec::<Error>::new()).is_ok());

        let err = flatten_errs(vec![Error::ErrConnectionClosed, Error::ErrClosedPipe]);
        assert_eq!(
            Err(Error::Other(
                "connection closed\nDataChannel is not opened".to_owned()
            )),
            err
        );
    }

    #[test]
    fn test_io_error_eq_by_kind() {
        let a: Error = io::Error::new(io::ErrorKind::BrokenPipe, "a").into();
        let b: Error = io::Error::new(io::ErrorKind::BrokenPipe, "b").into();
        assert_eq!(a, b);
    }
}
