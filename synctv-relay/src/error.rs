use thiserror::Error;

use crate::types::TrackId;

/// Failure reported by the media engine.
///
/// Engines have their own error types; the relay only needs the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        Self(err.to_string())
    }
}

/// Failure reading media from a remote track or an RTP sender
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The remote side finished sending; no more data will arrive
    #[error("end of stream")]
    EndOfStream,

    #[error("read failed: {0}")]
    Failed(#[source] EngineError),
}

/// Failure writing media to a relay track
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The track has no attached consumer; the packet was dropped
    #[error("no active consumer")]
    NoConsumer,

    #[error("write failed: {0}")]
    Failed(#[source] EngineError),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to create offer: {0}")]
    CreateOffer(#[source] EngineError),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(#[source] EngineError),

    #[error("Failed to set local description: {0}")]
    SetLocalDescription(#[source] EngineError),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescription(#[source] EngineError),

    #[error("Failed to add ICE candidate: {0}")]
    AddIceCandidate(#[source] EngineError),

    #[error("Failed to create local track: {0}")]
    TrackCreation(#[source] EngineError),

    #[error("Failed to add track to peer connection: {0}")]
    AddTrack(#[source] EngineError),

    #[error("Failed to remove track: {0}")]
    RemoveTrack(#[source] EngineError),

    #[error("Failed to write RTCP: {0}")]
    WriteRtcp(#[source] EngineError),

    #[error("Data channel not available")]
    DataChannelNotAvailable,

    #[error("Failed to send over data channel: {0}")]
    DataChannelSend(#[source] EngineError),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Failed to close peer connection: {0}")]
    Close(#[source] EngineError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_source_chain() {
        let err = Error::AddTrack(EngineError::new("transceiver stopped"));
        assert_eq!(
            err.to_string(),
            "Failed to add track to peer connection: transceiver stopped"
        );
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("transceiver stopped"));
    }

    #[test]
    fn test_no_consumer_is_distinct() {
        let err = WriteError::NoConsumer;
        assert_eq!(err, WriteError::NoConsumer);
        assert_ne!(err, WriteError::Failed(EngineError::new("no active consumer")));
    }

    #[test]
    fn test_engine_error_from_webrtc() {
        let err = EngineError::from(webrtc::Error::ErrClosedPipe);
        assert!(!err.message().is_empty());
    }
}
