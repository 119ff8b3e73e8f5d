//! Media engine capabilities consumed by the relay
//!
//! The relay never speaks ICE, DTLS, SRTP or SDP itself. Everything it needs
//! from a media engine is expressed by the traits in this module:
//!
//! - [`Connection`]: one peer connection, with its track and sender types
//! - [`ConnectionObserver`]: the callbacks a connection delivers
//! - [`RemoteTrack`] / [`LocalTrack`]: blocking packet read and write
//! - [`RtpSender`]: outbound sender of a local track, source of RTCP feedback
//! - [`DataChannel`] / [`DataChannelObserver`]: auxiliary text transport
//!
//! [`webrtc`] binds them to webrtc-rs. `memory` is an in-process engine for
//! tests.

use async_trait::async_trait;
use std::sync::{Arc, Weak};

use crate::error::{EngineError, ReadError, WriteError};
use crate::types::{
    ConnectionState, DataChannelFrame, IceCandidate, IceConnectionState, IceGatheringState,
    RtcpFeedback, SessionDescription, SignalingState, TrackInfo,
};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod webrtc;

/// Inbound track received from a publishing participant
#[async_trait]
pub trait RemoteTrack: Send + Sync + 'static {
    fn info(&self) -> TrackInfo;

    fn ssrc(&self) -> u32;

    /// Read one raw RTP packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError>;
}

/// Server-side track written by the relay and read by attached senders
#[async_trait]
pub trait LocalTrack: Send + Sync + 'static {
    fn info(&self) -> TrackInfo;

    /// Write one raw RTP packet.
    ///
    /// Returns [`WriteError::NoConsumer`] when no sender is attached.
    async fn write(&self, packet: &[u8]) -> Result<usize, WriteError>;
}

/// Outbound sender registered on a connection
#[async_trait]
pub trait RtpSender: Send + Sync + 'static {
    /// Wait for the next RTCP compound packet and return the feedback the
    /// relay understands (other RTCP is filtered out)
    async fn read_rtcp(&self) -> Result<Vec<RtcpFeedback>, ReadError>;
}

/// Auxiliary message channel attached to a connection
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> String;

    async fn send_text(&self, text: String) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    /// Register the handlers of this channel
    fn observe(&self, observer: Arc<dyn DataChannelObserver>);
}

/// Handlers of a data channel
pub trait DataChannelObserver: Send + Sync {
    fn on_open(&self);
    fn on_message(&self, frame: DataChannelFrame);
    fn on_error(&self, error: EngineError);
    fn on_close(&self);
}

/// Callbacks of a connection.
///
/// Engines invoke them from their own tasks; different callbacks for the
/// same connection may run concurrently.
#[async_trait]
pub trait ConnectionObserver<C: Connection + ?Sized>: Send + Sync {
    /// `None` signals the end of candidate gathering
    async fn on_ice_candidate(&self, candidate: Option<IceCandidate>);
    async fn on_negotiation_needed(&self);
    async fn on_ice_connection_state_change(&self, state: IceConnectionState);
    async fn on_ice_gathering_state_change(&self, state: IceGatheringState);
    async fn on_signaling_state_change(&self, state: SignalingState);
    async fn on_connection_state_change(&self, state: ConnectionState);
    async fn on_track(&self, track: Arc<C::RemoteTrack>);
    async fn on_data_channel(&self, channel: Arc<C::DataChannel>);
}

/// One peer connection of the media engine
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    type RemoteTrack: RemoteTrack;
    type LocalTrack: LocalTrack;
    type Sender: RtpSender;
    type DataChannel: DataChannel;

    fn connection_state(&self) -> ConnectionState;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Create a local track with the given codec capability, track ID and
    /// stream ID
    fn new_local_track(&self, info: &TrackInfo) -> Result<Arc<Self::LocalTrack>, EngineError>;

    async fn add_track(
        &self,
        track: Arc<Self::LocalTrack>,
    ) -> Result<Arc<Self::Sender>, EngineError>;
    async fn remove_track(&self, sender: &Arc<Self::Sender>) -> Result<(), EngineError>;

    /// Send RTCP feedback about the inbound stream `media_ssrc`
    async fn write_rtcp(&self, feedback: RtcpFeedback, media_ssrc: u32) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    /// Route every callback of this connection to `observer`.
    ///
    /// The engine holds the observer weakly; callbacks arriving after it is
    /// dropped are discarded.
    fn observe(&self, observer: Weak<dyn ConnectionObserver<Self>>);
}
