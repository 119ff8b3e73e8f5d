//! Events a peer reports to the call orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Connection;
use crate::publisher::Publisher;
use crate::types::{IceCandidate, RtcpFeedback, SessionDescription, TrackId};

/// Reason attached to [`Event::LeftTheCall`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    IceFailed,
    InviteTimeout,
    UserHangup,
    UserMediaFailed,
    UnknownError,
}

/// Something that happened on a peer.
///
/// Each event is produced once per trigger and never mutated afterwards.
pub enum Event<C: Connection> {
    JoinedTheCall,
    LeftTheCall {
        reason: HangupReason,
    },
    /// A remote track was received and its relay track is ready for
    /// subscribers
    NewTrackPublished {
        track: Arc<Publisher<C>>,
    },
    /// The forwarding loop of a published track ended; emitted exactly once
    /// per publisher
    PublishedTrackFailed {
        track: Arc<Publisher<C>>,
    },
    NewIceCandidate {
        candidate: IceCandidate,
    },
    IceGatheringComplete,
    /// A local offer was created and applied; it must reach the remote side
    RenegotiationRequired {
        offer: SessionDescription,
    },
    DataChannelMessage {
        text: String,
    },
    DataChannelAvailable,
    /// A subscriber asked for a key frame of the track it receives
    RtcpReceived {
        track_id: TrackId,
        packets: Vec<RtcpFeedback>,
    },
}

/// Discriminant of [`Event`], without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JoinedTheCall,
    LeftTheCall,
    NewTrackPublished,
    PublishedTrackFailed,
    NewIceCandidate,
    IceGatheringComplete,
    RenegotiationRequired,
    DataChannelMessage,
    DataChannelAvailable,
    RtcpReceived,
}

impl EventKind {
    pub const ALL: [Self; 10] = [
        Self::JoinedTheCall,
        Self::LeftTheCall,
        Self::NewTrackPublished,
        Self::PublishedTrackFailed,
        Self::NewIceCandidate,
        Self::IceGatheringComplete,
        Self::RenegotiationRequired,
        Self::DataChannelMessage,
        Self::DataChannelAvailable,
        Self::RtcpReceived,
    ];
}

impl<C: Connection> Event<C> {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::JoinedTheCall => EventKind::JoinedTheCall,
            Self::LeftTheCall { .. } => EventKind::LeftTheCall,
            Self::NewTrackPublished { .. } => EventKind::NewTrackPublished,
            Self::PublishedTrackFailed { .. } => EventKind::PublishedTrackFailed,
            Self::NewIceCandidate { .. } => EventKind::NewIceCandidate,
            Self::IceGatheringComplete => EventKind::IceGatheringComplete,
            Self::RenegotiationRequired { .. } => EventKind::RenegotiationRequired,
            Self::DataChannelMessage { .. } => EventKind::DataChannelMessage,
            Self::DataChannelAvailable => EventKind::DataChannelAvailable,
            Self::RtcpReceived { .. } => EventKind::RtcpReceived,
        }
    }
}

impl<C: Connection> fmt::Debug for Event<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JoinedTheCall => f.write_str("JoinedTheCall"),
            Self::LeftTheCall { reason } => {
                f.debug_struct("LeftTheCall").field("reason", reason).finish()
            }
            Self::NewTrackPublished { track } => f
                .debug_struct("NewTrackPublished")
                .field("track_id", &track.track_id())
                .finish(),
            Self::PublishedTrackFailed { track } => f
                .debug_struct("PublishedTrackFailed")
                .field("track_id", &track.track_id())
                .finish(),
            Self::NewIceCandidate { candidate } => f
                .debug_struct("NewIceCandidate")
                .field("candidate", &candidate.candidate)
                .finish(),
            Self::IceGatheringComplete => f.write_str("IceGatheringComplete"),
            Self::RenegotiationRequired { offer } => f
                .debug_struct("RenegotiationRequired")
                .field("sdp_len", &offer.sdp.len())
                .finish(),
            Self::DataChannelMessage { text } => f
                .debug_struct("DataChannelMessage")
                .field("len", &text.len())
                .finish(),
            Self::DataChannelAvailable => f.write_str("DataChannelAvailable"),
            Self::RtcpReceived { track_id, packets } => f
                .debug_struct("RtcpReceived")
                .field("track_id", track_id)
                .field("packets", packets)
                .finish(),
        }
    }
}

/// Destination of the events of one peer.
///
/// Delivery is fire-and-forget; implementations must not block.
pub trait EventSink<C: Connection>: Send + Sync {
    fn send(&self, event: Event<C>);
}

/// An event stamped with the identity of the peer that produced it
pub struct PeerMessage<Id, C: Connection> {
    pub sender: Id,
    pub event: Event<C>,
}

impl<Id: fmt::Debug, C: Connection> fmt::Debug for PeerMessage<Id, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMessage")
            .field("sender", &self.sender)
            .field("event", &self.event)
            .finish()
    }
}

/// Sink forwarding events into an unbounded channel shared by every peer of
/// a call
pub struct ChannelSink<Id, C: Connection> {
    sender: Id,
    tx: mpsc::UnboundedSender<PeerMessage<Id, C>>,
}

impl<Id, C: Connection> ChannelSink<Id, C> {
    pub const fn new(sender: Id, tx: mpsc::UnboundedSender<PeerMessage<Id, C>>) -> Self {
        Self { sender, tx }
    }
}

impl<Id, C> EventSink<C> for ChannelSink<Id, C>
where
    Id: Clone + fmt::Display + Send + Sync,
    C: Connection,
{
    fn send(&self, event: Event<C>) {
        let kind = event.kind();
        let message = PeerMessage {
            sender: self.sender.clone(),
            event,
        };
        if self.tx.send(message).is_err() {
            debug!(
                peer_id = %self.sender,
                event = ?kind,
                "Event receiver dropped, discarding event"
            );
        }
    }
}
