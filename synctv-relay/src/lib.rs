//! `SyncTV` group-call media relay
//!
//! Media-relay core of the group-call SFU. Every participant has one peer
//! connection to the relay; tracks a participant publishes are read off that
//! connection and written to relay tracks that other participants subscribe
//! to.
//!
//! ## Architecture
//!
//! - **`Peer`**: one participant's connection, turning engine callbacks into
//!   [`Event`]s
//! - **`Publisher`**: an inbound track and the task forwarding it to its relay
//!   track
//! - **`Subscriber`**: attaches a publisher's relay track to another
//!   participant's connection
//! - **`engine`**: the media-engine capabilities the relay consumes, bound to
//!   webrtc-rs
//!
//! Which participant subscribes to what is decided by the caller, from the
//! events each peer reports.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_relay::{engine::webrtc::WebRtcEngine, Event, Peer, PeerId, RelayConfig};
//!
//! let config = RelayConfig::from_env()?;
//! let engine = WebRtcEngine::new(&config.webrtc)?;
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let alice = engine.new_connection().await?;
//! let alice = Peer::with_channel(PeerId::from("alice"), alice, tx.clone(), &config);
//! let bob = engine.new_connection().await?;
//! let bob = Peer::with_channel(PeerId::from("bob"), bob, tx, &config);
//!
//! while let Some(message) = rx.recv().await {
//!     if let Event::NewTrackPublished { track } = message.event {
//!         bob.new_subscriber().subscribe(&track).await?;
//!     }
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod logging;
pub mod peer;
pub mod publisher;
pub mod subscriber;
pub mod types;

pub use config::{LoggingConfig, RelayConfig, WebRtcConfig};
pub use error::{EngineError, Error, ReadError, Result, WriteError};
pub use event::{ChannelSink, Event, EventKind, EventSink, HangupReason, PeerMessage};
pub use peer::{Peer, PeerIdentity};
pub use publisher::{ForwardingState, ForwardingStats, Publisher};
pub use subscriber::Subscriber;
pub use types::{
    CodecCapability, ConnectionState, IceCandidate, PeerId, RtcpFeedback, SdpType,
    SessionDescription, SubscriberId, TrackId, TrackInfo, TrackKind,
};
