//! Published tracks and their forwarding loop
//!
//! A [`Publisher`] owns the relay track derived from one remote track and a
//! single task copying packets from the remote track into it:
//! - Idle → Forwarding when the task starts
//! - Forwarding → Terminated on read failure (including end of stream), on a
//!   write failure other than "no consumer", or on [`Publisher::stop`]
//!
//! Subscribers' senders all read the one relay track, so the hot path never
//! touches the subscriber set.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Connection, LocalTrack, RemoteTrack};
use crate::error::{Error, ReadError, Result, WriteError};
use crate::event::{Event, EventSink};
use crate::subscriber::Subscriber;
use crate::types::{RtcpFeedback, SubscriberId, TrackId, TrackInfo, TrackKind};

/// Live publishers of one peer, keyed by track ID
pub(crate) type PublisherRegistry<C> = DashMap<TrackId, Arc<Publisher<C>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardingState {
    Idle,
    Forwarding,
    Terminated,
}

/// Internal forwarding statistics with atomic counters
#[derive(Default)]
struct ForwardingStatsInner {
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
}

/// Forwarding statistics of one publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingStats {
    pub track_id: String,
    pub kind: TrackKind,
    pub state: ForwardingState,
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
    /// Packets written while no subscriber was attached
    pub packets_dropped: u64,
    pub subscribers: usize,
    pub published_at: DateTime<Utc>,
}

pub struct Publisher<C: Connection> {
    /// Display form of the publishing peer's identity, for logs
    owner: String,
    info: TrackInfo,
    ssrc: u32,
    relay: Arc<C::LocalTrack>,
    /// Connection the remote track arrives on; RTCP goes back through it
    connection: Arc<C>,
    subscribers: DashMap<SubscriberId, Arc<Subscriber<C>>>,
    state: RwLock<ForwardingState>,
    cancel: CancellationToken,
    stats: ForwardingStatsInner,
    published_at: DateTime<Utc>,
}

impl<C: Connection> Publisher<C> {
    pub(crate) fn new(
        owner: String,
        info: TrackInfo,
        ssrc: u32,
        relay: Arc<C::LocalTrack>,
        connection: Arc<C>,
    ) -> Self {
        info!(
            peer_id = %owner,
            track_id = %info.track_id,
            stream_id = %info.stream_id,
            kind = %info.kind(),
            codec = %info.codec.mime_type,
            "Creating publisher"
        );

        Self {
            owner,
            info,
            ssrc,
            relay,
            connection,
            subscribers: DashMap::new(),
            state: RwLock::new(ForwardingState::Idle),
            cancel: CancellationToken::new(),
            stats: ForwardingStatsInner::default(),
            published_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    #[must_use]
    pub fn track_id(&self) -> &TrackId {
        &self.info.track_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.info.stream_id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.info.kind()
    }

    /// SSRC of the inbound stream
    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// The relay track every subscriber's sender reads from
    #[must_use]
    pub fn relay_track(&self) -> &Arc<C::LocalTrack> {
        &self.relay
    }

    #[must_use]
    pub fn state(&self) -> ForwardingState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.state() == ForwardingState::Forwarding
    }

    pub(crate) fn add_subscriber(&self, subscriber: Arc<Subscriber<C>>) {
        self.subscribers.insert(subscriber.id().clone(), subscriber);
    }

    pub(crate) fn remove_subscriber(&self, id: &SubscriberId) -> bool {
        self.subscribers.remove(id).is_some()
    }

    #[must_use]
    pub fn has_subscriber(&self, id: &SubscriberId) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Snapshot of the subscribers currently attached
    #[must_use]
    pub fn subscribers(&self) -> Vec<Arc<Subscriber<C>>> {
        self.subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Ask the publishing participant for a key frame
    pub async fn request_key_frame(&self, feedback: RtcpFeedback) -> Result<()> {
        self.connection
            .write_rtcp(feedback, self.ssrc)
            .await
            .map_err(Error::WriteRtcp)?;
        debug!(
            peer_id = %self.owner,
            track_id = %self.info.track_id,
            feedback = ?feedback,
            "Key frame requested"
        );
        Ok(())
    }

    /// End the forwarding loop.
    ///
    /// The loop still reports `PublishedTrackFailed` once it has exited.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn stats(&self) -> ForwardingStats {
        ForwardingStats {
            track_id: self.info.track_id.to_string(),
            kind: self.kind(),
            state: self.state(),
            packets_forwarded: self.stats.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.stats.bytes_forwarded.load(Ordering::Relaxed),
            packets_dropped: self.stats.packets_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            published_at: self.published_at,
        }
    }

    /// Spawn the forwarding task. Only the first call starts one; later
    /// calls return `false`.
    pub(crate) fn start(
        self: &Arc<Self>,
        remote: Arc<C::RemoteTrack>,
        sink: Arc<dyn EventSink<C>>,
        registry: Weak<PublisherRegistry<C>>,
        buffer_size: usize,
    ) -> bool {
        {
            let mut state = self.state.write();
            if *state != ForwardingState::Idle {
                warn!(
                    peer_id = %self.owner,
                    track_id = %self.info.track_id,
                    state = ?*state,
                    "Forwarding already started"
                );
                return false;
            }
            *state = ForwardingState::Forwarding;
        }

        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            publisher.forward(remote.as_ref(), buffer_size).await;
            publisher.finish(sink.as_ref(), &registry);
        });
        true
    }

    async fn forward(&self, remote: &C::RemoteTrack, buffer_size: usize) {
        let mut buf = vec![0u8; buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(
                        peer_id = %self.owner,
                        track_id = %self.info.track_id,
                        "Publisher stopped"
                    );
                    return;
                }
                read = remote.read(&mut buf) => read,
            };

            let len = match read {
                Ok(len) => len,
                Err(ReadError::EndOfStream) => {
                    info!(
                        peer_id = %self.owner,
                        track_id = %self.info.track_id,
                        "Remote track closed"
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        peer_id = %self.owner,
                        track_id = %self.info.track_id,
                        error = %e,
                        "Failed to read from remote track"
                    );
                    return;
                }
            };

            match self.relay.write(&buf[..len]).await {
                Ok(_) => {
                    self.stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_forwarded.fetch_add(len as u64, Ordering::Relaxed);
                }
                // Nobody subscribed yet
                Err(WriteError::NoConsumer) => {
                    self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        peer_id = %self.owner,
                        track_id = %self.info.track_id,
                        error = %e,
                        "Failed to write to local track"
                    );
                    return;
                }
            }
        }
    }

    fn finish(self: &Arc<Self>, sink: &dyn EventSink<C>, registry: &Weak<PublisherRegistry<C>>) {
        *self.state.write() = ForwardingState::Terminated;

        if let Some(registry) = registry.upgrade() {
            registry.remove_if(&self.info.track_id, |_, publisher| Arc::ptr_eq(publisher, self));
        }

        sink.send(Event::PublishedTrackFailed {
            track: Arc::clone(self),
        });
    }
}

impl<C: Connection> fmt::Debug for Publisher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("owner", &self.owner)
            .field("info", &self.info)
            .field("ssrc", &self.ssrc)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Drop for Publisher<C> {
    fn drop(&mut self) {
        debug!(
            peer_id = %self.owner,
            track_id = %self.info.track_id,
            packets_forwarded = self.stats.packets_forwarded.load(Ordering::Relaxed),
            "Publisher dropped"
        );
    }
}
