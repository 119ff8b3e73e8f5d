//! Subscriptions of a peer to other peers' published tracks

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{Connection, RtpSender};
use crate::error::{Error, ReadError, Result};
use crate::event::{Event, EventSink};
use crate::publisher::Publisher;
use crate::types::{ConnectionState, SubscriberId, TrackId};

/// Attached subscribers of one peer
pub(crate) type SubscriberRegistry<C> = DashMap<SubscriberId, Arc<Subscriber<C>>>;

/// What a subscriber is currently attached to. Replaced as a whole.
struct Binding<C: Connection> {
    track: Arc<C::LocalTrack>,
    sender: Arc<C::Sender>,
    publisher: Weak<Publisher<C>>,
    track_id: TrackId,
    rtcp: CancellationToken,
}

/// Relay of one publisher's track toward the subscriber's home connection
pub struct Subscriber<C: Connection> {
    id: SubscriberId,
    /// Display form of the home peer's identity, for logs
    owner: String,
    connection: Arc<C>,
    sink: Arc<dyn EventSink<C>>,
    registry: Weak<SubscriberRegistry<C>>,
    forward_rtcp: bool,
    binding: Mutex<Option<Binding<C>>>,
}

impl<C: Connection> Subscriber<C> {
    pub(crate) fn new(
        owner: String,
        connection: Arc<C>,
        sink: Arc<dyn EventSink<C>>,
        registry: Weak<SubscriberRegistry<C>>,
        forward_rtcp: bool,
    ) -> Self {
        Self {
            id: SubscriberId::generate(),
            owner,
            connection,
            sink,
            registry,
            forward_rtcp,
            binding: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Publisher this subscriber is attached to, if any and still alive
    #[must_use]
    pub fn publisher(&self) -> Option<Arc<Publisher<C>>> {
        self.binding
            .lock()
            .as_ref()
            .and_then(|binding| binding.publisher.upgrade())
    }

    #[must_use]
    pub fn track(&self) -> Option<Arc<C::LocalTrack>> {
        self.binding.lock().as_ref().map(|binding| Arc::clone(&binding.track))
    }

    #[must_use]
    pub fn sender(&self) -> Option<Arc<C::Sender>> {
        self.binding.lock().as_ref().map(|binding| Arc::clone(&binding.sender))
    }

    #[must_use]
    pub fn track_id(&self) -> Option<TrackId> {
        self.binding.lock().as_ref().map(|binding| binding.track_id.clone())
    }

    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Attach to `publisher`, replacing any previous attachment.
    ///
    /// Registers the publisher's relay track as a sender on the home
    /// connection. If that fails the error is logged and returned and the
    /// subscriber keeps its previous state.
    pub async fn subscribe(self: &Arc<Self>, publisher: &Arc<Publisher<C>>) -> Result<()> {
        let track = Arc::clone(publisher.relay_track());
        let sender = match self.connection.add_track(Arc::clone(&track)).await {
            Ok(sender) => sender,
            Err(e) => {
                error!(
                    peer_id = %self.owner,
                    subscriber_id = %self.id,
                    track_id = %publisher.track_id(),
                    error = %e,
                    "Failed to add track to peer connection"
                );
                return Err(Error::AddTrack(e));
            }
        };

        let rtcp = CancellationToken::new();
        let binding = Binding {
            track,
            sender: Arc::clone(&sender),
            publisher: Arc::downgrade(publisher),
            track_id: publisher.track_id().clone(),
            rtcp: rtcp.clone(),
        };

        let previous = {
            let mut guard = self.binding.lock();
            let previous = guard.replace(binding);
            if let Some(old) = previous.as_ref().and_then(|b| b.publisher.upgrade()) {
                if !Arc::ptr_eq(&old, publisher) {
                    old.remove_subscriber(&self.id);
                }
            }
            publisher.add_subscriber(Arc::clone(self));
            if let Some(registry) = self.registry.upgrade() {
                registry.insert(self.id.clone(), Arc::clone(self));
            }
            previous
        };

        if let Some(previous) = previous {
            debug!(
                peer_id = %self.owner,
                subscriber_id = %self.id,
                track_id = %previous.track_id,
                "Replacing previous subscription"
            );
            self.detach(previous).await;
        }

        if self.forward_rtcp {
            self.spawn_rtcp_reader(sender, publisher.track_id().clone(), rtcp);
        }

        info!(
            peer_id = %self.owner,
            subscriber_id = %self.id,
            track_id = %publisher.track_id(),
            stream_id = %publisher.stream_id(),
            kind = %publisher.kind(),
            "Subscribed"
        );
        Ok(())
    }

    /// Detach from the current publisher. Calling it again is a no-op.
    pub async fn unsubscribe(&self) {
        let binding = {
            let mut guard = self.binding.lock();
            let binding = guard.take();
            if let Some(binding) = &binding {
                if let Some(publisher) = binding.publisher.upgrade() {
                    publisher.remove_subscriber(&self.id);
                }
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove(&self.id);
                }
            }
            binding
        };

        let Some(binding) = binding else {
            debug!(peer_id = %self.owner, subscriber_id = %self.id, "Not subscribed");
            return;
        };

        let track_id = binding.track_id.clone();
        self.detach(binding).await;
        info!(
            peer_id = %self.owner,
            subscriber_id = %self.id,
            track_id = %track_id,
            "Unsubscribed"
        );
    }

    async fn detach(&self, binding: Binding<C>) {
        binding.rtcp.cancel();

        // The connection may still close between this check and the removal;
        // the engine then reports an error that is only logged.
        if self.connection.connection_state() == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self.remove_sender(&binding.sender).await {
            error!(
                peer_id = %self.owner,
                subscriber_id = %self.id,
                track_id = %binding.track_id,
                error = %e,
                "Failed to remove track"
            );
        }
    }

    async fn remove_sender(&self, sender: &Arc<C::Sender>) -> Result<()> {
        self.connection
            .remove_track(sender)
            .await
            .map_err(Error::RemoveTrack)
    }

    fn spawn_rtcp_reader(
        &self,
        sender: Arc<C::Sender>,
        track_id: TrackId,
        cancel: CancellationToken,
    ) {
        let sink = Arc::clone(&self.sink);
        let owner = self.owner.clone();
        let subscriber_id = self.id.clone();

        tokio::spawn(async move {
            loop {
                let read = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    read = sender.read_rtcp() => read,
                };
                match read {
                    Ok(packets) if packets.is_empty() => {}
                    Ok(packets) => sink.send(Event::RtcpReceived {
                        track_id: track_id.clone(),
                        packets,
                    }),
                    Err(ReadError::EndOfStream) => break,
                    Err(e) => {
                        debug!(
                            peer_id = %owner,
                            subscriber_id = %subscriber_id,
                            error = %e,
                            "Failed to read RTCP"
                        );
                        break;
                    }
                }
            }
            debug!(peer_id = %owner, subscriber_id = %subscriber_id, "RTCP reader stopped");
        });
    }
}

impl<C: Connection> fmt::Debug for Subscriber<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("track_id", &self.track_id())
            .finish_non_exhaustive()
    }
}
