//! Peer connection lifecycle
//!
//! A [`Peer`] owns one engine connection and turns its callbacks into
//! [`Event`]s:
//! - ICE candidates and the end of gathering
//! - renegotiation offers
//! - joining and leaving the call
//! - published tracks, which it ingests as [`Publisher`]s
//! - the data channel, bound at most once

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::engine::{Connection, ConnectionObserver, DataChannel, DataChannelObserver, RemoteTrack};
use crate::error::{EngineError, Error, Result};
use crate::event::{ChannelSink, Event, EventSink, HangupReason, PeerMessage};
use crate::publisher::{Publisher, PublisherRegistry};
use crate::subscriber::{Subscriber, SubscriberRegistry};
use crate::types::{
    ConnectionState, DataChannelFrame, IceCandidate, IceConnectionState, IceGatheringState,
    RtcpFeedback, SessionDescription, SignalingState, TrackId,
};

/// Identity of a peer, supplied by the caller
pub trait PeerIdentity: Clone + fmt::Display + fmt::Debug + Send + Sync + 'static {}

impl<T> PeerIdentity for T where T: Clone + fmt::Display + fmt::Debug + Send + Sync + 'static {}

/// One call participant and its connection to the relay
pub struct Peer<Id: PeerIdentity, C: Connection> {
    id: Id,
    connection: Arc<C>,
    sink: Arc<dyn EventSink<C>>,
    rtp_buffer_size: usize,
    forward_rtcp: bool,
    data_channel: Mutex<Option<Arc<C::DataChannel>>>,
    publishers: Arc<PublisherRegistry<C>>,
    subscribers: Arc<SubscriberRegistry<C>>,
    terminated: AtomicBool,
}

impl<Id: PeerIdentity, C: Connection> Peer<Id, C> {
    /// Wrap `connection` and start receiving its callbacks
    pub fn new(
        id: Id,
        connection: Arc<C>,
        sink: Arc<dyn EventSink<C>>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        info!(peer_id = %id, "Creating peer");

        let peer = Arc::new(Self {
            id,
            connection,
            sink,
            rtp_buffer_size: config.rtp_buffer_size,
            forward_rtcp: config.forward_rtcp,
            data_channel: Mutex::new(None),
            publishers: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            terminated: AtomicBool::new(false),
        });

        let observer: Weak<Self> = Arc::downgrade(&peer);
        let observer: Weak<dyn ConnectionObserver<C>> = observer;
        peer.connection.observe(observer);
        peer
    }

    /// Peer reporting into a channel shared with the other peers of the call
    pub fn with_channel(
        id: Id,
        connection: Arc<C>,
        tx: mpsc::UnboundedSender<PeerMessage<Id, C>>,
        config: &RelayConfig,
    ) -> Arc<Self> {
        let sink = Arc::new(ChannelSink::new(id.clone(), tx));
        Self::new(id, connection, sink, config)
    }

    #[must_use]
    pub const fn id(&self) -> &Id {
        &self.id
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn has_data_channel(&self) -> bool {
        self.data_channel.lock().is_some()
    }

    /// Apply a remote offer and answer it.
    ///
    /// Used for the initial offer as well as for renegotiation started by the
    /// participant.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.connection
            .set_remote_description(offer)
            .await
            .map_err(Error::SetRemoteDescription)?;
        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(Error::CreateAnswer)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(Error::SetLocalDescription)?;

        debug!(peer_id = %self.id, "Offer accepted");
        Ok(answer)
    }

    /// Apply the participant's answer to our renegotiation offer
    pub async fn process_answer(&self, answer: SessionDescription) -> Result<()> {
        self.connection
            .set_remote_description(answer)
            .await
            .map_err(Error::SetRemoteDescription)?;
        debug!(peer_id = %self.id, "Answer applied");
        Ok(())
    }

    /// Add remote ICE candidates, returning how many were accepted.
    ///
    /// A rejected candidate is logged and does not stop the others.
    pub async fn add_ice_candidates(&self, candidates: Vec<IceCandidate>) -> usize {
        let mut added = 0;
        for candidate in candidates {
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => added += 1,
                Err(e) => {
                    let e = Error::AddIceCandidate(e);
                    error!(peer_id = %self.id, error = %e, "Failed to add ICE candidate");
                }
            }
        }
        added
    }

    pub async fn send_over_data_channel(&self, text: String) -> Result<()> {
        let channel = self
            .data_channel
            .lock()
            .clone()
            .ok_or(Error::DataChannelNotAvailable)?;
        channel.send_text(text).await.map_err(Error::DataChannelSend)
    }

    /// A subscriber delivering other peers' tracks over this peer's
    /// connection
    #[must_use]
    pub fn new_subscriber(&self) -> Arc<Subscriber<C>> {
        Arc::new(Subscriber::new(
            self.id.to_string(),
            Arc::clone(&self.connection),
            Arc::clone(&self.sink),
            Arc::downgrade(&self.subscribers),
            self.forward_rtcp,
        ))
    }

    /// Tracks this peer is currently publishing
    #[must_use]
    pub fn publishers(&self) -> Vec<Arc<Publisher<C>>> {
        self.publishers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn publisher(&self, track_id: &TrackId) -> Option<Arc<Publisher<C>>> {
        self.publishers.get(track_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Subscribers of this peer that are attached to a publisher
    #[must_use]
    pub fn subscribers(&self) -> Vec<Arc<Subscriber<C>>> {
        self.subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Ask this peer for a key frame of one of its published tracks
    pub async fn write_rtcp(&self, track_id: &TrackId, feedback: RtcpFeedback) -> Result<()> {
        let publisher = self
            .publisher(track_id)
            .ok_or_else(|| Error::UnknownTrack(track_id.clone()))?;
        publisher.request_key_frame(feedback).await
    }

    /// Stop forwarding, detach every subscription and close the connection.
    ///
    /// Only the first call does anything.
    pub async fn terminate(&self) -> Result<()> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            debug!(peer_id = %self.id, "Peer already terminated");
            return Ok(());
        }
        info!(peer_id = %self.id, "Terminating peer");

        for publisher in self.publishers() {
            publisher.stop();
        }

        for subscriber in self.subscribers() {
            subscriber.unsubscribe().await;
        }

        // The slot stays filled so a late channel cannot bind
        let channel = self.data_channel.lock().clone();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!(peer_id = %self.id, error = %e, "Failed to close data channel");
            }
        }

        self.connection.close().await.map_err(Error::Close)
    }

    async fn renegotiate(&self) -> Result<SessionDescription> {
        let offer = self
            .connection
            .create_offer()
            .await
            .map_err(Error::CreateOffer)?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(Error::SetLocalDescription)?;
        Ok(offer)
    }

    fn bind_data_channel(&self, channel: &Arc<C::DataChannel>) -> bool {
        let mut slot = self.data_channel.lock();
        if slot.is_some() || self.is_terminated() {
            return false;
        }
        *slot = Some(Arc::clone(channel));
        true
    }
}

#[async_trait]
impl<Id: PeerIdentity, C: Connection> ConnectionObserver<C> for Peer<Id, C> {
    async fn on_ice_candidate(&self, candidate: Option<IceCandidate>) {
        match candidate {
            Some(candidate) => {
                debug!(
                    peer_id = %self.id,
                    candidate = %candidate.candidate,
                    "ICE candidate gathered"
                );
                self.sink.send(Event::NewIceCandidate { candidate });
            }
            None => {
                debug!(peer_id = %self.id, "ICE gathering complete");
                self.sink.send(Event::IceGatheringComplete);
            }
        }
    }

    async fn on_negotiation_needed(&self) {
        match self.renegotiate().await {
            Ok(offer) => {
                debug!(peer_id = %self.id, "Renegotiation required");
                self.sink.send(Event::RenegotiationRequired { offer });
            }
            Err(e) => error!(peer_id = %self.id, error = %e, "Renegotiation failed"),
        }
    }

    async fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        match state {
            // Reported through the connection state instead
            IceConnectionState::Failed | IceConnectionState::Disconnected => {
                debug!(peer_id = %self.id, state = ?state, "ICE connection lost");
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                debug!(peer_id = %self.id, state = ?state, "ICE connection established");
            }
            _ => debug!(peer_id = %self.id, state = ?state, "ICE connection state changed"),
        }
    }

    async fn on_ice_gathering_state_change(&self, state: IceGatheringState) {
        debug!(peer_id = %self.id, state = ?state, "ICE gathering state changed");
    }

    async fn on_signaling_state_change(&self, state: SignalingState) {
        debug!(peer_id = %self.id, state = ?state, "Signaling state changed");
    }

    async fn on_connection_state_change(&self, state: ConnectionState) {
        info!(peer_id = %self.id, state = ?state, "Connection state changed");

        match state {
            ConnectionState::Connected => self.sink.send(Event::JoinedTheCall),
            ConnectionState::Failed | ConnectionState::Disconnected | ConnectionState::Closed => {
                self.sink.send(Event::LeftTheCall {
                    reason: HangupReason::UserHangup,
                });
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn on_track(&self, track: Arc<C::RemoteTrack>) {
        let info = track.info();

        let relay = match self.connection.new_local_track(&info) {
            Ok(relay) => relay,
            Err(e) => {
                let e = Error::TrackCreation(e);
                error!(
                    peer_id = %self.id,
                    track_id = %info.track_id,
                    error = %e,
                    "Failed to create relay track"
                );
                return;
            }
        };

        let publisher = Arc::new(Publisher::new(
            self.id.to_string(),
            info,
            track.ssrc(),
            relay,
            Arc::clone(&self.connection),
        ));

        let track_id = publisher.track_id().clone();
        if let Some(previous) = self.publishers.insert(track_id.clone(), Arc::clone(&publisher)) {
            warn!(
                peer_id = %self.id,
                track_id = %track_id,
                "Track published twice, stopping previous publisher"
            );
            previous.stop();
        }

        self.sink.send(Event::NewTrackPublished {
            track: Arc::clone(&publisher),
        });

        publisher.start(
            track,
            Arc::clone(&self.sink),
            Arc::downgrade(&self.publishers),
            self.rtp_buffer_size,
        );
    }

    async fn on_data_channel(&self, channel: Arc<C::DataChannel>) {
        let label = channel.label();

        if !self.bind_data_channel(&channel) {
            error!(
                peer_id = %self.id,
                label = %label,
                "Data channel already bound, closing the new one"
            );
            if let Err(e) = channel.close().await {
                warn!(
                    peer_id = %self.id,
                    label = %label,
                    error = %e,
                    "Failed to close data channel"
                );
            }
            return;
        }

        channel.observe(Arc::new(ChannelEvents {
            owner: self.id.to_string(),
            label: label.clone(),
            sink: Arc::clone(&self.sink),
        }));
        info!(peer_id = %self.id, label = %label, "Data channel bound");
    }
}

impl<Id: PeerIdentity, C: Connection> fmt::Debug for Peer<Id, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("publishers", &self.publishers.len())
            .field("subscribers", &self.subscribers.len())
            .field("data_channel", &self.has_data_channel())
            .field("terminated", &self.is_terminated())
            .finish_non_exhaustive()
    }
}

impl<Id: PeerIdentity, C: Connection> Drop for Peer<Id, C> {
    fn drop(&mut self) {
        debug!(peer_id = %self.id, "Peer dropped");
    }
}

/// Handlers registered on the bound data channel
struct ChannelEvents<C: Connection> {
    owner: String,
    label: String,
    sink: Arc<dyn EventSink<C>>,
}

impl<C: Connection> DataChannelObserver for ChannelEvents<C> {
    fn on_open(&self) {
        info!(peer_id = %self.owner, label = %self.label, "Data channel open");
        self.sink.send(Event::DataChannelAvailable);
    }

    fn on_message(&self, frame: DataChannelFrame) {
        match frame {
            DataChannelFrame::Text(text) => self.sink.send(Event::DataChannelMessage { text }),
            DataChannelFrame::Binary(data) => {
                warn!(
                    peer_id = %self.owner,
                    label = %self.label,
                    len = data.len(),
                    "Binary data channel message ignored"
                );
            }
        }
    }

    fn on_error(&self, error: EngineError) {
        error!(peer_id = %self.owner, label = %self.label, error = %error, "Data channel error");
    }

    fn on_close(&self) {
        info!(peer_id = %self.owner, label = %self.label, "Data channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryConnection, Operation};
    use crate::event::EventKind;
    use crate::types::{CodecCapability, PeerId, TrackInfo};
    use std::time::Duration;
    use tokio::time::timeout;

    type TestPeer = Peer<PeerId, MemoryConnection>;
    type Rx = mpsc::UnboundedReceiver<PeerMessage<PeerId, MemoryConnection>>;

    fn peer(name: &str) -> (Arc<TestPeer>, Arc<MemoryConnection>, Rx) {
        let connection = MemoryConnection::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::with_channel(
            PeerId::from(name),
            Arc::clone(&connection),
            tx,
            &RelayConfig::default(),
        );
        (peer, connection, rx)
    }

    fn video(track_id: &str) -> TrackInfo {
        TrackInfo::new(
            CodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            track_id,
            "stream-1",
        )
    }

    async fn next(rx: &mut Rx) -> Event<MemoryConnection> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .event
    }

    async fn assert_quiet(rx: &mut Rx) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(message) = rx.try_recv() {
            panic!("unexpected event {:?}", message.event);
        }
    }

    #[tokio::test]
    async fn test_ice_candidates_and_gathering_complete() {
        let (_peer, connection, mut rx) = peer("alice");

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        connection.gather(Some(candidate.clone())).await;
        connection.gather(None).await;

        match next(&mut rx).await {
            Event::NewIceCandidate { candidate: got } => assert_eq!(got, candidate),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(next(&mut rx).await.kind(), EventKind::IceGatheringComplete);
    }

    #[tokio::test]
    async fn test_negotiation_needed_emits_applied_offer() {
        let (_peer, connection, mut rx) = peer("alice");

        connection.need_negotiation().await;

        match next(&mut rx).await {
            Event::RenegotiationRequired { offer } => {
                assert_eq!(connection.local_description(), Some(offer));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negotiation_failure_is_silent() {
        let (_peer, connection, mut rx) = peer("alice");

        connection.fail(Operation::CreateOffer);
        connection.need_negotiation().await;
        assert_quiet(&mut rx).await;

        connection.recover(Operation::CreateOffer);
        connection.fail(Operation::SetLocalDescription);
        connection.need_negotiation().await;
        assert_quiet(&mut rx).await;
        assert!(connection.local_description().is_none());
    }

    #[tokio::test]
    async fn test_renegotiation_errors_name_the_failed_step() {
        let (peer, connection, _rx) = peer("alice");

        connection.fail(Operation::CreateOffer);
        assert!(matches!(peer.renegotiate().await, Err(Error::CreateOffer(_))));

        connection.recover(Operation::CreateOffer);
        connection.fail(Operation::SetLocalDescription);
        assert!(matches!(
            peer.renegotiate().await,
            Err(Error::SetLocalDescription(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_state_events() {
        let (_peer, connection, mut rx) = peer("alice");

        connection.set_state(ConnectionState::Connecting).await;
        connection.set_state(ConnectionState::Connected).await;
        assert_eq!(next(&mut rx).await.kind(), EventKind::JoinedTheCall);

        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Failed,
            ConnectionState::Closed,
        ] {
            connection.set_state(state).await;
            match next(&mut rx).await {
                Event::LeftTheCall { reason } => assert_eq!(reason, HangupReason::UserHangup),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_ice_and_signaling_states_emit_nothing() {
        let (_peer, connection, mut rx) = peer("alice");

        for state in [
            IceConnectionState::Checking,
            IceConnectionState::Connected,
            IceConnectionState::Completed,
            IceConnectionState::Disconnected,
            IceConnectionState::Failed,
        ] {
            connection.set_ice_connection_state(state).await;
        }
        connection.set_ice_gathering_state(IceGatheringState::Gathering).await;
        connection.set_signaling_state(SignalingState::HaveRemoteOffer).await;

        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_every_published_track_is_announced_and_fails_once() {
        let (peer, connection, mut rx) = peer("alice");

        let mut feeds = Vec::new();
        for id in ["t1", "t2", "t3"] {
            feeds.push(connection.publish(video(id), 1).await);
        }

        let mut announced = Vec::new();
        for _ in 0..3 {
            match next(&mut rx).await {
                Event::NewTrackPublished { track } => announced.push(track.track_id().clone()),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(announced, vec![TrackId::from("t1"), TrackId::from("t2"), TrackId::from("t3")]);
        assert_eq!(peer.publishers().len(), 3);

        drop(feeds);

        let mut failed = Vec::new();
        for _ in 0..3 {
            match next(&mut rx).await {
                Event::PublishedTrackFailed { track } => failed.push(track.track_id().clone()),
                other => panic!("unexpected event {other:?}"),
            }
        }
        failed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(failed, announced);
        assert!(peer.publishers().is_empty());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_relay_track_creation_failure_ignores_track() {
        let (peer, connection, mut rx) = peer("alice");
        connection.fail(Operation::NewLocalTrack);

        let _feed = connection.publish(video("t1"), 1).await;

        assert!(peer.publishers().is_empty());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_data_channel_binds_once() {
        let (peer, connection, mut rx) = peer("alice");

        let first = connection.announce_data_channel("chat").await;
        let second = connection.announce_data_channel("chat-2").await;

        assert!(first.is_observed());
        assert!(!first.is_closed());
        assert!(!second.is_observed());
        assert!(second.is_closed());

        first.open();
        assert_eq!(next(&mut rx).await.kind(), EventKind::DataChannelAvailable);

        second.open();
        second.receive_text("ignored");
        assert_quiet(&mut rx).await;

        first.receive_text("hello");
        match next(&mut rx).await {
            Event::DataChannelMessage { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected event {other:?}"),
        }

        peer.send_over_data_channel("hi".to_string()).await.unwrap();
        assert_eq!(first.sent(), vec!["hi".to_string()]);
        assert!(second.sent().is_empty());
    }

    #[tokio::test]
    async fn test_data_channel_binary_error_and_close_are_not_events() {
        let (_peer, connection, mut rx) = peer("alice");
        let channel = connection.announce_data_channel("chat").await;

        channel.receive_binary(vec![1u8, 2, 3]);
        channel.raise(EngineError::new("sctp reset"));
        channel.close().await.unwrap();

        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_send_without_data_channel() {
        let (peer, _connection, _rx) = peer("alice");
        let result = peer.send_over_data_channel("hi".to_string()).await;
        assert!(matches!(result, Err(Error::DataChannelNotAvailable)));
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (peer, connection, _rx) = peer("alice");

        let answer = peer.accept_offer(SessionDescription::offer("v=0 remote")).await.unwrap();
        assert_eq!(connection.remote_description(), Some(SessionDescription::offer("v=0 remote")));
        assert_eq!(connection.local_description(), Some(answer));

        peer.process_answer(SessionDescription::answer("v=0 remote answer"))
            .await
            .unwrap();
        assert_eq!(
            connection.remote_description(),
            Some(SessionDescription::answer("v=0 remote answer"))
        );

        connection.fail(Operation::SetRemoteDescription);
        let result = peer.accept_offer(SessionDescription::offer("v=0")).await;
        assert!(matches!(result, Err(Error::SetRemoteDescription(_))));
    }

    #[tokio::test]
    async fn test_add_ice_candidates_counts_accepted() {
        let (peer, connection, _rx) = peer("alice");
        let candidates = vec![IceCandidate::default(), IceCandidate::default()];

        assert_eq!(peer.add_ice_candidates(candidates.clone()).await, 2);
        assert_eq!(connection.candidates().len(), 2);

        connection.fail(Operation::AddIceCandidate);
        assert_eq!(peer.add_ice_candidates(candidates).await, 0);
    }

    #[tokio::test]
    async fn test_write_rtcp_targets_published_track() {
        let (peer, connection, mut rx) = peer("alice");
        let _feed = connection.publish(video("cam"), 777).await;
        assert_eq!(next(&mut rx).await.kind(), EventKind::NewTrackPublished);

        peer.write_rtcp(&TrackId::from("cam"), RtcpFeedback::PictureLossIndication)
            .await
            .unwrap();
        assert_eq!(
            connection.rtcp_written(),
            vec![(RtcpFeedback::PictureLossIndication, 777)]
        );

        let result = peer
            .write_rtcp(&TrackId::from("missing"), RtcpFeedback::FullIntraRequest)
            .await;
        assert!(matches!(result, Err(Error::UnknownTrack(_))));
    }

    #[tokio::test]
    async fn test_publish_subscribe_end_to_end() {
        let (alice, alice_conn, mut alice_rx) = peer("alice");
        let (bob, bob_conn, mut bob_rx) = peer("bob");

        alice_conn.set_state(ConnectionState::Connected).await;
        bob_conn.set_state(ConnectionState::Connected).await;
        assert_eq!(next(&mut alice_rx).await.kind(), EventKind::JoinedTheCall);
        assert_eq!(next(&mut bob_rx).await.kind(), EventKind::JoinedTheCall);

        let feed = alice_conn.publish(video("cam"), 42).await;
        let publisher = match next(&mut alice_rx).await {
            Event::NewTrackPublished { track } => track,
            other => panic!("unexpected event {other:?}"),
        };

        let subscriber = bob.new_subscriber();
        subscriber.subscribe(&publisher).await.unwrap();
        assert_eq!(bob.subscribers().len(), 1);
        assert_eq!(publisher.subscriber_count(), 1);

        let sent: Vec<Vec<u8>> = (0u8..50).map(|i| vec![0x80, 96, 0, i, 1, 2, 3, i]).collect();
        for packet in &sent {
            feed.push(packet.clone());
        }

        let sender = subscriber.sender().unwrap();
        for expected in &sent {
            let got = timeout(Duration::from_secs(1), sender.recv()).await.unwrap().unwrap();
            assert_eq!(got.as_ref(), expected.as_slice());
        }

        alice_conn.set_state(ConnectionState::Disconnected).await;
        assert_eq!(next(&mut alice_rx).await.kind(), EventKind::LeftTheCall);

        drop(feed);
        match next(&mut alice_rx).await {
            Event::PublishedTrackFailed { track } => assert!(Arc::ptr_eq(&track, &publisher)),
            other => panic!("unexpected event {other:?}"),
        }
        assert_quiet(&mut alice_rx).await;
        assert!(alice.publishers().is_empty());
        assert_eq!(publisher.stats().packets_forwarded, 50);
    }

    #[tokio::test]
    async fn test_data_channel_refused_after_terminate() {
        let (peer, connection, mut rx) = peer("alice");
        let first = connection.announce_data_channel("chat").await;

        peer.terminate().await.unwrap();
        assert_eq!(next(&mut rx).await.kind(), EventKind::LeftTheCall);
        assert!(first.is_closed());

        let late = connection.announce_data_channel("chat-2").await;
        assert!(!late.is_observed());
        assert!(late.is_closed());

        late.open();
        late.receive_text("ignored");
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_data_channel_refused_when_terminated_before_any_bind() {
        let (peer, connection, mut rx) = peer("alice");
        peer.terminate().await.unwrap();
        assert_eq!(next(&mut rx).await.kind(), EventKind::LeftTheCall);

        let late = connection.announce_data_channel("chat").await;
        assert!(!late.is_observed());
        assert!(late.is_closed());
        assert!(!peer.has_data_channel());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_duplicate_track_id_replaces_publisher() {
        let (peer, connection, mut rx) = peer("alice");

        let first_feed = connection.publish(video("cam"), 1).await;
        let first = match next(&mut rx).await {
            Event::NewTrackPublished { track } => track,
            other => panic!("unexpected event {other:?}"),
        };

        let _second_feed = connection.publish(video("cam"), 2).await;
        let second = match next(&mut rx).await {
            Event::NewTrackPublished { track } => track,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(!Arc::ptr_eq(&first, &second));

        match next(&mut rx).await {
            Event::PublishedTrackFailed { track } => assert!(Arc::ptr_eq(&track, &first)),
            other => panic!("unexpected event {other:?}"),
        }
        drop(first_feed);
        assert_quiet(&mut rx).await;

        let current = peer.publisher(&TrackId::from("cam")).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(peer.publishers().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (alice, alice_conn, mut alice_rx) = peer("alice");
        let (bob, bob_conn, mut bob_rx) = peer("bob");

        let _feed = alice_conn.publish(video("cam"), 42).await;
        let publisher = match next(&mut alice_rx).await {
            Event::NewTrackPublished { track } => track,
            other => panic!("unexpected event {other:?}"),
        };
        let subscriber = bob.new_subscriber();
        subscriber.subscribe(&publisher).await.unwrap();
        let channel = bob_conn.announce_data_channel("chat").await;

        bob.terminate().await.unwrap();
        assert!(bob.is_terminated());
        assert!(!subscriber.is_subscribed());
        assert!(bob.subscribers().is_empty());
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(channel.is_closed());
        assert_eq!(bob_conn.connection_state(), ConnectionState::Closed);
        assert_eq!(next(&mut bob_rx).await.kind(), EventKind::LeftTheCall);

        bob.terminate().await.unwrap();
        assert_quiet(&mut bob_rx).await;

        alice.terminate().await.unwrap();
        let mut kinds = vec![next(&mut alice_rx).await.kind(), next(&mut alice_rx).await.kind()];
        kinds.sort_by_key(|kind| format!("{kind:?}"));
        assert_eq!(kinds, vec![EventKind::LeftTheCall, EventKind::PublishedTrackFailed]);
        assert_quiet(&mut alice_rx).await;
    }
}
