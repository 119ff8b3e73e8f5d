//! In-process media engine for tests
//!
//! Tracks are tokio channels: a [`RemoteFeed`] pushes packets into a
//! [`MemoryRemoteTrack`], a [`MemoryLocalTrack`] copies every write to the
//! [`MemorySender`]s attached to it. Connection callbacks are fired by hand
//! with the helpers on [`MemoryConnection`], and any engine operation can be
//! made to fail with [`MemoryConnection::fail`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Connection, ConnectionObserver, DataChannel, DataChannelObserver, LocalTrack, RemoteTrack,
    RtpSender,
};
use crate::error::{EngineError, ReadError, WriteError};
use crate::types::{
    ConnectionState, DataChannelFrame, IceCandidate, IceConnectionState, IceGatheringState,
    RtcpFeedback, SessionDescription, SignalingState, TrackInfo,
};

/// Engine operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
    NewLocalTrack,
    AddTrack,
    RemoveTrack,
    WriteRtcp,
    Close,
}

pub struct MemoryRemoteTrack {
    info: TrackInfo,
    ssrc: u32,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, ReadError>>>,
    closed: CancellationToken,
}

/// Publishing side of a [`MemoryRemoteTrack`]; dropping it ends the stream
pub struct RemoteFeed {
    tx: mpsc::UnboundedSender<Result<Bytes, ReadError>>,
}

impl RemoteFeed {
    pub fn push(&self, packet: impl Into<Bytes>) {
        let _ = self.tx.send(Ok(packet.into()));
    }

    /// Make the next read fail with `error`
    pub fn fail(&self, error: ReadError) {
        let _ = self.tx.send(Err(error));
    }
}

impl MemoryRemoteTrack {
    pub fn new(info: TrackInfo, ssrc: u32) -> (Arc<Self>, RemoteFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let track = Arc::new(Self {
            info,
            ssrc,
            packets: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        });
        (track, RemoteFeed { tx })
    }

    /// Fail pending and future reads, as closing the connection does
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl RemoteTrack for MemoryRemoteTrack {
    fn info(&self) -> TrackInfo {
        self.info.clone()
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let mut packets = self.packets.lock().await;
        let next = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(ReadError::EndOfStream),
            next = packets.recv() => next,
        };
        match next {
            Some(Ok(packet)) => {
                if packet.len() > buf.len() {
                    return Err(ReadError::Failed(EngineError::new("short buffer")));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Some(Err(err)) => Err(err),
            None => Err(ReadError::EndOfStream),
        }
    }
}

pub struct MemoryLocalTrack {
    info: TrackInfo,
    consumers: Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>,
    write_failure: Mutex<Option<EngineError>>,
    write_attempts: AtomicU64,
}

impl MemoryLocalTrack {
    pub fn new(info: TrackInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            consumers: Mutex::new(HashMap::new()),
            write_failure: Mutex::new(None),
            write_attempts: AtomicU64::new(0),
        })
    }

    /// Make every following write fail with `error`
    pub fn fail_writes(&self, error: EngineError) {
        *self.write_failure.lock() = Some(error);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::Relaxed)
    }

    fn attach(&self, id: u64, tx: mpsc::UnboundedSender<Bytes>) {
        self.consumers.lock().insert(id, tx);
    }

    fn detach(&self, id: u64) {
        self.consumers.lock().remove(&id);
    }
}

#[async_trait]
impl LocalTrack for MemoryLocalTrack {
    fn info(&self) -> TrackInfo {
        self.info.clone()
    }

    async fn write(&self, packet: &[u8]) -> Result<usize, WriteError> {
        self.write_attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.write_failure.lock().clone() {
            return Err(WriteError::Failed(err));
        }

        let consumers = self.consumers.lock();
        if consumers.is_empty() {
            return Err(WriteError::NoConsumer);
        }
        let packet = Bytes::copy_from_slice(packet);
        for tx in consumers.values() {
            let _ = tx.send(packet.clone());
        }
        Ok(packet.len())
    }
}

pub struct MemorySender {
    id: u64,
    track: Arc<MemoryLocalTrack>,
    packets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    rtcp_tx: Mutex<Option<mpsc::UnboundedSender<Vec<RtcpFeedback>>>>,
    rtcp_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<RtcpFeedback>>>,
}

impl MemorySender {
    pub fn track(&self) -> &Arc<MemoryLocalTrack> {
        &self.track
    }

    /// Next packet delivered to this sender, `None` once detached and drained
    pub async fn recv(&self) -> Option<Bytes> {
        self.packets.lock().await.recv().await
    }

    /// Simulate RTCP feedback from the receiving participant
    pub fn receive_rtcp(&self, packets: Vec<RtcpFeedback>) {
        if let Some(tx) = self.rtcp_tx.lock().as_ref() {
            let _ = tx.send(packets);
        }
    }

    fn stop(&self) {
        self.rtcp_tx.lock().take();
        self.track.detach(self.id);
    }
}

#[async_trait]
impl RtpSender for MemorySender {
    async fn read_rtcp(&self) -> Result<Vec<RtcpFeedback>, ReadError> {
        self.rtcp_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ReadError::EndOfStream)
    }
}

pub struct MemoryDataChannel {
    label: String,
    observer: RwLock<Option<Arc<dyn DataChannelObserver>>>,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MemoryDataChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            observer: RwLock::new(None),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn observer(&self) -> Option<Arc<dyn DataChannelObserver>> {
        self.observer.read().clone()
    }

    pub fn is_observed(&self) -> bool {
        self.observer.read().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn open(&self) {
        if let Some(observer) = self.observer() {
            observer.on_open();
        }
    }

    pub fn receive_text(&self, text: impl Into<String>) {
        if let Some(observer) = self.observer() {
            observer.on_message(DataChannelFrame::Text(text.into()));
        }
    }

    pub fn receive_binary(&self, data: impl Into<Bytes>) {
        if let Some(observer) = self.observer() {
            observer.on_message(DataChannelFrame::Binary(data.into()));
        }
    }

    pub fn raise(&self, error: EngineError) {
        if let Some(observer) = self.observer() {
            observer.on_error(error);
        }
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::new("data channel closed"));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(observer) = self.observer() {
            observer.on_close();
        }
        Ok(())
    }

    fn observe(&self, observer: Arc<dyn DataChannelObserver>) {
        *self.observer.write() = Some(observer);
    }
}

#[derive(Default)]
struct Descriptions {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
}

pub struct MemoryConnection {
    state: RwLock<ConnectionState>,
    observer: RwLock<Option<Weak<dyn ConnectionObserver<MemoryConnection>>>>,
    failures: Mutex<HashSet<Operation>>,
    descriptions: Mutex<Descriptions>,
    candidates: Mutex<Vec<IceCandidate>>,
    senders: Mutex<Vec<Arc<MemorySender>>>,
    remote_tracks: Mutex<Vec<Arc<MemoryRemoteTrack>>>,
    rtcp: Mutex<Vec<(RtcpFeedback, u32)>>,
    next_id: AtomicU64,
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ConnectionState::New),
            observer: RwLock::new(None),
            failures: Mutex::new(HashSet::new()),
            descriptions: Mutex::new(Descriptions::default()),
            candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            rtcp: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Make `operation` fail until [`MemoryConnection::recover`] is called
    pub fn fail(&self, operation: Operation) {
        self.failures.lock().insert(operation);
    }

    pub fn recover(&self, operation: Operation) {
        self.failures.lock().remove(&operation);
    }

    fn check(&self, operation: Operation) -> Result<(), EngineError> {
        if self.failures.lock().contains(&operation) {
            return Err(EngineError::new(format!("{operation:?} failed")));
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn observer(&self) -> Option<Arc<dyn ConnectionObserver<Self>>> {
        self.observer.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.descriptions.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.descriptions.lock().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn senders(&self) -> Vec<Arc<MemorySender>> {
        self.senders.lock().clone()
    }

    pub fn rtcp_written(&self) -> Vec<(RtcpFeedback, u32)> {
        self.rtcp.lock().clone()
    }

    /// Change the connection state and fire the callback
    pub async fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if let Some(observer) = self.observer() {
            observer.on_connection_state_change(state).await;
        }
    }

    pub async fn set_ice_connection_state(&self, state: IceConnectionState) {
        if let Some(observer) = self.observer() {
            observer.on_ice_connection_state_change(state).await;
        }
    }

    pub async fn set_ice_gathering_state(&self, state: IceGatheringState) {
        if let Some(observer) = self.observer() {
            observer.on_ice_gathering_state_change(state).await;
        }
    }

    pub async fn set_signaling_state(&self, state: SignalingState) {
        if let Some(observer) = self.observer() {
            observer.on_signaling_state_change(state).await;
        }
    }

    pub async fn gather(&self, candidate: Option<IceCandidate>) {
        if let Some(observer) = self.observer() {
            observer.on_ice_candidate(candidate).await;
        }
    }

    pub async fn need_negotiation(&self) {
        if let Some(observer) = self.observer() {
            observer.on_negotiation_needed().await;
        }
    }

    /// Receive a new remote track and fire `on_track`
    pub async fn publish(&self, info: TrackInfo, ssrc: u32) -> RemoteFeed {
        let (track, feed) = MemoryRemoteTrack::new(info, ssrc);
        self.remote_tracks.lock().push(Arc::clone(&track));
        if let Some(observer) = self.observer() {
            observer.on_track(track).await;
        }
        feed
    }

    /// Announce a data channel opened by the remote side
    pub async fn announce_data_channel(&self, label: &str) -> Arc<MemoryDataChannel> {
        let channel = MemoryDataChannel::new(label);
        if let Some(observer) = self.observer() {
            observer.on_data_channel(Arc::clone(&channel)).await;
        }
        channel
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type RemoteTrack = MemoryRemoteTrack;
    type LocalTrack = MemoryLocalTrack;
    type Sender = MemorySender;
    type DataChannel = MemoryDataChannel;

    fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.check(Operation::CreateOffer)?;
        Ok(SessionDescription::offer(format!("v=0 o=memory {}", self.next_id())))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.check(Operation::CreateAnswer)?;
        if self.descriptions.lock().remote.is_none() {
            return Err(EngineError::new("no remote description"));
        }
        Ok(SessionDescription::answer(format!("v=0 o=memory {}", self.next_id())))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.check(Operation::SetLocalDescription)?;
        self.descriptions.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.check(Operation::SetRemoteDescription)?;
        self.descriptions.lock().remote = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.check(Operation::AddIceCandidate)?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn new_local_track(&self, info: &TrackInfo) -> Result<Arc<Self::LocalTrack>, EngineError> {
        self.check(Operation::NewLocalTrack)?;
        Ok(MemoryLocalTrack::new(info.clone()))
    }

    async fn add_track(
        &self,
        track: Arc<Self::LocalTrack>,
    ) -> Result<Arc<Self::Sender>, EngineError> {
        self.check(Operation::AddTrack)?;
        let id = self.next_id();
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let (rtcp_tx, rtcp_rx) = mpsc::unbounded_channel();
        track.attach(id, packet_tx);
        let sender = Arc::new(MemorySender {
            id,
            track,
            packets: tokio::sync::Mutex::new(packet_rx),
            rtcp_tx: Mutex::new(Some(rtcp_tx)),
            rtcp_rx: tokio::sync::Mutex::new(rtcp_rx),
        });
        self.senders.lock().push(Arc::clone(&sender));
        Ok(sender)
    }

    async fn remove_track(&self, sender: &Arc<Self::Sender>) -> Result<(), EngineError> {
        self.check(Operation::RemoveTrack)?;
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|s| s.id != sender.id);
        if senders.len() == before {
            return Err(EngineError::new("sender not found"));
        }
        sender.stop();
        Ok(())
    }

    async fn write_rtcp(&self, feedback: RtcpFeedback, media_ssrc: u32) -> Result<(), EngineError> {
        self.check(Operation::WriteRtcp)?;
        self.rtcp.lock().push((feedback, media_ssrc));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.check(Operation::Close)?;
        if self.connection_state() == ConnectionState::Closed {
            return Ok(());
        }
        for track in self.remote_tracks.lock().iter() {
            track.close();
        }
        for sender in self.senders.lock().drain(..) {
            sender.stop();
        }
        self.set_state(ConnectionState::Closed).await;
        Ok(())
    }

    fn observe(&self, observer: Weak<dyn ConnectionObserver<Self>>) {
        *self.observer.write() = Some(observer);
    }
}
