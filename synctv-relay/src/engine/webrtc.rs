//! webrtc-rs binding of the engine traits

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::{PayloadType, RTCPFeedback, SSRC};
use webrtc::track::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::{Marshal, Unmarshal};

use super::{
    Connection, ConnectionObserver, DataChannel, DataChannelObserver, LocalTrack, RemoteTrack,
    RtpSender,
};
use crate::config::WebRtcConfig;
use crate::error::{EngineError, ReadError, WriteError};
use crate::types::{
    CodecCapability, ConnectionState, DataChannelFrame, IceCandidate, IceConnectionState,
    IceGatheringState, RtcpFeedback, RtcpFeedbackCapability, SdpType, SessionDescription,
    SignalingState, TrackInfo,
};

/// Factory of webrtc-rs peer connections sharing one API instance
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    /// Build the engine with the default codecs and interceptors
    pub fn new(config: &WebRtcConfig) -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if config.has_udp_port_range() {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| EngineError::new(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            info!(
                udp_port_min = config.udp_port_min,
                udp_port_max = config.udp_port_max,
                "WebRTC UDP port range configured"
            );
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                username: config.ice_username.clone().unwrap_or_default(),
                credential: config.ice_credential.clone().unwrap_or_default(),
                ..Default::default()
            }]
        };

        Ok(Self { api, ice_servers })
    }

    pub async fn new_connection(&self) -> Result<Arc<WebRtcConnection>, EngineError> {
        let configuration = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = self.api.new_peer_connection(configuration).await?;
        Ok(Arc::new(WebRtcConnection::new(Arc::new(pc))))
    }
}

/// [`Connection`] over an `RTCPeerConnection`
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    fir_sequence: AtomicU8,
}

impl WebRtcConnection {
    #[must_use]
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            pc,
            fir_sequence: AtomicU8::new(0),
        }
    }

    #[must_use]
    pub const fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl Connection for WebRtcConnection {
    type RemoteTrack = WebRtcRemoteTrack;
    type LocalTrack = WebRtcLocalTrack;
    type Sender = WebRtcSender;
    type DataChannel = WebRtcDataChannel;

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(offer.into())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(answer.into())
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn new_local_track(&self, info: &TrackInfo) -> Result<Arc<Self::LocalTrack>, EngineError> {
        Ok(Arc::new(WebRtcLocalTrack::new(info)))
    }

    async fn add_track(
        &self,
        track: Arc<Self::LocalTrack>,
    ) -> Result<Arc<Self::Sender>, EngineError> {
        let sender = self.pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>).await?;
        Ok(Arc::new(WebRtcSender { sender }))
    }

    async fn remove_track(&self, sender: &Arc<Self::Sender>) -> Result<(), EngineError> {
        self.pc.remove_track(&sender.sender).await?;
        Ok(())
    }

    async fn write_rtcp(&self, feedback: RtcpFeedback, media_ssrc: u32) -> Result<(), EngineError> {
        let packet: Box<dyn webrtc::rtcp::packet::Packet + Send + Sync> = match feedback {
            RtcpFeedback::PictureLossIndication => Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            }),
            RtcpFeedback::FullIntraRequest => Box::new(FullIntraRequest {
                sender_ssrc: 0,
                media_ssrc,
                fir: vec![FirEntry {
                    ssrc: media_ssrc,
                    sequence_number: self.fir_sequence.fetch_add(1, Ordering::Relaxed),
                }],
            }),
        };
        self.pc.write_rtcp(&[packet]).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await?;
        Ok(())
    }

    fn observe(&self, observer: Weak<dyn ConnectionObserver<Self>>) {
        let target = observer.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let target = target.clone();
                Box::pin(async move {
                    let Some(observer) = target.upgrade() else { return };
                    let candidate = match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => Some(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }),
                            Err(e) => {
                                debug!(error = %e, "Failed to serialize ICE candidate");
                                return;
                            }
                        },
                        None => None,
                    };
                    observer.on_ice_candidate(candidate).await;
                })
            }));

        let target = observer.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let target = target.clone();
            Box::pin(async move {
                if let Some(observer) = target.upgrade() {
                    observer.on_negotiation_needed().await;
                }
            })
        }));

        let target = observer.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer.on_ice_connection_state_change(state.into()).await;
                    }
                })
            }));

        let target = observer.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer.on_ice_gathering_state_change(state.into()).await;
                    }
                })
            }));

        let target = observer.clone();
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer.on_signaling_state_change(state.into()).await;
                    }
                })
            }));

        let target = observer.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer.on_connection_state_change(state.into()).await;
                    }
                })
            }));

        let target = observer.clone();
        self.pc
            .on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer.on_track(Arc::new(WebRtcRemoteTrack::new(track))).await;
                    }
                })
            }));

        let target = observer;
        self.pc
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let target = target.clone();
                Box::pin(async move {
                    if let Some(observer) = target.upgrade() {
                        observer
                            .on_data_channel(Arc::new(WebRtcDataChannel { channel }))
                            .await;
                    }
                })
            }));
    }
}

/// Inbound `TrackRemote`
pub struct WebRtcRemoteTrack {
    track: Arc<TrackRemote>,
    info: TrackInfo,
}

impl WebRtcRemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let info = TrackInfo::new(
            from_rtc_codec(&track.codec().capability),
            track.id(),
            track.stream_id(),
        );
        Self { track, info }
    }
}

#[async_trait]
impl RemoteTrack for WebRtcRemoteTrack {
    fn info(&self) -> TrackInfo {
        self.info.clone()
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let (packet, _) = self.track.read(buf).await.map_err(read_error)?;
        // Re-marshal so the caller gets exactly the bytes of one packet
        let raw = packet
            .marshal()
            .map_err(|e| ReadError::Failed(EngineError::new(e.to_string())))?;
        if raw.len() > buf.len() {
            return Err(ReadError::Failed(EngineError::new(format!(
                "RTP packet of {} bytes exceeds read buffer of {} bytes",
                raw.len(),
                buf.len()
            ))));
        }
        buf[..raw.len()].copy_from_slice(&raw);
        Ok(raw.len())
    }
}

/// Relay track bound to every connection it is added to.
///
/// Each negotiated sender binds the track once; a packet is rewritten to the
/// SSRC and payload type of every binding and written to it. Bindings go away
/// when their sender stops.
pub struct WebRtcLocalTrack {
    info: TrackInfo,
    codec: RTCRtpCodecCapability,
    bindings: Mutex<Vec<RelayBinding>>,
}

#[derive(Clone)]
struct RelayBinding {
    id: String,
    ssrc: SSRC,
    payload_type: PayloadType,
    writer: Arc<dyn TrackLocalWriter + Send + Sync>,
}

impl WebRtcLocalTrack {
    fn new(info: &TrackInfo) -> Self {
        Self {
            info: info.clone(),
            codec: to_rtc_codec(&info.codec),
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Number of senders currently bound to the track
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    fn find_codec(&self, offered: &[RTCRtpCodecParameters]) -> Option<RTCRtpCodecParameters> {
        let same_mime = |c: &&RTCRtpCodecParameters| {
            c.capability
                .mime_type
                .eq_ignore_ascii_case(&self.codec.mime_type)
        };
        offered
            .iter()
            .filter(same_mime)
            .find(|c| c.capability.sdp_fmtp_line == self.codec.sdp_fmtp_line)
            .or_else(|| offered.iter().find(same_mime))
            .cloned()
    }
}

#[async_trait]
impl TrackLocal for WebRtcLocalTrack {
    async fn bind(&self, t: &TrackLocalContext) -> webrtc::error::Result<RTCRtpCodecParameters> {
        let codec = self
            .find_codec(t.codec_parameters())
            .ok_or(webrtc::Error::ErrUnsupportedCodec)?;
        let writer = t.write_stream().ok_or(webrtc::Error::ErrClosedPipe)?;

        self.bindings.lock().push(RelayBinding {
            id: t.id(),
            ssrc: t.ssrc(),
            payload_type: codec.payload_type,
            writer,
        });
        debug!(track_id = %self.info.track_id, binding = %t.id(), "Relay track bound");
        Ok(codec)
    }

    async fn unbind(&self, t: &TrackLocalContext) -> webrtc::error::Result<()> {
        let id = t.id();
        let mut bindings = self.bindings.lock();
        let before = bindings.len();
        bindings.retain(|b| b.id != id);
        if bindings.len() == before {
            return Err(webrtc::Error::ErrUnbindFailed);
        }
        Ok(())
    }

    fn id(&self) -> &str {
        self.info.track_id.as_str()
    }

    fn stream_id(&self) -> &str {
        &self.info.stream_id
    }

    fn kind(&self) -> RTPCodecType {
        RTPCodecType::from(self.codec.mime_type.as_str())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl LocalTrack for WebRtcLocalTrack {
    fn info(&self) -> TrackInfo {
        self.info.clone()
    }

    async fn write(&self, mut packet: &[u8]) -> Result<usize, WriteError> {
        let bindings = self.bindings.lock().clone();
        if bindings.is_empty() {
            return Err(WriteError::NoConsumer);
        }

        let size = packet.len();
        let mut rtp = Packet::unmarshal(&mut packet)
            .map_err(|e| WriteError::Failed(EngineError::new(e.to_string())))?;

        let mut accepted = 0usize;
        let mut failure = None;
        for binding in &bindings {
            rtp.header.ssrc = binding.ssrc;
            rtp.header.payload_type = binding.payload_type;
            match binding.writer.write_rtp(&rtp).await {
                Ok(_) => accepted += 1,
                Err(e) if is_closed_pipe(&e) => {
                    debug!(
                        track_id = %self.info.track_id,
                        binding = %binding.id,
                        "Relay binding closed"
                    );
                }
                Err(e) => failure = Some(e),
            }
        }

        if accepted > 0 {
            return Ok(size);
        }
        match failure {
            Some(e) => Err(WriteError::Failed(e.into())),
            None => Err(WriteError::NoConsumer),
        }
    }
}

/// `RTCRtpSender` of a relay track on one connection
pub struct WebRtcSender {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl RtpSender for WebRtcSender {
    async fn read_rtcp(&self) -> Result<Vec<RtcpFeedback>, ReadError> {
        let (packets, _) = self.sender.read_rtcp().await.map_err(read_error)?;

        let feedback = packets
            .iter()
            .filter_map(|packet| {
                let packet = packet.as_any();
                if packet.downcast_ref::<PictureLossIndication>().is_some() {
                    Some(RtcpFeedback::PictureLossIndication)
                } else if packet.downcast_ref::<FullIntraRequest>().is_some() {
                    Some(RtcpFeedback::FullIntraRequest)
                } else {
                    None
                }
            })
            .collect();
        Ok(feedback)
    }
}

pub struct WebRtcDataChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    async fn send_text(&self, text: String) -> Result<(), EngineError> {
        self.channel.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.channel.close().await?;
        Ok(())
    }

    fn observe(&self, observer: Arc<dyn DataChannelObserver>) {
        let target = Arc::clone(&observer);
        self.channel.on_open(Box::new(move || {
            target.on_open();
            Box::pin(async {})
        }));

        let target = Arc::clone(&observer);
        self.channel.on_message(Box::new(move |message: DataChannelMessage| {
            let frame = if message.is_string {
                DataChannelFrame::Text(String::from_utf8_lossy(&message.data).into_owned())
            } else {
                DataChannelFrame::Binary(message.data)
            };
            target.on_message(frame);
            Box::pin(async {})
        }));

        let target = Arc::clone(&observer);
        self.channel.on_error(Box::new(move |error: webrtc::Error| {
            target.on_error(error.into());
            Box::pin(async {})
        }));

        let target = observer;
        self.channel.on_close(Box::new(move || {
            target.on_close();
            Box::pin(async {})
        }));
    }
}

fn read_error(err: webrtc::Error) -> ReadError {
    match err {
        webrtc::Error::ErrClosedPipe
        | webrtc::Error::ErrConnectionClosed
        | webrtc::Error::Util(webrtc::util::Error::ErrBufferClosed) => ReadError::EndOfStream,
        err => ReadError::Failed(err.into()),
    }
}

/// A sender that stopped reports `ErrClosedPipe`, possibly wrapped by the
/// interceptor chain
fn is_closed_pipe(err: &webrtc::Error) -> bool {
    match err {
        webrtc::Error::ErrClosedPipe => true,
        webrtc::Error::Interceptor(webrtc::interceptor::Error::Util(inner)) => inner
            .downcast_ref::<webrtc::Error>()
            .is_some_and(is_closed_pipe),
        _ => false,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, EngineError> {
    let description = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            rollback
        }
    };
    Ok(description)
}

impl From<RTCSessionDescription> for SessionDescription {
    fn from(description: RTCSessionDescription) -> Self {
        let sdp_type = match description.sdp_type {
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
        };
        Self {
            sdp_type,
            sdp: description.sdp,
        }
    }
}

fn to_rtc_codec(codec: &CodecCapability) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
        rtcp_feedback: codec
            .rtcp_feedback
            .iter()
            .map(|fb| RTCPFeedback {
                typ: fb.typ.clone(),
                parameter: fb.parameter.clone(),
            })
            .collect(),
    }
}

fn from_rtc_codec(codec: &RTCRtpCodecCapability) -> CodecCapability {
    CodecCapability {
        mime_type: codec.mime_type.clone(),
        clock_rate: codec.clock_rate,
        channels: codec.channels,
        sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
        rtcp_feedback: codec
            .rtcp_feedback
            .iter()
            .map(|fb| RtcpFeedbackCapability {
                typ: fb.typ.clone(),
                parameter: fb.parameter.clone(),
            })
            .collect(),
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for IceConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => Self::New,
            RTCIceConnectionState::Checking => Self::Checking,
            RTCIceConnectionState::Connected => Self::Connected,
            RTCIceConnectionState::Completed => Self::Completed,
            RTCIceConnectionState::Disconnected => Self::Disconnected,
            RTCIceConnectionState::Failed => Self::Failed,
            RTCIceConnectionState::Closed => Self::Closed,
        }
    }
}

impl From<RTCIceGathererState> for IceGatheringState {
    fn from(state: RTCIceGathererState) -> Self {
        match state {
            RTCIceGathererState::Unspecified | RTCIceGathererState::New => Self::New,
            RTCIceGathererState::Gathering => Self::Gathering,
            RTCIceGathererState::Complete | RTCIceGathererState::Closed => Self::Complete,
        }
    }
}

impl From<RTCSignalingState> for SignalingState {
    fn from(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => Self::Stable,
            RTCSignalingState::HaveLocalOffer => Self::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => Self::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => Self::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => Self::HaveRemotePranswer,
            RTCSignalingState::Closed => Self::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp8() -> CodecCapability {
        CodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![RtcpFeedbackCapability {
                typ: "nack".to_string(),
                parameter: "pli".to_string(),
            }],
        }
    }

    #[test]
    fn test_codec_conversion_keeps_feedback() {
        let rtc = to_rtc_codec(&vp8());
        assert_eq!(rtc.mime_type, "video/VP8");
        assert_eq!(rtc.rtcp_feedback.len(), 1);
        assert_eq!(from_rtc_codec(&rtc), vp8());
    }

    #[test]
    fn test_state_conversions() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(
            IceConnectionState::from(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
        assert_eq!(
            IceGatheringState::from(RTCIceGathererState::Complete),
            IceGatheringState::Complete
        );
        assert_eq!(
            SignalingState::from(RTCSignalingState::HaveRemoteOffer),
            SignalingState::HaveRemoteOffer
        );
    }

    #[test]
    fn test_closed_pipe_is_end_of_stream() {
        assert_eq!(read_error(webrtc::Error::ErrClosedPipe), ReadError::EndOfStream);
        assert!(matches!(
            read_error(webrtc::Error::new("boom".to_string())),
            ReadError::Failed(_)
        ));
    }

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Accept,
        Closed,
        ClosedByInterceptor,
        Fail,
    }

    #[derive(Debug)]
    struct ScriptedWriter {
        outcome: Outcome,
        written: Mutex<Vec<(u32, u8)>>,
    }

    #[async_trait]
    impl TrackLocalWriter for ScriptedWriter {
        async fn write_rtp(&self, p: &Packet) -> webrtc::error::Result<usize> {
            match self.outcome {
                Outcome::Accept => {
                    self.written.lock().push((p.header.ssrc, p.header.payload_type));
                    Ok(p.payload.len())
                }
                Outcome::Closed => Err(webrtc::Error::ErrClosedPipe),
                Outcome::ClosedByInterceptor => Err(webrtc::interceptor::Error::from(
                    webrtc::Error::ErrClosedPipe,
                )
                .into()),
                Outcome::Fail => Err(webrtc::Error::new("srtp session failed".to_string())),
            }
        }

        async fn write(&self, mut b: &[u8]) -> webrtc::error::Result<usize> {
            let packet = Packet::unmarshal(&mut b)?;
            self.write_rtp(&packet).await
        }
    }

    fn bind_writer(track: &WebRtcLocalTrack, ssrc: u32, outcome: Outcome) -> Arc<ScriptedWriter> {
        let writer = Arc::new(ScriptedWriter {
            outcome,
            written: Mutex::new(Vec::new()),
        });
        track.bindings.lock().push(RelayBinding {
            id: format!("binding-{ssrc}"),
            ssrc,
            payload_type: 100,
            writer: Arc::clone(&writer) as Arc<dyn TrackLocalWriter + Send + Sync>,
        });
        writer
    }

    const PACKET: [u8; 14] = [0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 7, 0xde, 0xad];

    #[test]
    fn test_closed_pipe_detected_through_interceptor() {
        assert!(is_closed_pipe(&webrtc::Error::ErrClosedPipe));
        let wrapped: webrtc::Error =
            webrtc::interceptor::Error::from(webrtc::Error::ErrClosedPipe).into();
        assert!(is_closed_pipe(&wrapped));
        assert!(!is_closed_pipe(&webrtc::Error::ErrConnectionClosed));
    }

    #[tokio::test]
    async fn test_relay_track_rewrites_each_binding() {
        let track = WebRtcLocalTrack::new(&TrackInfo::new(vp8(), "cam", "stream"));
        let first = bind_writer(&track, 11, Outcome::Accept);
        let second = bind_writer(&track, 22, Outcome::Accept);

        assert_eq!(track.write(&PACKET).await, Ok(PACKET.len()));
        assert_eq!(*first.written.lock(), vec![(11, 100)]);
        assert_eq!(*second.written.lock(), vec![(22, 100)]);
    }

    #[tokio::test]
    async fn test_relay_track_closed_bindings_have_no_consumer() {
        let track = WebRtcLocalTrack::new(&TrackInfo::new(vp8(), "cam", "stream"));
        bind_writer(&track, 11, Outcome::Closed);
        bind_writer(&track, 22, Outcome::ClosedByInterceptor);

        assert_eq!(track.write(&PACKET).await, Err(WriteError::NoConsumer));
    }

    #[tokio::test]
    async fn test_relay_track_live_binding_outweighs_failures() {
        let track = WebRtcLocalTrack::new(&TrackInfo::new(vp8(), "cam", "stream"));
        bind_writer(&track, 11, Outcome::Closed);
        bind_writer(&track, 22, Outcome::Fail);
        let live = bind_writer(&track, 33, Outcome::Accept);

        assert_eq!(track.write(&PACKET).await, Ok(PACKET.len()));
        assert_eq!(live.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_relay_track_reports_engine_failure() {
        let track = WebRtcLocalTrack::new(&TrackInfo::new(vp8(), "cam", "stream"));
        bind_writer(&track, 11, Outcome::Closed);
        bind_writer(&track, 22, Outcome::Fail);

        assert!(matches!(track.write(&PACKET).await, Err(WriteError::Failed(_))));
    }

    #[tokio::test]
    async fn test_relay_track_unbound_until_negotiated() {
        let engine = WebRtcEngine::new(&WebRtcConfig::default()).unwrap();
        let connection = engine.new_connection().await.unwrap();
        let track = connection
            .new_local_track(&TrackInfo::new(vp8(), "cam", "stream"))
            .unwrap();

        assert_eq!(track.write(&PACKET).await, Err(WriteError::NoConsumer));

        let sender = connection.add_track(Arc::clone(&track)).await.unwrap();
        assert_eq!(track.binding_count(), 0);
        assert_eq!(track.write(&PACKET).await, Err(WriteError::NoConsumer));

        connection.remove_track(&sender).await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(connection.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_offer_round_trips_through_connection() {
        let engine = WebRtcEngine::new(&WebRtcConfig::default()).unwrap();
        let connection = engine.new_connection().await.unwrap();
        let track = connection
            .new_local_track(&TrackInfo::new(vp8(), "cam", "stream"))
            .unwrap();
        connection.add_track(track).await.unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        connection.set_local_description(offer).await.unwrap();

        connection.close().await.unwrap();
    }
}
