//! Host session backed by the `webrtc` crate

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::host::{HostError, HostEvent, HostEventSink, HostFactory, HostSession};
use super::types::{
    IceCandidate, LocalTrack, PeerConnectionState, RemoteTrack, SdpType, SessionDescription, TrackKind,
    WebRtcConfig,
};

const DATA_CHANNEL_LABEL: &str = "duet";

/// A 20 ms Opus packet that decodes to silence.
const SILENT_OPUS_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME_DURATION: Duration = Duration::from_millis(20);

struct LocalSender {
    track_id: String,
    sender: Arc<RTCRtpSender>,
    track: Arc<TrackLocalStaticSample>,
    stop: Arc<AtomicBool>,
}

/// Keep an audio track flowing with silence until `stop` is set, so the
/// remote side sees the track without a real capture device.
fn spawn_silence(track: Arc<TrackLocalStaticSample>, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        while !stop.load(Ordering::Relaxed) {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(&SILENT_OPUS_FRAME),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                trace!("Silence write on {} failed: {}", track.id(), e);
            }
        }
    });
}

/// One RTCPeerConnection with an application data channel and a
/// sample-fed local track per [`LocalTrack`].
pub struct WebRtcHost {
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    senders: Mutex<Vec<LocalSender>>,
    silence: bool,
}

impl WebRtcHost {
    pub async fn new(config: &WebRtcConfig, events: HostEventSink) -> Result<Self, HostError> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        Self::setup_handlers(&pc, &events);

        let data_channel = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
        Self::setup_data_channel(&data_channel, &events, true);

        Ok(Self {
            pc,
            data_channel,
            senders: Mutex::new(Vec::new()),
            silence: config.silence,
        })
    }

    /// The sample track behind a local track, for feeding media.
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .iter()
            .find(|s| s.track_id == track_id)
            .map(|s| s.track.clone())
    }

    fn setup_handlers(pc: &Arc<RTCPeerConnection>, events: &HostEventSink) {
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => {
                            warn!("Failed to encode local candidate: {}", e);
                            return;
                        }
                    },
                    None => None,
                };
                sink.emit(HostEvent::IceCandidate(candidate));
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                info!("Peer connection state: {}", state);
                let state = match state {
                    RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                    RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
                    _ => PeerConnectionState::New,
                };
                sink.emit(HostEvent::ConnectionState(state));
            })
        }));

        let sink = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(HostEvent::NegotiationNeeded);
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    let remote = RemoteTrack {
                        id: track.id(),
                        kind,
                        stream_id: track.stream_id(),
                    };
                    debug!("Remote {} track {} started", remote.kind, remote.id);
                    sink.emit(HostEvent::RemoteTrack(remote.clone()));

                    // The track is gone once its RTP stream ends.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        debug!("Remote track {} ended", remote.id);
                        sink.emit(HostEvent::RemoteTrackRemoved(remote.id));
                    });
                })
            },
        ));

        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                info!("Received data channel '{}'", dc.label());
                Self::setup_data_channel(&dc, &sink, false);
            })
        }));
    }

    fn setup_data_channel(dc: &Arc<RTCDataChannel>, events: &HostEventSink, own: bool) {
        if own {
            let sink = events.clone();
            let label = dc.label().to_string();
            dc.on_open(Box::new(move || {
                let sink = sink.clone();
                let label = label.clone();
                Box::pin(async move {
                    info!("Data channel '{}' open", label);
                    sink.emit(HostEvent::DataChannelOpen);
                })
            }));
        }

        let sink = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    trace!("Ignoring {} byte binary message", msg.data.len());
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => sink.emit(HostEvent::DataMessage(text)),
                    Err(e) => warn!("Non-UTF-8 data channel message: {}", e),
                }
            })
        }));
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, HostError> {
    Ok(match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl HostSession for WebRtcHost {
    async fn create_offer(&self) -> Result<SessionDescription, HostError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, HostError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), HostError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), HostError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), HostError> {
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), HostError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), HostError> {
        if self.senders.lock().iter().any(|s| s.track_id == track.id) {
            return Ok(());
        }

        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind),
            track.id.clone(),
            track.stream_id.clone(),
        ));
        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let stop = Arc::new(AtomicBool::new(false));
        if self.silence && track.kind == TrackKind::Audio {
            spawn_silence(local.clone(), stop.clone());
        }

        debug!("Attached local {} track {}", track.kind, track.id);
        self.senders.lock().push(LocalSender {
            track_id: track.id.clone(),
            sender,
            track: local,
            stop,
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), HostError> {
        let removed = {
            let mut senders = self.senders.lock();
            senders
                .iter()
                .position(|s| s.track_id == track_id)
                .map(|i| senders.remove(i))
        };

        if let Some(local) = removed {
            local.stop.store(true, Ordering::Relaxed);
            self.pc.remove_track(&local.sender).await?;
            debug!("Detached local track {}", track_id);
        }
        Ok(())
    }

    async fn sender_track_ids(&self) -> Vec<String> {
        self.senders.lock().iter().map(|s| s.track_id.clone()).collect()
    }

    async fn send_data(&self, text: &str) -> Result<(), HostError> {
        if self.data_channel.ready_state() != RTCDataChannelState::Open {
            return Err(HostError::NotConnected);
        }
        self.data_channel.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn close(&self) {
        for local in self.senders.lock().iter() {
            local.stop.store(true, Ordering::Relaxed);
        }
        if let Err(e) = self.data_channel.close().await {
            debug!("Data channel close: {}", e);
        }
        if let Err(e) = self.pc.close().await {
            warn!("Peer connection close: {}", e);
        }
    }
}

/// Creates [`WebRtcHost`]s sharing one [`WebRtcConfig`].
#[derive(Clone, Default)]
pub struct WebRtcHostFactory {
    config: WebRtcConfig,
}

impl WebRtcHostFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl HostFactory for WebRtcHostFactory {
    async fn create(&self, events: HostEventSink) -> Result<Arc<dyn HostSession>, HostError> {
        Ok(Arc::new(WebRtcHost::new(&self.config, events).await?))
    }
}
