//! WebRTC transport: peer-connection setup, video/audio forwarding from a
//! Source's pipelines, and the control DataChannel.
//!
//! Peer-connection construction (codec registration, fmtp lines, track
//! creation) and the RTCP PLI/FIR reader are carried over from the
//! screen-capture agent's `peer.rs` almost unchanged; the forwarding loop
//! is rebuilt from scratch since there is no local encoder to wait on or
//! reset here — the device already produced Annex-B H.264, so "forward"
//! means "prime with cached SPS/PPS, then hand samples to the track."

use crate::error::{Result, StreamError};
use crate::pipeline::{AudioSample, VideoSample};
use crate::source::Source;
use bytes::Bytes;
use screenbridge_protocol::config::IceConfig;
use screenbridge_protocol::control::OutboundControlReply;
use screenbridge_protocol::signaling::SignalingMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f";
const MAX_VIDEO_SAMPLE_DURATION: Duration = Duration::from_millis(33);
const AUDIO_SAMPLE_DURATION: Duration = Duration::from_millis(20);

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

fn rtc_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = vec![RTCIceServer {
        urls: ice.stun_urls.clone(),
        ..Default::default()
    }];
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone().unwrap_or_default(),
            credential: ice.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

/// One client's WebRTC session against a Source: peer connection, tracks,
/// and the control DataChannel once the client opens it.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    video_sender: Arc<RTCRtpSender>,
    control_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    pub generation: u64,
}

impl WebRtcTransport {
    pub async fn new(ice: &IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        let h264_feedback = vec![
            RTCPFeedback { typ: "goog-remb".into(), parameter: "".into() },
            RTCPFeedback { typ: "ccm".into(), parameter: "fir".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "".into() },
            RTCPFeedback { typ: "nack".into(), parameter: "pli".into() },
        ];

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: H264_FMTP.to_string(),
                        rtcp_feedback: h264_feedback,
                    },
                    payload_type: 125,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )
            .map_err(|e| StreamError::Setup(format!("failed to register H.264 codec: {e}")))?;

        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_string(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| StreamError::Setup(format!("failed to register Opus codec: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| StreamError::Setup(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| StreamError::Setup(format!("failed to create peer connection: {e}")))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                sdp_fmtp_line: H264_FMTP.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "screenbridge".to_string(),
        ));

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "screenbridge".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| StreamError::Setup(format!("failed to add video track: {e}")))?;

        peer_connection
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| StreamError::Setup(format!("failed to add audio track: {e}")))?;

        // Never close the peer connection on failure: a fresh offer from the
        // same client can restart ICE, but a closed peer is unrecoverable.
        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Failed => warn!("webrtc peer connection failed"),
                RTCPeerConnectionState::Disconnected => warn!("webrtc peer connection disconnected, ICE reconnecting"),
                _ => debug!(?state, "webrtc peer connection state changed"),
            }
            Box::pin(async {})
        }));

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Self {
            peer_connection,
            video_track,
            audio_track,
            video_sender,
            control_channel: Mutex::new(None),
            generation,
        })
    }

    pub async fn handle_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| StreamError::Protocol(format!("invalid SDP offer: {e}")))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| StreamError::Protocol(format!("failed to set remote description: {e}")))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| StreamError::Protocol(format!("failed to create answer: {e}")))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| StreamError::Protocol(format!("failed to set local description: {e}")))?;

        Ok(answer.sdp)
    }

    pub async fn add_ice_candidate(
        &self,
        candidate: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.to_string(),
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| StreamError::Protocol(format!("failed to add ICE candidate: {e}")))
    }

    pub fn on_ice_candidate(&self, callback: impl Fn(SignalingMessage) + Send + Sync + 'static) {
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => callback(SignalingMessage::IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(e) => warn!(error = %e, "failed to serialize ICE candidate"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Keyframe requests from the browser (packet loss recovery) are routed
    /// straight to the Source's control socket.
    pub fn start_rtcp_reader(&self, source: Arc<Source>) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any
                        .is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        info!("received PLI/FIR, requesting keyframe");
                        source.request_keyframe().await;
                    }
                }
            }
        });
    }

    /// Accept the client-initiated "control" DataChannel and bind it to the
    /// control handler once open.
    pub fn bind_control_channel(self: &Arc<Self>, source: Arc<Source>) {
        let this = Arc::clone(self);
        self.peer_connection.on_data_channel(Box::new(move |dc| {
            let this = Arc::clone(&this);
            let source = Arc::clone(&source);
            Box::pin(async move {
                if dc.label() != "control" {
                    return;
                }
                {
                    let mut slot = this.control_channel.lock().await;
                    *slot = Some(Arc::clone(&dc));
                }
                dc.on_message(Box::new(move |msg| {
                    let this = Arc::clone(&this);
                    let source = Arc::clone(&source);
                    Box::pin(async move {
                        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&msg.data) else {
                            warn!("control message is not valid JSON");
                            return;
                        };
                        let now_ms = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        if let Some(reply) = crate::control::handle_inbound(&source, &value, now_ms).await {
                            this.send_control_reply(&reply).await;
                        }
                    })
                }));
            })
        }));
    }

    async fn send_control_reply(&self, reply: &OutboundControlReply) {
        let Ok(text) = serde_json::to_string(reply) else { return };
        if let Some(dc) = self.control_channel.lock().await.as_ref() {
            if let Err(e) = dc.send_text(text).await {
                warn!(error = %e, "failed to send control reply");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }

    pub async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            warn!(error = %e, "failed to close peer connection");
        }
    }
}

/// Forward a Source's video pipeline to a transport's video track, priming
/// with cached SPS/PPS on the first key-frame per §4.9.
pub async fn run_video_forward_loop(
    source: Arc<Source>,
    transport: Arc<WebRtcTransport>,
    mut rx: mpsc::Receiver<VideoSample>,
) {
    let mut primed = false;
    let mut last_pts: Option<i64> = None;

    while let Some(sample) = rx.recv().await {
        if !transport.is_connected() {
            continue;
        }

        if !primed {
            if !sample.is_key {
                continue;
            }
            if let Some((sps, pps)) = source.get_sps_pps().await {
                write_zero_duration_nal(&transport.video_track, sps).await;
                write_zero_duration_nal(&transport.video_track, pps).await;
            }
            primed = true;
        }

        let duration = match last_pts {
            Some(last) => Duration::from_micros((sample.pts_us - last).max(0) as u64).min(MAX_VIDEO_SAMPLE_DURATION),
            None => MAX_VIDEO_SAMPLE_DURATION,
        };
        last_pts = Some(sample.pts_us);

        if let Err(e) = transport
            .video_track
            .write_sample(&Sample { data: sample.data, duration, ..Default::default() })
            .await
        {
            warn!(error = %e, "failed to write video sample to webrtc track");
        }
    }
}

async fn write_zero_duration_nal(track: &TrackLocalStaticSample, data: Bytes) {
    if let Err(e) = track
        .write_sample(&Sample { data, duration: Duration::ZERO, ..Default::default() })
        .await
    {
        warn!(error = %e, "failed to write parameter-set NAL to webrtc track");
    }
}

pub async fn run_audio_forward_loop(transport: Arc<WebRtcTransport>, mut rx: mpsc::Receiver<AudioSample>) {
    while let Some(sample) = rx.recv().await {
        if !transport.is_connected() {
            continue;
        }
        if let Err(e) = transport
            .audio_track
            .write_sample(&Sample { data: sample.data, duration: AUDIO_SAMPLE_DURATION, ..Default::default() })
            .await
        {
            warn!(error = %e, "failed to write audio sample to webrtc track");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_ice_servers_includes_turn_only_when_configured() {
        let ice = IceConfig {
            stun_urls: vec!["stun:stun.example.com:19302".to_string()],
            turn_urls: vec![],
            turn_username: None,
            turn_credential: None,
        };
        assert_eq!(rtc_ice_servers(&ice).len(), 1);

        let ice_with_turn = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_username: Some("user".to_string()),
            turn_credential: Some("pass".to_string()),
            ..ice
        };
        let servers = rtc_ice_servers(&ice_with_turn);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "user");
    }
}
