//! WebRTC signaling over a per-device WebSocket: offer/answer, trickled ICE
//! candidates in both directions, and ping/pong keepalive. One socket per
//! browser tab; each gets its own `WebRtcTransport` and its own video/audio
//! subscriptions against the shared `Source`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use screenbridge_core::pipeline::next_subscriber_id;
use screenbridge_core::webrtc::{run_audio_forward_loop, run_video_forward_loop, WebRtcTransport};
use screenbridge_core::Source;
use screenbridge_protocol::{IceConfig, SignalingMessage};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time to wait for a pong before considering the connection dead.
/// Allows 3 missed pings (3 * 30s = 90s).
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Drive one browser's signaling socket end to end: build the transport,
/// relay trickled ICE candidates out, accept the offer and subscribe the
/// pipelines in, and clean up on disconnect.
pub async fn handle_device_ws(mut socket: WebSocket, serial: String, source: Arc<Source>, ice: IceConfig) {
    tracing::info!(%serial, "device signaling socket connected");

    let transport = match WebRtcTransport::new(&ice).await {
        Ok(t) => Arc::new(t),
        Err(e) => {
            tracing::warn!(%serial, error = %e, "failed to build webrtc transport");
            let msg = SignalingMessage::Error { message: e.to_string() };
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            return;
        }
    };

    let (ice_tx, mut ice_rx) = mpsc::unbounded_channel::<SignalingMessage>();
    transport.on_ice_candidate(move |msg| {
        let _ = ice_tx.send(msg);
    });

    transport.start_rtcp_reader(Arc::clone(&source));
    transport.bind_control_channel(Arc::clone(&source));

    let video_id = next_subscriber_id();
    let audio_id = next_subscriber_id();
    let video_rx = source.subscribe_video(video_id).await;
    let audio_rx = source.subscribe_audio(audio_id).await;
    source.request_keyframe().await;
    tokio::spawn(run_video_forward_loop(Arc::clone(&source), Arc::clone(&transport), video_rx));
    tokio::spawn(run_audio_forward_loop(Arc::clone(&transport), audio_rx));

    let ready = SignalingMessage::Ready { device_id: serial.clone() };
    if let Ok(json) = serde_json::to_string(&ready) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%serial, "device signaling ping timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    tracing::debug!(%serial, "device signaling ping send failed");
                    break;
                }
            }
            Some(candidate) = ice_rx.recv() => {
                let Ok(json) = serde_json::to_string(&candidate) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%serial, "device signaling candidate send failed");
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(SignalingMessage::Offer { sdp }) => {
                                match transport.handle_offer(&sdp).await {
                                    Ok(answer_sdp) => {
                                        let answer = SignalingMessage::Answer { sdp: answer_sdp };
                                        if let Ok(json) = serde_json::to_string(&answer) {
                                            if socket.send(Message::Text(json.into())).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!(%serial, error = %e, "failed to handle offer");
                                        let err = SignalingMessage::Error { message: e.to_string() };
                                        if let Ok(json) = serde_json::to_string(&err) {
                                            let _ = socket.send(Message::Text(json.into())).await;
                                        }
                                    }
                                }
                            }
                            Ok(SignalingMessage::IceCandidate { candidate, sdp_mid, sdp_mline_index }) => {
                                if let Err(e) = transport.add_ice_candidate(&candidate, sdp_mid, sdp_mline_index).await {
                                    tracing::warn!(%serial, error = %e, "failed to add ice candidate");
                                }
                            }
                            Ok(other) => {
                                tracing::debug!(%serial, ?other, "ignoring unexpected signaling message from browser");
                            }
                            Err(e) => {
                                tracing::warn!(%serial, error = %e, "invalid signaling message");
                            }
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%serial, "device signaling socket closed by browser");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%serial, error = %e, "device signaling socket error");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    source.unsubscribe_video(video_id).await;
    source.unsubscribe_audio(audio_id).await;
    transport.close().await;

    tracing::info!(%serial, "device signaling socket disconnected");
}
