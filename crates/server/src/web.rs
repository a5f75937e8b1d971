//! HTTP/WebSocket surface: device discovery over ADB, Source lifecycle,
//! chunked media streaming in four container formats, WebRTC signaling
//! upgrade, and the usual health/metrics/ice-config endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use screenbridge_core::pipeline::{next_subscriber_id, ByteBroadcaster};
use screenbridge_core::{Source, SourceRegistry, StreamMode};
use screenbridge_protocol::BridgeConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::signaling;

/// Shared application state.
pub struct AppState {
    pub config: BridgeConfig,
    pub registry: SourceRegistry,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{serial}/connect", post(connect_device))
        .route("/api/devices/{serial}", delete(disconnect_device))
        .route("/api/devices/{serial}/ws", get(device_ws_upgrade))
        .route("/stream/video/{serial}", get(stream_video))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics))
        .route("/api/ice-config", get(ice_config))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(Arc::clone(&state));

    // Serve static files (configurable path, defaults to "web/dist")
    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

#[derive(Serialize)]
struct DeviceInfo {
    serial: String,
    state: String,
    model: Option<String>,
    connected: bool,
}

/// GET /api/devices - `adb devices -l`, cross-referenced against the
/// registry so the caller can tell an already-streaming device apart from
/// one that's merely plugged in.
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let output = match tokio::process::Command::new(&state.config.device.adb_path)
        .arg("devices")
        .arg("-l")
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(error = %e, "failed to run adb devices");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("adb unavailable: {e}") })),
            )
                .into_response();
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let active = screenbridge_core::list_serials(&state.registry).await;

    let mut devices = Vec::new();
    for line in stdout.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(serial) = fields.next() else { continue };
        let Some(device_state) = fields.next() else { continue };
        let model = fields
            .find_map(|f| f.strip_prefix("model:"))
            .map(|m| m.to_string());

        devices.push(DeviceInfo {
            serial: serial.to_string(),
            state: device_state.to_string(),
            model,
            connected: active.iter().any(|s| s == serial),
        });
    }

    Json(json!({ "devices": devices })).into_response()
}

#[derive(Deserialize, Default)]
struct ConnectQuery {
    mode: Option<String>,
}

fn parse_mode(mode: Option<&str>) -> StreamMode {
    match mode.unwrap_or("webrtc") {
        "webm" => StreamMode::WebM,
        "mp4" => StreamMode::Mp4,
        "h264" => StreamMode::H264,
        "mse" => StreamMode::Mse,
        _ => StreamMode::WebRtc,
    }
}

/// POST /api/devices/{serial}/connect - launch the on-device server and
/// attach a Source if one isn't already running for this serial.
async fn connect_device(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    let mode = parse_mode(query.mode.as_deref());
    match screenbridge_core::start_source_with_mode(
        &state.registry,
        &serial,
        state.config.device.clone(),
        state.config.stream.clone(),
        mode,
    )
    .await
    {
        Ok(source) => {
            let info = source.get_connection_info().await;
            Json(json!({
                "serial": serial,
                "connected": true,
                "width": info.as_ref().map(|i| i.width),
                "height": info.as_ref().map(|i| i.height),
            }))
            .into_response()
        }
        Err(e) => {
            tracing::warn!(serial = %serial, error = %e, "failed to connect device");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// DELETE /api/devices/{serial} - tear down the Source, if any.
async fn disconnect_device(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> impl IntoResponse {
    screenbridge_core::remove_source(&state.registry, &serial).await;
    StatusCode::NO_CONTENT
}

/// GET /api/devices/{serial}/ws - WebRTC signaling upgrade. Autostarts the
/// Source in WebRTC mode if the caller never hit `/connect` first.
async fn device_ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let source = match screenbridge_core::start_source_with_mode(
        &state.registry,
        &serial,
        state.config.device.clone(),
        state.config.stream.clone(),
        StreamMode::WebRtc,
    )
    .await
    {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(serial = %serial, error = %e, "failed to start source for signaling");
            return (
                StatusCode::BAD_GATEWAY,
                format!("failed to start device: {e}"),
            )
                .into_response();
        }
    };

    let ice = state.config.ice.clone();
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| signaling::handle_device_ws(socket, serial, source, ice))
        .into_response()
}

#[derive(Deserialize, Default)]
struct StreamQuery {
    format: Option<String>,
}

fn stream_response(content_type: &str, body: Body) -> axum::response::Response {
    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, content_type)
        .header(
            axum::http::header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate",
        )
        .header(axum::http::header::CONNECTION, "keep-alive")
        .header(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /stream/video/{serial}?format=h264|webm|mp4|mse|audio
///
/// `h264` (default) is a raw Annex-B passthrough of one client's video
/// subscription. `webm`/`mp4` mux video+audio into one body. `mse`/`audio`
/// produce an audio-only WebM body, matching the MSE audio-only variant.
async fn stream_video(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let Some(source) = screenbridge_core::get_source(&state.registry, &serial).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "device not connected" })),
        )
            .into_response();
    };

    let queue_depth = state.config.stream.byte_queue_depth;
    let format = query.format.as_deref().unwrap_or("h264");

    match format {
        "h264" => {
            let id = next_subscriber_id();
            let rx = source.subscribe_video(id).await;
            let stream = ReceiverStream::new(rx).map(|s| Ok::<Bytes, std::io::Error>(s.data));
            stream_response("video/h264", Body::from_stream(stream))
        }
        "webm" => match webm_stream_body(Arc::clone(&source), queue_depth, false).await {
            Some(body) => stream_response("video/webm; codecs=avc1.42E01E,opus", body),
            None => stream_not_ready(),
        },
        "mse" | "audio" => match webm_stream_body(Arc::clone(&source), queue_depth, true).await {
            Some(body) => stream_response("audio/webm; codecs=opus", body),
            None => stream_not_ready(),
        },
        "mp4" => match mp4_stream_body(
            Arc::clone(&source),
            queue_depth,
            state.config.stream.aggregator_window_ms,
        )
        .await
        {
            Some(body) => stream_response("video/mp4", body),
            None => stream_not_ready(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown stream format '{other}'") })),
        )
            .into_response(),
    }
}

fn stream_not_ready() -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "stream not ready: no key-frame observed yet" })),
    )
        .into_response()
}

/// Mux one client's WebM body. `audio_only` omits the video track entirely
/// (the MSE audio-only variant); otherwise both tracks are muxed as frames
/// arrive, one SimpleBlock Cluster per frame.
async fn webm_stream_body(source: Arc<Source>, queue_depth: usize, audio_only: bool) -> Option<Body> {
    let video_init = if audio_only {
        None
    } else {
        let info = source.get_connection_info().await?;
        Some(screenbridge_core::webm::VideoTrackInit {
            width: info.width as u16,
            height: info.height as u16,
        })
    };
    let audio_init = screenbridge_core::webm::AudioTrackInit {
        sample_rate: 48_000.0,
        channels: 2,
    };
    let header = screenbridge_core::webm::build_header(video_init.as_ref(), Some(&audio_init));

    let video_id = next_subscriber_id();
    let audio_id = next_subscriber_id();
    let mut video_rx = if audio_only {
        None
    } else {
        let rx = source.subscribe_video(video_id).await;
        source.request_keyframe().await;
        Some(rx)
    };
    let mut audio_rx = source.subscribe_audio(audio_id).await;

    let broadcaster = Arc::new(ByteBroadcaster::new(queue_depth));
    broadcaster.set_init_segment(header).await;
    let client_id = next_subscriber_id();
    let out_rx = broadcaster.subscribe(client_id).await;

    tokio::spawn(async move {
        let mut muxer = screenbridge_core::webm::Muxer::new();
        let mut video_closed = video_rx.is_none();
        let mut audio_closed = false;

        loop {
            tokio::select! {
                sample = async { video_rx.as_mut().unwrap().recv().await }, if !video_closed => {
                    match sample {
                        Some(s) => {
                            if let Some(bytes) = muxer.write_video_frame(&s.data, s.is_key) {
                                broadcaster.broadcast(bytes).await;
                            }
                        }
                        None => video_closed = true,
                    }
                }
                sample = audio_rx.recv(), if !audio_closed => {
                    match sample {
                        Some(s) => {
                            if let Some(bytes) = muxer.write_audio_frame(&s.data) {
                                broadcaster.broadcast(bytes).await;
                            }
                        }
                        None => audio_closed = true,
                    }
                }
                else => break,
            }
            if video_closed && audio_closed {
                break;
            }
            if broadcaster.subscriber_count().await == 0 {
                break;
            }
        }

        broadcaster.unsubscribe(client_id).await;
        if !audio_only {
            source.unsubscribe_video(video_id).await;
        }
        source.unsubscribe_audio(audio_id).await;
    });

    Some(Body::from_stream(
        ReceiverStream::new(out_rx).map(Ok::<Bytes, std::io::Error>),
    ))
}

/// Mux one client's fragmented MP4 body. Samples are batched for
/// `aggregator_window_ms` before each fragment is flushed, per the config's
/// batching knob. Requires a cached SPS/PPS pair (i.e. at least one
/// key-frame observed); returns `None` otherwise so the caller can answer
/// 503 rather than emit a moov with no parameter sets.
async fn mp4_stream_body(source: Arc<Source>, queue_depth: usize, aggregator_window_ms: u64) -> Option<Body> {
    let (sps, pps) = source.get_sps_pps().await?;
    let info = source.get_connection_info().await?;
    let audio_config = source.get_audio_config().await;
    let has_audio = audio_config.is_some();

    let video_init = screenbridge_core::fmp4::VideoTrackInit {
        width: info.width as u16,
        height: info.height as u16,
        sps,
        pps,
    };
    let audio_init = audio_config.map(|audio_specific_config| screenbridge_core::fmp4::AudioTrackInit {
        audio_specific_config,
        channels: 2,
        sample_rate: 44_100,
    });
    let init_segment = screenbridge_core::fmp4::build_init_segment(&video_init, audio_init.as_ref());

    let video_id = next_subscriber_id();
    let audio_id = next_subscriber_id();
    let mut video_rx = source.subscribe_video(video_id).await;
    source.request_keyframe().await;
    let mut audio_rx = source.subscribe_audio(audio_id).await;

    let broadcaster = Arc::new(ByteBroadcaster::new(queue_depth));
    broadcaster.set_init_segment(init_segment).await;
    let client_id = next_subscriber_id();
    let out_rx = broadcaster.subscribe(client_id).await;

    tokio::spawn(async move {
        let mut writer = screenbridge_core::fmp4::FragmentWriter::new(video_init.sps.clone(), video_init.pps.clone());
        let mut buffer: Vec<screenbridge_core::fmp4::FragmentSample> = Vec::new();
        let mut flush = tokio::time::interval(Duration::from_millis(aggregator_window_ms.max(1)));
        flush.tick().await; // consume the immediate first tick
        let mut video_closed = false;
        let mut audio_closed = !has_audio;

        loop {
            tokio::select! {
                sample = video_rx.recv(), if !video_closed => {
                    match sample {
                        Some(s) => buffer.push(screenbridge_core::fmp4::FragmentSample {
                            track: screenbridge_core::fmp4::TrackKind::Video,
                            data: s.data,
                            dts: (s.pts_us.max(0) as u64 * 90) / 1000,
                            is_key: s.is_key,
                        }),
                        None => video_closed = true,
                    }
                }
                sample = audio_rx.recv(), if !audio_closed => {
                    match sample {
                        Some(s) => buffer.push(screenbridge_core::fmp4::FragmentSample {
                            track: screenbridge_core::fmp4::TrackKind::Audio,
                            data: s.data,
                            dts: (s.pts_us.max(0) as u64 * 48) / 1000,
                            is_key: true,
                        }),
                        None => audio_closed = true,
                    }
                }
                _ = flush.tick() => {
                    if !buffer.is_empty() {
                        if let Some(bytes) = writer.write_fragment(std::mem::take(&mut buffer)) {
                            broadcaster.broadcast(bytes).await;
                        }
                    }
                }
            }
            if video_closed && audio_closed && buffer.is_empty() {
                break;
            }
            if broadcaster.subscriber_count().await == 0 {
                break;
            }
        }

        broadcaster.unsubscribe(client_id).await;
        source.unsubscribe_video(video_id).await;
        if has_audio {
            source.unsubscribe_audio(audio_id).await;
        }
    });

    Some(Body::from_stream(
        ReceiverStream::new(out_rx).map(Ok::<Bytes, std::io::Error>),
    ))
}

/// GET /api/health - unauthenticated liveness check for load balancers.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/health/detailed - adds version/uptime/active-source-count.
async fn health_check_detailed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active_sources = screenbridge_core::list_serials(&state.registry).await.len();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_sources": active_sources,
    }))
}

/// GET /metrics - Prometheus text exposition format.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let serials = screenbridge_core::list_serials(&state.registry).await;
    let mut video_subscribers = 0usize;
    let mut audio_subscribers = 0usize;
    for serial in &serials {
        if let Some(source) = screenbridge_core::get_source(&state.registry, serial).await {
            video_subscribers += source.video.subscriber_count().await;
            audio_subscribers += source.audio.subscriber_count().await;
        }
    }

    let active_sources = serials.len();
    let uptime_secs = state.started_at.elapsed().as_secs();

    let body = format!(
        "# HELP screenbridge_active_sources Number of registered device sources\n\
         # TYPE screenbridge_active_sources gauge\n\
         screenbridge_active_sources {active_sources}\n\
         \n\
         # HELP screenbridge_uptime_seconds Server uptime in seconds\n\
         # TYPE screenbridge_uptime_seconds gauge\n\
         screenbridge_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP screenbridge_video_subscribers Video pipeline subscribers, summed across sources\n\
         # TYPE screenbridge_video_subscribers gauge\n\
         screenbridge_video_subscribers {video_subscribers}\n\
         \n\
         # HELP screenbridge_audio_subscribers Audio pipeline subscribers, summed across sources\n\
         # TYPE screenbridge_audio_subscribers gauge\n\
         screenbridge_audio_subscribers {audio_subscribers}\n"
    );

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

/// GET /api/ice-config - STUN/TURN servers for the browser's RTCPeerConnection.
async fn ice_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ice = &state.config.ice;
    let mut servers = Vec::new();

    if !ice.stun_urls.is_empty() {
        servers.push(json!({ "urls": ice.stun_urls }));
    }
    if !ice.turn_urls.is_empty() {
        servers.push(json!({
            "urls": ice.turn_urls,
            "username": ice.turn_username,
            "credential": ice.turn_credential,
        }));
    }

    Json(json!({ "ice_servers": servers }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app_state() -> Arc<AppState> {
        let config: BridgeConfig = toml::from_str("").expect("default config");
        Arc::new(AppState {
            config,
            registry: screenbridge_core::new_source_registry(),
            started_at: std::time::Instant::now(),
        })
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn health_detailed_reports_zero_active_sources() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .uri("/api/health/detailed")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["active_sources"], 0);
    }

    #[tokio::test]
    async fn ice_config_includes_default_stun_servers() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .uri("/api/ice-config")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = body_json(response).await;
        assert!(body["ice_servers"][0]["urls"][0]
            .as_str()
            .unwrap()
            .starts_with("stun:"));
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("screenbridge_active_sources 0"));
    }

    #[tokio::test]
    async fn disconnect_unknown_device_is_a_no_op() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/devices/emulator-5554")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn stream_unknown_device_returns_404() {
        let app = build_router(test_app_state());
        let request = Request::builder()
            .uri("/stream/video/emulator-5554")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn parse_mode_defaults_to_webrtc() {
        assert!(matches!(parse_mode(None), StreamMode::WebRtc));
        assert!(matches!(parse_mode(Some("mp4")), StreamMode::Mp4));
        assert!(matches!(parse_mode(Some("bogus")), StreamMode::WebRtc));
    }
}
