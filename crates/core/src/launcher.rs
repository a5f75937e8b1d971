//! Bootstraps the on-device screen-mirroring server over ADB: artifact
//! push, reverse port-forward, process spawn, and the three-socket accept
//! handshake.
//!
//! There's no local-capture equivalent to ground this on directly; the
//! subprocess-spawning shape (build a `Command`, redirect output to a log
//! file rather than an unread pipe, record the child PID for teardown)
//! follows the session-spawning code in the server crate.

use crate::error::{Result, StreamError};
use screenbridge_protocol::DeviceConfig;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    WebRtc,
    WebM,
    Mp4,
    H264,
    Mse,
}

impl StreamMode {
    fn video_codec_options(self) -> &'static str {
        "i-frame-interval=2"
    }

    fn audio_codec(self) -> &'static str {
        match self {
            StreamMode::Mp4 => "aac",
            _ => "opus",
        }
    }

    fn video_encoder(self, device_encoders: &[String]) -> String {
        if self == StreamMode::H264 {
            return "OMX.google.h264.encoder".to_string();
        }
        for candidate in ["c2.qti", "c2.mtk", "c2.exynos", "c2.google", "c2.hisilicon", "c2.unisoc"] {
            let full = format!("{candidate}.avc.encoder");
            if device_encoders.iter().any(|e| e == &full) {
                return full;
            }
        }
        "c2.android.avc.encoder".to_string()
    }
}

/// The three sockets accepted from the on-device server, in handshake order.
pub struct DeviceSockets {
    pub video: TcpStream,
    pub audio: TcpStream,
    pub control: TcpStream,
}

/// A running on-device server: reverse-forward + spawned process, torn down
/// together on `stop`.
pub struct DeviceServer {
    serial: String,
    scid: u32,
    adb_path: String,
    process: Option<Child>,
}

fn scid_hex(scid: u32) -> String {
    format!("{scid:08x}")
}

async fn adb(adb_path: &str, serial: &str, args: &[&str]) -> Result<std::process::Output> {
    let output = Command::new(adb_path)
        .arg("-s")
        .arg(serial)
        .args(args)
        .output()
        .await
        .map_err(|e| StreamError::Setup(format!("failed to run adb {args:?}: {e}")))?;
    Ok(output)
}

/// Launch the on-device server for `serial` in `mode`, returning the
/// handshake-identified sockets plus a handle used for teardown.
pub async fn launch(
    config: &DeviceConfig,
    serial: &str,
    mode: StreamMode,
) -> Result<(DeviceServer, DeviceSockets)> {
    if !std::path::Path::new(&config.server_artifact).exists() {
        return Err(StreamError::Setup(format!(
            "no local copy of the on-device server artifact at {}",
            config.server_artifact
        )));
    }

    let push = adb(
        &config.adb_path,
        serial,
        &["push", &config.server_artifact, "/data/local/tmp/bridge-server.jar"],
    )
    .await?;
    if !push.status.success() {
        return Err(StreamError::Setup(format!(
            "adb push failed: {}",
            String::from_utf8_lossy(&push.stderr)
        )));
    }

    let (scid, listener) = bind_scid(config).await?;
    let hex = scid_hex(scid);

    let _ = adb(
        &config.adb_path,
        serial,
        &["reverse", "--remove", &format!("localabstract:scrcpy_{hex}")],
    )
    .await;

    let add = adb(
        &config.adb_path,
        serial,
        &[
            "reverse",
            &format!("localabstract:scrcpy_{hex}"),
            &format!("tcp:{scid}"),
        ],
    )
    .await?;
    if !add.status.success() {
        return Err(StreamError::Setup(format!(
            "adb reverse failed: {}",
            String::from_utf8_lossy(&add.stderr)
        )));
    }

    let device_encoders = probe_device_encoders(&config.adb_path, serial).await;
    let child = spawn_on_device_server(config, serial, scid, mode, &device_encoders).await?;

    let sockets = accept_three(
        &listener,
        Duration::from_secs(config.handshake_deadline_secs),
    )
    .await;

    let sockets = match sockets {
        Ok(s) => s,
        Err(e) => {
            diagnose_handshake_failure(&config.adb_path, serial, &hex).await;
            let mut server = DeviceServer {
                serial: serial.to_string(),
                scid,
                adb_path: config.adb_path.clone(),
                process: Some(child),
            };
            server.stop().await;
            return Err(e);
        }
    };

    Ok((
        DeviceServer {
            serial: serial.to_string(),
            scid,
            adb_path: config.adb_path.clone(),
            process: Some(child),
        },
        sockets,
    ))
}

async fn bind_scid(config: &DeviceConfig) -> Result<(u32, TcpListener)> {
    let mut scid = config.scid_start;
    for attempt in 0..config.scid_attempts {
        match TcpListener::bind(("127.0.0.1", scid as u16)).await {
            Ok(listener) => return Ok((scid, listener)),
            Err(_) if attempt + 1 < config.scid_attempts => {
                scid += 1;
            }
            Err(e) => {
                return Err(StreamError::Setup(format!(
                    "no free scid in [{}, {}]: {e}",
                    config.scid_start,
                    config.scid_start + config.scid_attempts
                )));
            }
        }
    }
    Err(StreamError::Setup("scid probe range exhausted".to_string()))
}

async fn spawn_on_device_server(
    config: &DeviceConfig,
    serial: &str,
    scid: u32,
    mode: StreamMode,
    device_encoders: &[String],
) -> Result<Child> {
    let video_encoder = mode.video_encoder(device_encoders);
    let args = [
        "shell".to_string(),
        "CLASSPATH=/data/local/tmp/bridge-server.jar".to_string(),
        "app_process".to_string(),
        "/".to_string(),
        "com.bridge.Server".to_string(),
        "1.0".to_string(),
        format!("scid={scid:08x}"),
        "video=true".to_string(),
        "audio=true".to_string(),
        "control=true".to_string(),
        "cleanup=true".to_string(),
        "video_codec=h264".to_string(),
        format!("video_codec_options={}", mode.video_codec_options()),
        format!("video_encoder={video_encoder}"),
        format!("audio_codec={}", mode.audio_codec()),
    ];

    let log_path = format!("/tmp/bridge-device-{serial}-{scid}.log");
    let log_file = std::fs::File::create(&log_path)
        .map_err(|e| StreamError::Setup(format!("failed to create device server log: {e}")))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| StreamError::Setup(format!("failed to clone device server log: {e}")))?;

    let child = Command::new(&config.adb_path)
        .arg("-s")
        .arg(serial)
        .args(&args)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()
        .map_err(|e| StreamError::Setup(format!("failed to spawn on-device server: {e}")))?;

    info!(serial, scid, "on-device server spawned");
    Ok(child)
}

async fn accept_three(listener: &TcpListener, deadline: Duration) -> Result<DeviceSockets> {
    let (video, _) = timeout(deadline, listener.accept())
        .await
        .map_err(|_| StreamError::Handshake("timed out waiting for video socket".to_string()))?
        .map_err(|e| StreamError::Io(e))?;

    let (audio, _) = timeout(Duration::from_secs(1), listener.accept())
        .await
        .map_err(|_| StreamError::Handshake("timed out waiting for audio socket".to_string()))?
        .map_err(|e| StreamError::Io(e))?;

    let (control, _) = timeout(Duration::from_secs(1), listener.accept())
        .await
        .map_err(|_| StreamError::Handshake("timed out waiting for control socket".to_string()))?
        .map_err(|e| StreamError::Io(e))?;

    Ok(DeviceSockets { video, audio, control })
}

async fn diagnose_handshake_failure(adb_path: &str, serial: &str, scid_hex: &str) {
    if let Ok(output) = adb(adb_path, serial, &["reverse", "--list"]).await {
        warn!(
            serial,
            scid_hex,
            reverse_list = %String::from_utf8_lossy(&output.stdout),
            "handshake deadline expired; dumping adb reverse --list"
        );
    }
    if let Ok(output) = adb(adb_path, serial, &["shell", "ps", "|", "grep", "scrcpy"]).await {
        warn!(
            serial,
            ps = %String::from_utf8_lossy(&output.stdout),
            "handshake deadline expired; dumping on-device process list"
        );
    }
}

/// Parse `media_codecs*.xml` on the device for candidate hardware encoders.
async fn probe_device_encoders(adb_path: &str, serial: &str) -> Vec<String> {
    let output = match adb(
        adb_path,
        serial,
        &["shell", "cat", "/vendor/etc/media_codecs*.xml", "2>/dev/null"],
    )
    .await
    {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut encoders = Vec::new();
    for line in text.lines() {
        if let Some(idx) = line.find("name=\"") {
            let rest = &line[idx + 6..];
            if let Some(end) = rest.find('"')
                && rest[..end].contains("encoder")
            {
                encoders.push(rest[..end].to_string());
            }
        }
    }
    encoders
}

impl DeviceServer {
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        let _ = adb(
            &self.adb_path,
            &self.serial,
            &["reverse", "--remove", &format!("localabstract:scrcpy_{}", scid_hex(self.scid))],
        )
        .await;
        let _ = adb(&self.adb_path, &self.serial, &["shell", "pkill", "-f", "com.bridge.Server"]).await;
    }
}

/// Read `n` bytes into a fixed array, mapping EOF/short-read into the right
/// [`StreamError`] variant.
pub async fn read_exact_array<const N: usize>(stream: &mut TcpStream) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            StreamError::Framing(screenbridge_protocol::FramingError::ShortRead { need: N, got: 0 })
        } else {
            StreamError::Io(e)
        }
    })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scid_hex_is_zero_padded_8_digits() {
        assert_eq!(scid_hex(0x1), "00000001");
        assert_eq!(scid_hex(0x1000), "00001000");
    }

    #[test]
    fn h264_mode_always_selects_software_encoder() {
        assert_eq!(
            StreamMode::H264.video_encoder(&["c2.qti.avc.encoder".to_string()]),
            "OMX.google.h264.encoder"
        );
    }

    #[test]
    fn webrtc_mode_prefers_first_matching_vendor_encoder() {
        let encoders = vec!["c2.mtk.avc.encoder".to_string(), "c2.google.avc.encoder".to_string()];
        assert_eq!(StreamMode::WebRtc.video_encoder(&encoders), "c2.mtk.avc.encoder");
    }

    #[test]
    fn falls_back_to_android_software_encoder_when_nothing_matches() {
        assert_eq!(StreamMode::WebRtc.video_encoder(&[]), "c2.android.avc.encoder");
    }

    #[test]
    fn audio_codec_is_aac_for_mp4_and_opus_otherwise() {
        assert_eq!(StreamMode::Mp4.audio_codec(), "aac");
        assert_eq!(StreamMode::WebRtc.audio_codec(), "opus");
        assert_eq!(StreamMode::Mse.audio_codec(), "opus");
    }
}
