//! Per-device Source: owns the three handshake sockets, drives the read
//! loops, and publishes decoded samples into the pipeline.
//!
//! Each socket gets its own dedicated reader task (per the no-lock-across-
//! I/O scheduling model); state shared between tasks — the cached SPS/PPS,
//! connection info, the control writer — lives behind short-lived lock
//! guards that are never held across an `.await` on I/O.

use crate::error::{Result, StreamError};
use crate::launcher::{self, DeviceServer, DeviceSockets, StreamMode};
use crate::pipeline::{next_subscriber_id, AudioSample, SamplePipeline, VideoSample};
use crate::transcoder;
use bytes::Bytes;
use screenbridge_protocol::{
    DeviceConfig, PacketHeader, StreamConfig, VideoStreamHeader, DEVICE_META_SIZE,
    VIDEO_STREAM_HEADER_SIZE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub serial: String,
    pub width: u32,
    pub height: u32,
}

pub struct Source {
    serial: String,
    device_config: DeviceConfig,
    stream_config: StreamConfig,
    cancel: CancellationToken,
    started: AtomicBool,

    pub video: Arc<SamplePipeline<VideoSample>>,
    pub audio: Arc<SamplePipeline<AudioSample>>,

    sps_pps: RwLock<Option<(Bytes, Bytes)>>,
    audio_config: RwLock<Option<Bytes>>,
    connection_info: RwLock<Option<ConnectionInfo>>,
    control_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,

    device_server: RwLock<Option<DeviceServer>>,
}

impl Source {
    pub fn new(serial: &str, device_config: DeviceConfig, stream_config: StreamConfig) -> Arc<Self> {
        let sample_queue_depth = stream_config.subscriber_queue_depth;
        Arc::new(Self {
            serial: serial.to_string(),
            device_config,
            stream_config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            video: Arc::new(SamplePipeline::new(sample_queue_depth)),
            audio: Arc::new(SamplePipeline::new(sample_queue_depth)),
            sps_pps: RwLock::new(None),
            audio_config: RwLock::new(None),
            connection_info: RwLock::new(None),
            control_tx: RwLock::new(None),
            device_server: RwLock::new(None),
        })
    }

    /// Idempotent: a second call on an already-started Source is a no-op.
    pub async fn start(self: &Arc<Self>, mode: StreamMode) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (device_server, sockets) =
            launcher::launch(&self.device_config, &self.serial, mode).await?;
        *self.device_server.write().await = Some(device_server);

        let DeviceSockets { video, audio, control } = sockets;

        let (video_info, video_read, video_write) = handshake_video(video).await?;
        *self.connection_info.write().await = Some(video_info);
        drop(video_write); // the device never reads on the video socket

        let (audio_read, audio_write) = handshake_audio(audio).await?;
        drop(audio_write);

        let (control_read, control_write) = control.into_split();
        let (control_tx, control_rx) = mpsc::channel::<Vec<u8>>(32);
        *self.control_tx.write().await = Some(control_tx);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_video_reader(video_read).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_audio_reader(audio_read).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_control_writer(control_write, control_rx).await });

        tokio::spawn(async move { drain_control_replies(control_read).await });

        info!(serial = %self.serial, "source started");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn teardown(&self) {
        self.stop();
        if let Some(mut server) = self.device_server.write().await.take() {
            server.stop().await;
        }
    }

    pub async fn subscribe_video(&self, id: u64) -> mpsc::Receiver<VideoSample> {
        self.video.subscribe(id).await
    }

    pub async fn unsubscribe_video(&self, id: u64) {
        self.video.unsubscribe(id).await;
    }

    pub async fn subscribe_audio(&self, id: u64) -> mpsc::Receiver<AudioSample> {
        self.audio.subscribe(id).await
    }

    pub async fn unsubscribe_audio(&self, id: u64) {
        self.audio.unsubscribe(id).await;
    }

    /// Enqueue a write on the control socket. Silently drops (with a warn
    /// log) if the control socket isn't attached yet, per the documented
    /// "returns without error" contract.
    pub async fn send_control(&self, msg: Vec<u8>) {
        let tx = self.control_tx.read().await.clone();
        match tx {
            Some(tx) => {
                if tx.try_send(msg).is_err() {
                    warn!(serial = %self.serial, "control send queue full or closed, dropping message");
                }
            }
            None => warn!(serial = %self.serial, "control socket not yet attached, dropping message"),
        }
    }

    pub async fn get_sps_pps(&self) -> Option<(Bytes, Bytes)> {
        self.sps_pps.read().await.clone()
    }

    /// Raw `AudioSpecificConfig` from the first audio config packet, when
    /// the device's audio codec provides one (AAC, for fMP4 consumers).
    pub async fn get_audio_config(&self) -> Option<Bytes> {
        self.audio_config.read().await.clone()
    }

    pub async fn get_connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info.read().await.clone()
    }

    /// Background poller for callers (the control handler) that need
    /// authoritative screen bounds before the video handshake has finished.
    /// Retries up to 10 times, 500 ms apart, and gives up after ~5 s.
    pub async fn wait_for_connection_info(&self) -> Option<ConnectionInfo> {
        for attempt in 0..10 {
            if let Some(info) = self.get_connection_info().await {
                return Some(info);
            }
            if attempt < 9 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
        None
    }

    pub async fn request_keyframe(&self) {
        self.send_control(screenbridge_protocol::encode_reset_video()).await;
    }

    #[cfg(test)]
    pub(crate) async fn set_connection_info_for_test(&self, info: ConnectionInfo) {
        *self.connection_info.write().await = Some(info);
    }

    async fn run_video_reader(self: Arc<Self>, mut read: OwnedReadHalf) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = read_one_packet(&mut read, self.stream_config.max_video_packet_bytes as usize) => {
                    match result {
                        Ok(Some((header, data))) => self.handle_video_packet(header, data).await,
                        Ok(None) => {
                            info!(serial = %self.serial, "video stream EOF");
                            break;
                        }
                        Err(e) => {
                            warn!(serial = %self.serial, error = %e, "video stream framing fault, tearing down source");
                            break;
                        }
                    }
                }
            }
        }
        self.teardown().await;
    }

    async fn handle_video_packet(&self, header: PacketHeader, data: Bytes) {
        if header.is_config {
            let (sps, pps) = transcoder::extract_parameter_sets(&data);
            if let (Some(sps), Some(pps)) = (sps, pps) {
                *self.sps_pps.write().await = Some((Bytes::from(sps), Bytes::from(pps)));
            }
            return;
        }
        self.video
            .publish(VideoSample {
                data,
                is_key: header.is_key,
                pts_us: header.pts_us as i64,
            })
            .await;
    }

    async fn run_audio_reader(self: Arc<Self>, mut read: OwnedReadHalf) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = read_one_packet(&mut read, self.stream_config.max_audio_packet_bytes as usize) => {
                    match result {
                        Ok(Some((header, data))) => {
                            if header.is_config {
                                *self.audio_config.write().await = Some(data);
                            } else {
                                self.audio
                                    .publish(AudioSample { data, pts_us: header.pts_us as i64 })
                                    .await;
                            }
                        }
                        Ok(None) => {
                            debug!(serial = %self.serial, "audio stream EOF");
                            break;
                        }
                        Err(e) => {
                            debug!(serial = %self.serial, error = %e, "audio framing fault, audio stream only");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_control_writer(
        self: Arc<Self>,
        mut write: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some(bytes) => {
                            if let Err(e) = write.write_all(&bytes).await {
                                warn!(serial = %self.serial, error = %e, "control socket write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }
}

async fn drain_control_replies(mut read: OwnedReadHalf) {
    let mut buf = [0u8; 4096];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn handshake_video(
    stream: tokio::net::TcpStream,
) -> Result<(ConnectionInfo, OwnedReadHalf, OwnedWriteHalf)> {
    let (mut read, write) = stream.into_split();
    let meta = launcher::read_exact_array::<DEVICE_META_SIZE>(&mut read).await?;
    let serial = screenbridge_protocol::parse_device_meta(&meta)?;
    let header_bytes = launcher::read_exact_array::<VIDEO_STREAM_HEADER_SIZE>(&mut read).await?;
    let header = VideoStreamHeader::decode(&header_bytes);
    Ok((
        ConnectionInfo {
            serial,
            width: header.width,
            height: header.height,
        },
        read,
        write,
    ))
}

async fn handshake_audio(stream: tokio::net::TcpStream) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let (mut read, write) = stream.into_split();
    let header_bytes =
        launcher::read_exact_array::<{ screenbridge_protocol::AUDIO_STREAM_HEADER_SIZE }>(&mut read)
            .await?;
    let _codec_id = screenbridge_protocol::decode_audio_stream_header(&header_bytes);
    Ok((read, write))
}

async fn read_one_packet(
    read: &mut OwnedReadHalf,
    cap: usize,
) -> Result<Option<(PacketHeader, Bytes)>> {
    let mut header_buf = [0u8; screenbridge_protocol::PACKET_HEADER_SIZE];
    match read.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(StreamError::Io(e)),
    }
    let header = PacketHeader::decode(&header_buf);
    PacketHeader::validate_size(header.size, cap)?;

    let mut body = vec![0u8; header.size as usize];
    read.read_exact(&mut body)
        .await
        .map_err(StreamError::Io)?;

    Ok(Some((header, Bytes::from(body))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use screenbridge_protocol::StreamConfig;

    fn test_source() -> Arc<Source> {
        Source::new("emulator-5554", DeviceConfig::default(), StreamConfig::default())
    }

    fn annex_b_nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, nal_type];
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn config_packet_caches_sps_pps_without_publishing() {
        let source = test_source();
        let id = next_subscriber_id();
        let mut rx = source.subscribe_video(id).await;

        let mut config = annex_b_nal(7, &[1, 2, 3]);
        config.extend(annex_b_nal(8, &[4, 5]));

        source
            .handle_video_packet(
                PacketHeader { pts_us: 0, is_config: true, is_key: false, size: config.len() as u32 },
                Bytes::from(config),
            )
            .await;

        assert!(source.get_sps_pps().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_config_packet_publishes_to_subscriber() {
        let source = test_source();
        let id = next_subscriber_id();
        let mut rx = source.subscribe_video(id).await;

        source
            .handle_video_packet(
                PacketHeader { pts_us: 5000, is_config: false, is_key: true, size: 4 },
                Bytes::from_static(b"data"),
            )
            .await;

        let sample = rx.recv().await.unwrap();
        assert!(sample.is_key);
        assert_eq!(sample.pts_us, 5000);
    }

    #[tokio::test]
    async fn send_control_without_attached_socket_does_not_panic() {
        let source = test_source();
        source.send_control(vec![1, 2, 3]).await;
        source.request_keyframe().await;
    }

    #[tokio::test]
    async fn get_connection_info_is_none_before_start() {
        let source = test_source();
        assert!(source.get_connection_info().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_connection_info_gives_up_after_retries_exhausted() {
        let source = test_source();
        assert!(source.wait_for_connection_info().await.is_none());
    }

    #[tokio::test]
    async fn wait_for_connection_info_returns_immediately_once_populated() {
        let source = test_source();
        *source.connection_info.write().await = Some(ConnectionInfo {
            serial: "emulator-5554".into(),
            width: 1080,
            height: 1920,
        });
        let info = source.wait_for_connection_info().await.unwrap();
        assert_eq!(info.width, 1080);
    }
}
