//! WebM (EBML) muxer: a single-threaded, append-only writer with a video
//! track (`V_MPEG4/ISO/AVC`, Annex-B passthrough) and an audio track
//! (`A_OPUS`), cumulative-millisecond timestamps, written as SimpleBlocks.
//!
//! Same "no corpus precedent" caveat as the fMP4 writer: EBML element IDs
//! and the Matroska/WebM element tree follow the public WebM spec, not any
//! example repo.

use bytes::{Bytes, BytesMut};

const EBML_HEADER: u32 = 0x1A45_DFA3;
const SEGMENT: u32 = 0x1853_8067;
const SEGMENT_INFO: u32 = 0x1549_A966;
const TIMECODE_SCALE: u32 = 0x2AD7_B1;
const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const DEFAULT_DURATION: u32 = 0x23E3_83;
const VIDEO_SETTINGS: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const AUDIO_SETTINGS: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;
const CLUSTER: u32 = 0x1F43_B675;
const TIMECODE: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

pub const VIDEO_TRACK_NUMBER: u64 = 1;
pub const AUDIO_TRACK_NUMBER: u64 = 2;

const DEFAULT_VIDEO_DURATION_MS: u32 = 33;
const DEFAULT_AUDIO_DURATION_MS: u32 = 20;

fn write_element_id(out: &mut BytesMut, id: u32) {
    let bytes = id.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    out.extend_from_slice(&bytes[start..]);
}

/// EBML variable-length "vint" with the marker bit encoding its own width.
fn write_vint(out: &mut BytesMut, value: u64) {
    for len in 1..=8u32 {
        let max = (1u64 << (7 * len)) - 1;
        if value <= max {
            let marker = 1u64 << (7 * len);
            let encoded = value | marker;
            let bytes = encoded.to_be_bytes();
            out.extend_from_slice(&bytes[8 - len as usize..]);
            return;
        }
    }
    unreachable!("value too large for an 8-byte vint");
}

fn write_element(out: &mut BytesMut, id: u32, body: impl FnOnce(&mut BytesMut)) {
    let mut inner = BytesMut::new();
    body(&mut inner);
    write_element_id(out, id);
    write_vint(out, inner.len() as u64);
    out.extend_from_slice(&inner);
}

/// Reserved EBML "unknown size" vint (all data bits set): lets a parser
/// read the element until it hits a sibling-level ID instead of trusting a
/// declared length. Needed for Segment here since Clusters are appended to
/// the live stream long after the header's definite-size body is written.
const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

fn write_element_unknown_size(out: &mut BytesMut, id: u32, body: impl FnOnce(&mut BytesMut)) {
    write_element_id(out, id);
    out.extend_from_slice(&UNKNOWN_SIZE);
    body(out);
}

fn write_uint_element(out: &mut BytesMut, id: u32, value: u64) {
    write_element(out, id, |out| {
        let bytes = value.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(7);
        out.extend_from_slice(&bytes[start..]);
    });
}

fn write_str_element(out: &mut BytesMut, id: u32, value: &str) {
    write_element(out, id, |out| out.extend_from_slice(value.as_bytes()));
}

fn write_float_element(out: &mut BytesMut, id: u32, value: f64) {
    write_element(out, id, |out| out.extend_from_slice(&value.to_be_bytes()));
}

pub struct VideoTrackInit {
    pub width: u16,
    pub height: u16,
}

pub struct AudioTrackInit {
    pub sample_rate: f64,
    pub channels: u8,
}

/// Build the EBML header + Segment/Info/Tracks prologue that must precede
/// every Cluster. Returned once at stream start; Clusters are appended by
/// [`Muxer::write_video_frame`]/[`Muxer::write_audio_frame`]. Either track
/// can be omitted for a video-only or audio-only stream, but not both.
pub fn build_header(video: Option<&VideoTrackInit>, audio: Option<&AudioTrackInit>) -> Bytes {
    let mut out = BytesMut::new();

    write_element(&mut out, EBML_HEADER, |out| {
        write_uint_element(out, 0x4286, 1); // EBMLVersion
        write_uint_element(out, 0x42F7, 1); // EBMLReadVersion
        write_uint_element(out, 0x42F2, 4); // EBMLMaxIDLength
        write_uint_element(out, 0x42F3, 8); // EBMLMaxSizeLength
        write_str_element(out, 0x4282, "webm"); // DocType
        write_uint_element(out, 0x4287, 2); // DocTypeVersion
        write_uint_element(out, 0x4285, 2); // DocTypeReadVersion
    });

    write_element_unknown_size(&mut out, SEGMENT, |out| {
        write_element(out, SEGMENT_INFO, |out| {
            write_uint_element(out, TIMECODE_SCALE, 1_000_000); // 1 ms ticks
            write_str_element(out, 0x4D80, "screenbridge");
        });

        write_element(out, TRACKS, |out| {
            if let Some(video) = video {
                write_element(out, TRACK_ENTRY, |out| {
                    write_uint_element(out, TRACK_NUMBER, VIDEO_TRACK_NUMBER);
                    write_uint_element(out, TRACK_UID, VIDEO_TRACK_NUMBER);
                    write_uint_element(out, TRACK_TYPE, 1); // video
                    write_str_element(out, CODEC_ID, "V_MPEG4/ISO/AVC");
                    write_uint_element(out, DEFAULT_DURATION, DEFAULT_VIDEO_DURATION_MS as u64 * 1_000_000);
                    write_element(out, VIDEO_SETTINGS, |out| {
                        write_uint_element(out, PIXEL_WIDTH, video.width as u64);
                        write_uint_element(out, PIXEL_HEIGHT, video.height as u64);
                    });
                });
            }

            if let Some(audio) = audio {
                write_element(out, TRACK_ENTRY, |out| {
                    write_uint_element(out, TRACK_NUMBER, AUDIO_TRACK_NUMBER);
                    write_uint_element(out, TRACK_UID, AUDIO_TRACK_NUMBER);
                    write_uint_element(out, TRACK_TYPE, 2); // audio
                    write_str_element(out, CODEC_ID, "A_OPUS");
                    write_uint_element(out, DEFAULT_DURATION, DEFAULT_AUDIO_DURATION_MS as u64 * 1_000_000);
                    write_element(out, AUDIO_SETTINGS, |out| {
                        write_float_element(out, SAMPLING_FREQUENCY, audio.sample_rate);
                        write_uint_element(out, CHANNELS, audio.channels as u64);
                    });
                });
            }
        });
    });

    out.freeze()
}

/// Tracks the running cumulative timestamp per track (ms) so frames can be
/// appended one at a time as they arrive from the subscriber channel,
/// without buffering a whole fragment first.
pub struct Muxer {
    video_timestamp_ms: u64,
    audio_timestamp_ms: u64,
    closed: bool,
}

impl Muxer {
    pub fn new() -> Self {
        Self {
            video_timestamp_ms: 0,
            audio_timestamp_ms: 0,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// One Cluster containing a single video SimpleBlock. Video is passed
    /// through as Annex-B; no AVCC conversion is needed for WebM.
    pub fn write_video_frame(&mut self, data: &[u8], is_key: bool) -> Option<Bytes> {
        if self.closed || data.is_empty() {
            return None;
        }
        let timestamp = self.video_timestamp_ms;
        self.video_timestamp_ms += DEFAULT_VIDEO_DURATION_MS as u64;
        Some(build_cluster(timestamp, VIDEO_TRACK_NUMBER, data, is_key))
    }

    /// One Cluster containing a single audio SimpleBlock. The running
    /// timestamp advances by a fixed 20 ms per frame, since Opus frame PTS
    /// is not required on the wire.
    pub fn write_audio_frame(&mut self, data: &[u8]) -> Option<Bytes> {
        if self.closed || data.is_empty() {
            return None;
        }
        let timestamp = self.audio_timestamp_ms;
        self.audio_timestamp_ms += DEFAULT_AUDIO_DURATION_MS as u64;
        Some(build_cluster(timestamp, AUDIO_TRACK_NUMBER, data, true))
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

fn build_cluster(timestamp_ms: u64, track_number: u64, data: &[u8], is_key: bool) -> Bytes {
    let mut out = BytesMut::new();
    write_element(&mut out, CLUSTER, |out| {
        write_uint_element(out, TIMECODE, timestamp_ms);
        write_element(out, SIMPLE_BLOCK, |out| {
            write_vint(out, track_number);
            out.extend_from_slice(&0i16.to_be_bytes()); // relative timecode within cluster
            out.push(if is_key { 0x80 } else { 0x00 }); // keyframe flag
            out.extend_from_slice(data);
        });
    });
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vint_round_trips_small_values() {
        let mut out = BytesMut::new();
        write_vint(&mut out, 5);
        assert_eq!(&out[..], &[0x85]);
    }

    #[test]
    fn vint_uses_two_bytes_past_single_byte_range() {
        let mut out = BytesMut::new();
        write_vint(&mut out, 200);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn header_starts_with_ebml_id() {
        let header = build_header(Some(&VideoTrackInit { width: 1080, height: 1920 }), None);
        assert_eq!(&header[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    }

    #[test]
    fn video_timestamps_advance_by_default_duration() {
        let mut muxer = Muxer::new();
        let first = muxer.write_video_frame(b"frame1", true).unwrap();
        let second = muxer.write_video_frame(b"frame2", false).unwrap();
        assert!(!first.is_empty());
        assert!(!second.is_empty());
        assert_eq!(muxer.video_timestamp_ms, DEFAULT_VIDEO_DURATION_MS as u64 * 2);
    }

    #[test]
    fn audio_timestamps_advance_by_20ms_increments() {
        let mut muxer = Muxer::new();
        muxer.write_audio_frame(b"a").unwrap();
        muxer.write_audio_frame(b"b").unwrap();
        assert_eq!(muxer.audio_timestamp_ms, 40);
    }

    #[test]
    fn writes_after_close_return_none() {
        let mut muxer = Muxer::new();
        muxer.close();
        assert!(muxer.write_video_frame(b"frame", true).is_none());
    }

    #[test]
    fn segment_is_written_with_unknown_size_since_clusters_stream_in_later() {
        let header = build_header(Some(&VideoTrackInit { width: 1080, height: 1920 }), None);
        let segment_id = [0x18, 0x53, 0x80, 0x67];
        let id_offset = header
            .windows(segment_id.len())
            .position(|w| w == segment_id)
            .expect("segment id present in header");
        let size_offset = id_offset + segment_id.len();
        assert_eq!(&header[size_offset..size_offset + 8], &UNKNOWN_SIZE);
    }

    #[test]
    fn header_with_audio_only_omits_video_track() {
        let header = build_header(None, Some(&AudioTrackInit { sample_rate: 48_000.0, channels: 2 }));
        assert_eq!(&header[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);
    }

    #[test]
    fn empty_payload_frames_are_dropped() {
        let mut muxer = Muxer::new();
        assert!(muxer.write_video_frame(&[], true).is_none());
    }
}
