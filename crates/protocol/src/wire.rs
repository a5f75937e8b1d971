//! Binary wire formats exchanged with the on-device server.
//!
//! All multi-byte integers are big-endian, matching the on-device server's
//! own framing exactly — this is a hard external contract, not a free
//! choice (see the media packet header below).

pub const DEVICE_META_SIZE: usize = 64;
pub const VIDEO_STREAM_HEADER_SIZE: usize = 12;
pub const AUDIO_STREAM_HEADER_SIZE: usize = 4;
pub const PACKET_HEADER_SIZE: usize = 12;

pub const MAX_VIDEO_PACKET_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_AUDIO_PACKET_SIZE: usize = 1024 * 1024;

/// 4-byte ASCII codec tags, read/written as big-endian u32.
pub const CODEC_H264: u32 = 0x6832_3634; // "h264"
pub const CODEC_H265: u32 = 0x6832_3635; // "h265"
pub const CODEC_AV01: u32 = 0x6176_3031; // "av01"
pub const CODEC_OPUS: u32 = 0x6f70_7573; // "opus"
pub const CODEC_AAC: u32 = 0x6161_6320; // "aac "
pub const CODEC_FLAC: u32 = 0x666c_6163; // "flac"
pub const CODEC_RAW: u32 = 0x7261_7720; // "raw "
/// Sentinel meaning the stream is disabled (audio socket only).
pub const CODEC_DISABLED: u32 = 0x8000_0000;

const CONFIG_FLAG: u64 = 1 << 63;
const KEY_FRAME_FLAG: u64 = 1 << 62;
const PTS_MASK: u64 = (1 << 62) - 1;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("short read: need {need} bytes, got {got}")]
    ShortRead { need: usize, got: usize },
    #[error("packet size {size} outside allowed range [1, {cap}]")]
    OversizePacket { size: usize, cap: usize },
    #[error("device name is not valid UTF-8")]
    BadDeviceName,
}

/// Decoded video/audio media packet header (12 bytes, big-endian).
///
/// `pts_flags` packs two flag bits into the top of a 64-bit PTS field:
/// `config` (bit 63) and `key_frame` (bit 62); the low 62 bits carry the
/// presentation timestamp in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pts_us: u64,
    pub is_config: bool,
    pub is_key: bool,
    pub size: u32,
}

impl PacketHeader {
    pub fn decode(buf: &[u8; PACKET_HEADER_SIZE]) -> Self {
        let pts_flags = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let size = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        Self {
            pts_us: pts_flags & PTS_MASK,
            is_config: pts_flags & CONFIG_FLAG != 0,
            is_key: pts_flags & KEY_FRAME_FLAG != 0,
            size,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut pts_flags = self.pts_us & PTS_MASK;
        if self.is_config {
            pts_flags |= CONFIG_FLAG;
        }
        if self.is_key {
            pts_flags |= KEY_FRAME_FLAG;
        }
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..8].copy_from_slice(&pts_flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    /// Validate a decoded `size` against the per-stream cap (§3: 1..10MiB
    /// video, 1..1MiB audio). A cap violation is a framing fault that
    /// terminates only the stream it occurred on.
    pub fn validate_size(size: u32, cap: usize) -> Result<(), FramingError> {
        let size = size as usize;
        if size == 0 || size > cap {
            return Err(FramingError::OversizePacket { size, cap });
        }
        Ok(())
    }
}

/// Parse the 64-byte null-padded device-name preamble sent on the video
/// socket before the video stream header.
pub fn parse_device_meta(buf: &[u8; DEVICE_META_SIZE]) -> Result<String, FramingError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .map(str::to_string)
        .map_err(|_| FramingError::BadDeviceName)
}

pub fn encode_device_meta(name: &str) -> [u8; DEVICE_META_SIZE] {
    let mut buf = [0u8; DEVICE_META_SIZE];
    let bytes = name.as_bytes();
    let n = bytes.len().min(DEVICE_META_SIZE);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// `codec_id:u32 || width:u32 || height:u32`, read after the device meta
/// on the video socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoStreamHeader {
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoStreamHeader {
    pub fn decode(buf: &[u8; VIDEO_STREAM_HEADER_SIZE]) -> Self {
        Self {
            codec_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            width: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            height: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; VIDEO_STREAM_HEADER_SIZE] {
        let mut buf = [0u8; VIDEO_STREAM_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.codec_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.width.to_be_bytes());
        buf[8..12].copy_from_slice(&self.height.to_be_bytes());
        buf
    }
}

/// `codec_id:u32` alone on the audio socket.
pub fn decode_audio_stream_header(buf: &[u8; AUDIO_STREAM_HEADER_SIZE]) -> u32 {
    u32::from_be_bytes(*buf)
}

pub fn encode_audio_stream_header(codec_id: u32) -> [u8; AUDIO_STREAM_HEADER_SIZE] {
    codec_id.to_be_bytes()
}

/// Control message type tags (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMessageType {
    InjectKeycode = 0,
    InjectText = 1,
    InjectTouch = 2,
    InjectScroll = 3,
    BackOrScreenOn = 4,
    ExpandNotification = 5,
    ExpandSettings = 6,
    CollapsePanels = 7,
    GetClipboard = 8,
    SetClipboard = 9,
    SetDisplayPower = 10,
    RotateDevice = 11,
    UhidCreate = 12,
    UhidInput = 13,
    UhidDestroy = 14,
    OpenHardKeyboard = 15,
    StartApp = 16,
    ResetVideo = 17,
}

/// Touch action discriminant used by `encode_touch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TouchAction {
    Down = 0,
    Up = 1,
    Move = 2,
}

fn prepend_type(ty: ControlMessageType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(ty as u8);
    out.extend_from_slice(payload);
    out
}

/// `action:u8 || keycode:u32 || repeat:u32 || meta_state:u32`.
pub fn encode_keycode(action: u8, keycode: u32, repeat: u32, meta_state: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(13);
    payload.push(action);
    payload.extend_from_slice(&keycode.to_be_bytes());
    payload.extend_from_slice(&repeat.to_be_bytes());
    payload.extend_from_slice(&meta_state.to_be_bytes());
    prepend_type(ControlMessageType::InjectKeycode, &payload)
}

/// `length:u32 || utf8_bytes[length]`.
pub fn encode_text(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut payload = Vec::with_capacity(4 + bytes.len());
    payload.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    payload.extend_from_slice(bytes);
    prepend_type(ControlMessageType::InjectText, &payload)
}

/// `action:u8 || pointer_id:u64 || x:u32 || y:u32 || screen_width:u16 ||
/// screen_height:u16 || pressure_q16:u16 || action_button:u32 || buttons:u32`.
#[allow(clippy::too_many_arguments)]
pub fn encode_touch(
    action: TouchAction,
    pointer_id: u64,
    x: u32,
    y: u32,
    screen_width: u16,
    screen_height: u16,
    pressure: f32,
    action_button: u32,
    buttons: u32,
) -> Vec<u8> {
    let pressure_q16 = (pressure.clamp(0.0, 1.0) * 0xFFFFu32 as f32).round() as u16;
    let mut payload = Vec::with_capacity(28);
    payload.push(action as u8);
    payload.extend_from_slice(&pointer_id.to_be_bytes());
    payload.extend_from_slice(&x.to_be_bytes());
    payload.extend_from_slice(&y.to_be_bytes());
    payload.extend_from_slice(&screen_width.to_be_bytes());
    payload.extend_from_slice(&screen_height.to_be_bytes());
    payload.extend_from_slice(&pressure_q16.to_be_bytes());
    payload.extend_from_slice(&action_button.to_be_bytes());
    payload.extend_from_slice(&buttons.to_be_bytes());
    prepend_type(ControlMessageType::InjectTouch, &payload)
}

/// `x:u32 || y:u32 || screen_width:u16 || screen_height:u16 ||
/// h_scroll_i16fp:i16 || v_scroll_i16fp:i16 || buttons:u32`.
///
/// `h_scroll`/`v_scroll` are raw scroll-unit deltas (16 units per notch);
/// `clamp(value/16.0, -1.0, 1.0) * 2^15` maps them into the device's
/// signed Q15 fixed-point scroll range.
pub fn encode_scroll(
    x: u32,
    y: u32,
    screen_width: u16,
    screen_height: u16,
    h_scroll: f64,
    v_scroll: f64,
    buttons: u32,
) -> Vec<u8> {
    let to_i16fp = |v: f64| -> i16 {
        let normalized = (v / 16.0).clamp(-1.0, 1.0);
        (normalized * (1i32 << 15) as f64).round() as i32 as i16
    };
    let h_scroll_i16fp = to_i16fp(h_scroll);
    let v_scroll_i16fp = to_i16fp(v_scroll);

    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&x.to_be_bytes());
    payload.extend_from_slice(&y.to_be_bytes());
    payload.extend_from_slice(&screen_width.to_be_bytes());
    payload.extend_from_slice(&screen_height.to_be_bytes());
    payload.extend_from_slice(&h_scroll_i16fp.to_be_bytes());
    payload.extend_from_slice(&v_scroll_i16fp.to_be_bytes());
    payload.extend_from_slice(&buttons.to_be_bytes());
    prepend_type(ControlMessageType::InjectScroll, &payload)
}

/// `sequence:u64 || paste:u8 || length:u32 || utf8_bytes[length]`.
pub fn encode_set_clipboard(sequence: u64, paste: bool, text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut payload = Vec::with_capacity(13 + bytes.len());
    payload.extend_from_slice(&sequence.to_be_bytes());
    payload.push(paste as u8);
    payload.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    payload.extend_from_slice(bytes);
    prepend_type(ControlMessageType::SetClipboard, &payload)
}

/// Empty payload.
pub fn encode_reset_video() -> Vec<u8> {
    prepend_type(ControlMessageType::ResetVideo, &[])
}

/// Empty payload.
pub fn encode_get_clipboard() -> Vec<u8> {
    prepend_type(ControlMessageType::GetClipboard, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_roundtrip_plain() {
        let h = PacketHeader {
            pts_us: 123_456_789,
            is_config: false,
            is_key: true,
            size: 4096,
        };
        let buf = h.encode();
        assert_eq!(PacketHeader::decode(&buf), h);
    }

    #[test]
    fn packet_header_config_flag_isolated_from_pts() {
        let h = PacketHeader {
            pts_us: 0,
            is_config: true,
            is_key: false,
            size: 10,
        };
        let decoded = PacketHeader::decode(&h.encode());
        assert!(decoded.is_config);
        assert!(!decoded.is_key);
        assert_eq!(decoded.pts_us, 0);
    }

    #[test]
    fn packet_header_max_pts_fits_62_bits() {
        let max_pts = (1u64 << 62) - 1;
        let h = PacketHeader {
            pts_us: max_pts,
            is_config: true,
            is_key: true,
            size: 1,
        };
        let decoded = PacketHeader::decode(&h.encode());
        assert_eq!(decoded.pts_us, max_pts);
        assert!(decoded.is_config && decoded.is_key);
    }

    #[test]
    fn validate_size_rejects_zero_and_oversize() {
        assert!(PacketHeader::validate_size(0, 100).is_err());
        assert!(PacketHeader::validate_size(101, 100).is_err());
        assert!(PacketHeader::validate_size(1, 100).is_ok());
        assert!(PacketHeader::validate_size(100, 100).is_ok());
    }

    #[test]
    fn device_meta_roundtrip() {
        let buf = encode_device_meta("Pixel 7 Pro");
        assert_eq!(buf.len(), DEVICE_META_SIZE);
        assert_eq!(parse_device_meta(&buf).unwrap(), "Pixel 7 Pro");
    }

    #[test]
    fn device_meta_truncates_past_64_bytes() {
        let long = "x".repeat(100);
        let buf = encode_device_meta(&long);
        assert_eq!(parse_device_meta(&buf).unwrap().len(), DEVICE_META_SIZE);
    }

    #[test]
    fn video_stream_header_roundtrip() {
        let h = VideoStreamHeader {
            codec_id: CODEC_H264,
            width: 1080,
            height: 2400,
        };
        assert_eq!(VideoStreamHeader::decode(&h.encode()), h);
    }

    #[test]
    fn codec_tags_spell_ascii() {
        assert_eq!(&CODEC_H264.to_be_bytes(), b"h264");
        assert_eq!(&CODEC_H265.to_be_bytes(), b"h265");
        assert_eq!(&CODEC_OPUS.to_be_bytes(), b"opus");
        assert_eq!(&CODEC_AAC.to_be_bytes(), b"aac ");
    }

    /// Scenario 2 from spec §8: scroll encoding.
    #[test]
    fn scroll_encoding_scenario() {
        let payload = encode_scroll(540, 480, 1080, 1920, 0.0, -8.0, 0);
        assert_eq!(payload[0], ControlMessageType::InjectScroll as u8);
        let body = &payload[1..];
        assert_eq!(u32::from_be_bytes(body[0..4].try_into().unwrap()), 540);
        assert_eq!(u32::from_be_bytes(body[4..8].try_into().unwrap()), 480);
        assert_eq!(u16::from_be_bytes(body[8..10].try_into().unwrap()), 1080);
        assert_eq!(u16::from_be_bytes(body[10..12].try_into().unwrap()), 1920);
        assert_eq!(i16::from_be_bytes(body[12..14].try_into().unwrap()), 0);
        let v_scroll = i16::from_be_bytes(body[14..16].try_into().unwrap());
        assert_eq!(v_scroll, -16384i16);
        assert_eq!(v_scroll as u16, 0xC000);
    }

    /// Scenario 3 from spec §8: touch encoding.
    #[test]
    fn touch_encoding_scenario() {
        let payload = encode_touch(TouchAction::Down, 0, 0, 0, 1080, 1920, 1.0, 1, 1);
        assert_eq!(payload.len(), 1 + 28);
        assert_eq!(payload[0], ControlMessageType::InjectTouch as u8);
        let body = &payload[1..];
        assert_eq!(body[0], 0); // action = down
        assert_eq!(u64::from_be_bytes(body[1..9].try_into().unwrap()), 0);
        assert_eq!(u32::from_be_bytes(body[9..13].try_into().unwrap()), 0);
        assert_eq!(u32::from_be_bytes(body[13..17].try_into().unwrap()), 0);
        assert_eq!(u16::from_be_bytes(body[17..19].try_into().unwrap()), 1080);
        assert_eq!(u16::from_be_bytes(body[19..21].try_into().unwrap()), 1920);
        assert_eq!(u16::from_be_bytes(body[21..23].try_into().unwrap()), 0xFFFF);
        assert_eq!(u32::from_be_bytes(body[23..27].try_into().unwrap()), 1);
        assert_eq!(u32::from_be_bytes(body[27..31].try_into().unwrap()), 1);
    }

    #[test]
    fn text_encoding_length_prefixed() {
        let payload = encode_text("hi");
        assert_eq!(payload[0], ControlMessageType::InjectText as u8);
        assert_eq!(u32::from_be_bytes(payload[1..5].try_into().unwrap()), 2);
        assert_eq!(&payload[5..], b"hi");
    }

    #[test]
    fn reset_video_is_empty_payload() {
        let payload = encode_reset_video();
        assert_eq!(payload, vec![ControlMessageType::ResetVideo as u8]);
    }

    #[test]
    fn set_clipboard_encoding() {
        let payload = encode_set_clipboard(7, true, "abc");
        assert_eq!(payload[0], ControlMessageType::SetClipboard as u8);
        let body = &payload[1..];
        assert_eq!(u64::from_be_bytes(body[0..8].try_into().unwrap()), 7);
        assert_eq!(body[8], 1);
        assert_eq!(u32::from_be_bytes(body[9..13].try_into().unwrap()), 3);
        assert_eq!(&body[13..], b"abc");
    }
}
