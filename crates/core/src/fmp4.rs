//! Fragmented MP4 (ISO/IEC 14496-12) writer.
//!
//! No teacher precedent for container muxing exists in this workspace;
//! box layout follows the ISO BMFF / ISO/IEC 14496-15 (avcC) standards
//! directly rather than any example repo.

use crate::transcoder;
use bytes::{Bytes, BytesMut};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
pub const VIDEO_TIMESCALE: u32 = 90_000;
pub const AUDIO_TIMESCALE: u32 = 48_000;

const DEFAULT_VIDEO_SAMPLE_DURATION: u32 = VIDEO_TIMESCALE / 30;
const DEFAULT_AUDIO_SAMPLE_DURATION: u32 = 1024;

pub struct VideoTrackInit {
    pub width: u16,
    pub height: u16,
    pub sps: Bytes,
    pub pps: Bytes,
}

pub struct AudioTrackInit {
    pub audio_specific_config: Bytes,
    pub channels: u16,
    pub sample_rate: u32,
}

/// One decoded sample destined for a fragment, in presentation order.
pub struct FragmentSample {
    pub track: TrackKind,
    pub data: Bytes,
    pub dts: u64,
    pub is_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

fn write_box(out: &mut BytesMut, box_type: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let size_pos = out.len();
    out.extend_from_slice(&[0u8; 4]); // placeholder size
    out.extend_from_slice(box_type);
    body(out);
    let size = (out.len() - size_pos) as u32;
    out[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box(out: &mut BytesMut, box_type: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut BytesMut)) {
    write_box(out, box_type, |out| {
        out.extend_from_slice(&[version]);
        out.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(out);
    });
}

/// Build the one-time `ftyp+moov` initialization segment for a stream with
/// a video track and an optional audio track.
pub fn build_init_segment(video: &VideoTrackInit, audio: Option<&AudioTrackInit>) -> Bytes {
    let mut out = BytesMut::new();

    write_box(&mut out, b"ftyp", |out| {
        out.extend_from_slice(b"isom");
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(b"isom");
        out.extend_from_slice(b"iso5");
        out.extend_from_slice(b"dash");
    });

    write_box(&mut out, b"moov", |out| {
        full_box(out, b"mvhd", 0, 0, |out| {
            out.extend_from_slice(&0u32.to_be_bytes()); // creation_time
            out.extend_from_slice(&0u32.to_be_bytes()); // modification_time
            out.extend_from_slice(&VIDEO_TIMESCALE.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes()); // duration, unknown
            out.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
            out.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
            out.extend_from_slice(&[0u8; 10]); // reserved
            out.extend_from_slice(&identity_matrix());
            out.extend_from_slice(&[0u8; 24]); // pre_defined
            let next_track_id = if audio.is_some() { 3 } else { 2 };
            out.extend_from_slice(&(next_track_id as u32).to_be_bytes());
        });

        write_video_trak(out, video);
        if let Some(audio) = audio {
            write_audio_trak(out, audio);
        }

        write_box(out, b"mvex", |out| {
            full_box(out, b"trex", 0, 0, |out| {
                out.extend_from_slice(&VIDEO_TRACK_ID.to_be_bytes());
                out.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
                out.extend_from_slice(&DEFAULT_VIDEO_SAMPLE_DURATION.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
            });
            if audio.is_some() {
                full_box(out, b"trex", 0, 0, |out| {
                    out.extend_from_slice(&AUDIO_TRACK_ID.to_be_bytes());
                    out.extend_from_slice(&1u32.to_be_bytes());
                    out.extend_from_slice(&DEFAULT_AUDIO_SAMPLE_DURATION.to_be_bytes());
                    out.extend_from_slice(&0u32.to_be_bytes());
                    out.extend_from_slice(&0u32.to_be_bytes());
                });
            }
        });
    });

    out.freeze()
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn write_video_trak(out: &mut BytesMut, video: &VideoTrackInit) {
    write_box(out, b"trak", |out| {
        full_box(out, b"tkhd", 0, 0x000007, |out| {
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&VIDEO_TRACK_ID.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes()); // reserved
            out.extend_from_slice(&0u32.to_be_bytes()); // duration, unknown
            out.extend_from_slice(&[0u8; 8]); // reserved
            out.extend_from_slice(&0u16.to_be_bytes()); // layer
            out.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
            out.extend_from_slice(&0u16.to_be_bytes()); // volume (video track)
            out.extend_from_slice(&0u16.to_be_bytes()); // reserved
            out.extend_from_slice(&identity_matrix());
            out.extend_from_slice(&((video.width as u32) << 16).to_be_bytes());
            out.extend_from_slice(&((video.height as u32) << 16).to_be_bytes());
        });

        write_box(out, b"mdia", |out| {
            full_box(out, b"mdhd", 0, 0, |out| {
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&VIDEO_TIMESCALE.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0x55C4u16.to_be_bytes()); // "und"
                out.extend_from_slice(&0u16.to_be_bytes());
            });
            full_box(out, b"hdlr", 0, 0, |out| {
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(b"vide");
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(b"VideoHandler\0");
            });
            write_box(out, b"minf", |out| {
                full_box(out, b"vmhd", 0, 1, |out| {
                    out.extend_from_slice(&[0u8; 8]);
                });
                write_dinf(out);
                write_box(out, b"stbl", |out| {
                    full_box(out, b"stsd", 0, 0, |out| {
                        out.extend_from_slice(&1u32.to_be_bytes());
                        write_box(out, b"avc1", |out| {
                            out.extend_from_slice(&[0u8; 6]); // reserved
                            out.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index
                            out.extend_from_slice(&[0u8; 16]); // pre_defined + reserved
                            out.extend_from_slice(&video.width.to_be_bytes());
                            out.extend_from_slice(&video.height.to_be_bytes());
                            out.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution
                            out.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution
                            out.extend_from_slice(&0u32.to_be_bytes()); // reserved
                            out.extend_from_slice(&1u16.to_be_bytes()); // frame_count
                            out.extend_from_slice(&[0u8; 32]); // compressorname
                            out.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
                            out.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined = -1
                            write_box(out, b"avcC", |out| {
                                out.extend_from_slice(&transcoder::build_avc_decoder_config(
                                    &video.sps, &video.pps,
                                ));
                            });
                        });
                    });
                    empty_sample_tables(out);
                });
            });
        });
    });
}

fn write_audio_trak(out: &mut BytesMut, audio: &AudioTrackInit) {
    write_box(out, b"trak", |out| {
        full_box(out, b"tkhd", 0, 0x000007, |out| {
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&AUDIO_TRACK_ID.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&0x0100u16.to_be_bytes()); // full volume
            out.extend_from_slice(&0u16.to_be_bytes());
            out.extend_from_slice(&identity_matrix());
            out.extend_from_slice(&0u32.to_be_bytes()); // width
            out.extend_from_slice(&0u32.to_be_bytes()); // height
        });

        write_box(out, b"mdia", |out| {
            full_box(out, b"mdhd", 0, 0, |out| {
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&audio.sample_rate.to_be_bytes());
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(&0x55C4u16.to_be_bytes());
                out.extend_from_slice(&0u16.to_be_bytes());
            });
            full_box(out, b"hdlr", 0, 0, |out| {
                out.extend_from_slice(&0u32.to_be_bytes());
                out.extend_from_slice(b"soun");
                out.extend_from_slice(&[0u8; 12]);
                out.extend_from_slice(b"SoundHandler\0");
            });
            write_box(out, b"minf", |out| {
                full_box(out, b"smhd", 0, 0, |out| {
                    out.extend_from_slice(&0u16.to_be_bytes());
                    out.extend_from_slice(&0u16.to_be_bytes());
                });
                write_dinf(out);
                write_box(out, b"stbl", |out| {
                    full_box(out, b"stsd", 0, 0, |out| {
                        out.extend_from_slice(&1u32.to_be_bytes());
                        write_box(out, b"mp4a", |out| {
                            out.extend_from_slice(&[0u8; 6]);
                            out.extend_from_slice(&1u16.to_be_bytes());
                            out.extend_from_slice(&0u32.to_be_bytes());
                            out.extend_from_slice(&0u32.to_be_bytes());
                            out.extend_from_slice(&audio.channels.to_be_bytes());
                            out.extend_from_slice(&16u16.to_be_bytes()); // samplesize
                            out.extend_from_slice(&0u16.to_be_bytes());
                            out.extend_from_slice(&0u16.to_be_bytes());
                            out.extend_from_slice(&((audio.sample_rate as u32) << 16).to_be_bytes());
                            write_box(out, b"esds", |out| {
                                out.extend_from_slice(&[0u8; 4]); // version/flags
                                write_descriptor(out, 0x03, |out| {
                                    out.extend_from_slice(&1u16.to_be_bytes()); // ES_ID
                                    out.extend_from_slice(&[0u8]); // flags
                                    write_descriptor(out, 0x04, |out| {
                                        out.extend_from_slice(&[0x40]); // objectTypeIndication: MPEG-4 audio
                                        out.extend_from_slice(&[0x15]); // streamType audio, upstream=0, reserved=1
                                        out.extend_from_slice(&[0u8; 3]); // bufferSizeDB
                                        out.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
                                        out.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
                                        write_descriptor(out, 0x05, |out| {
                                            out.extend_from_slice(&audio.audio_specific_config);
                                        });
                                    });
                                    write_descriptor(out, 0x06, |out| {
                                        out.extend_from_slice(&[0x02]);
                                    });
                                });
                            });
                        });
                    });
                    empty_sample_tables(out);
                });
            });
        });
    });
}

fn write_descriptor(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    let mut inner = BytesMut::new();
    body(&mut inner);
    out.extend_from_slice(&[tag]);
    out.extend_from_slice(&encode_descriptor_length(inner.len()));
    out.extend_from_slice(&inner);
}

fn encode_descriptor_length(len: usize) -> Vec<u8> {
    // MPEG-4 descriptor length: 7 bits per byte, continuation bit set on all
    // but the last byte, big-endian.
    let mut bytes = vec![(len & 0x7F) as u8];
    let mut rem = len >> 7;
    while rem > 0 {
        bytes.push(((rem & 0x7F) as u8) | 0x80);
        rem >>= 7;
    }
    bytes.reverse();
    bytes
}

fn write_dinf(out: &mut BytesMut) {
    write_box(out, b"dinf", |out| {
        full_box(out, b"dref", 0, 0, |out| {
            out.extend_from_slice(&1u32.to_be_bytes());
            full_box(out, b"url ", 0, 1, |_| {});
        });
    });
}

fn empty_sample_tables(out: &mut BytesMut) {
    full_box(out, b"stts", 0, 0, |out| out.extend_from_slice(&0u32.to_be_bytes()));
    full_box(out, b"stsc", 0, 0, |out| out.extend_from_slice(&0u32.to_be_bytes()));
    full_box(out, b"stsz", 0, 0, |out| {
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
    });
    full_box(out, b"stco", 0, 0, |out| out.extend_from_slice(&0u32.to_be_bytes()));
}

/// Stateful per-stream fragment builder: tracks the strictly increasing
/// `sequence_number` and the baseline-zero per-track decode time (I4).
pub struct FragmentWriter {
    next_sequence_number: u32,
    video_baseline: Option<u64>,
    audio_baseline: Option<u64>,
    has_seen_keyframe: bool,
    sps: Bytes,
    pps: Bytes,
}

impl FragmentWriter {
    /// `sps`/`pps` are the AVCC-less parameter sets cached from the Source's
    /// video handshake; they're prepended, length-prefixed, to every
    /// key-frame's NAL sequence so a fresh MSE `SourceBuffer` can decode
    /// starting from any fragment that carries one.
    pub fn new(sps: Bytes, pps: Bytes) -> Self {
        Self {
            next_sequence_number: 1,
            video_baseline: None,
            audio_baseline: None,
            has_seen_keyframe: false,
            sps,
            pps,
        }
    }

    /// Build one `moof+mdat` fragment from a PTS-ordered mixed batch.
    /// Empty-payload samples are dropped; non-key video before the first
    /// key-frame this stream has ever seen is dropped (decoder priming).
    pub fn write_fragment(&mut self, samples: Vec<FragmentSample>) -> Option<Bytes> {
        let mut video: Vec<FragmentSample> = Vec::new();
        let mut audio: Vec<FragmentSample> = Vec::new();

        for sample in samples {
            if sample.data.is_empty() {
                continue;
            }
            match sample.track {
                TrackKind::Video => {
                    if sample.is_key {
                        self.has_seen_keyframe = true;
                    }
                    if self.has_seen_keyframe {
                        video.push(sample);
                    }
                }
                TrackKind::Audio => audio.push(sample),
            }
        }

        if video.is_empty() && audio.is_empty() {
            return None;
        }

        if let Some(first) = video.first() {
            self.video_baseline.get_or_insert(first.dts);
        }
        if let Some(first) = audio.first() {
            self.audio_baseline.get_or_insert(first.dts);
        }

        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;

        let video_entries = video
            .iter()
            .map(|s| self.encode_video_sample(s))
            .collect::<Vec<_>>();
        let audio_entries = audio
            .iter()
            .map(|s| strip_audio_adts(s))
            .collect::<Vec<_>>();

        let video_durations = sample_durations(&video, DEFAULT_VIDEO_SAMPLE_DURATION);
        let audio_durations = sample_durations(&audio, DEFAULT_AUDIO_SAMPLE_DURATION);

        let mut out = BytesMut::new();
        let moof_start;

        write_box(&mut out, b"moof", |out| {
            full_box(out, b"mfhd", 0, 0, |out| {
                out.extend_from_slice(&sequence_number.to_be_bytes());
            });

            if !video_entries.is_empty() {
                write_traf(
                    out,
                    VIDEO_TRACK_ID,
                    self.video_baseline.unwrap_or(0),
                    video.first().map(|s| s.dts).unwrap_or(0),
                    &video_entries,
                    &video_durations,
                    video.iter().map(|s| s.is_key).collect(),
                );
            }
            if !audio_entries.is_empty() {
                write_traf(
                    out,
                    AUDIO_TRACK_ID,
                    self.audio_baseline.unwrap_or(0),
                    audio.first().map(|s| s.dts).unwrap_or(0),
                    &audio_entries,
                    &audio_durations,
                    audio.iter().map(|_| true).collect(),
                );
            }
        });
        moof_start = 0; // single fragment per buffer, offsets are mdat-relative

        let _ = moof_start;
        let moof_len = out.len();

        write_box(&mut out, b"mdat", |out| {
            for entry in &video_entries {
                out.extend_from_slice(entry);
            }
            for entry in &audio_entries {
                out.extend_from_slice(entry);
            }
        });

        patch_trun_data_offsets(&mut out, moof_len);

        Some(out.freeze())
    }

    /// Every key-frame gets the cached SPS/PPS prepended, length-prefixed,
    /// ahead of its own NAL data so a decoder attached mid-stream (or after
    /// an MSE `SourceBuffer` reset) can start decoding at this fragment.
    fn encode_video_sample(&self, sample: &FragmentSample) -> Vec<u8> {
        let avcc = transcoder::annex_b_to_avcc(&sample.data);
        if !sample.is_key {
            return avcc;
        }
        let mut out = Vec::with_capacity(self.sps.len() + self.pps.len() + 8 + avcc.len());
        out.extend_from_slice(&(self.sps.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.sps);
        out.extend_from_slice(&(self.pps.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.pps);
        out.extend_from_slice(&avcc);
        out
    }
}

fn strip_audio_adts(sample: &FragmentSample) -> Vec<u8> {
    transcoder::strip_adts_header(&sample.data).to_vec()
}

/// Duration of each sample is the gap to the next sample's DTS; the last
/// sample in the batch falls back to the codec default.
fn sample_durations(samples: &[FragmentSample], default: u32) -> Vec<u32> {
    let mut durations = Vec::with_capacity(samples.len());
    for i in 0..samples.len() {
        if i + 1 < samples.len() {
            durations.push((samples[i + 1].dts - samples[i].dts) as u32);
        } else {
            durations.push(default);
        }
    }
    durations
}

#[allow(clippy::too_many_arguments)]
fn write_traf(
    out: &mut BytesMut,
    track_id: u32,
    baseline: u64,
    first_dts: u64,
    entries: &[Vec<u8>],
    durations: &[u32],
    is_key: Vec<bool>,
) {
    write_box(out, b"traf", |out| {
        full_box(out, b"tfhd", 0, 0x020000, |out| {
            out.extend_from_slice(&track_id.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes()); // default_sample_flags placeholder (unused, flags bit set for default-base-is-moof)
        });
        full_box(out, b"tfdt", 1, 0, |out| {
            out.extend_from_slice(&(first_dts - baseline).to_be_bytes());
        });
        full_box(out, b"trun", 0, 0x000205, |out| {
            out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes()); // data_offset, patched below
            for (i, entry) in entries.iter().enumerate() {
                out.extend_from_slice(&durations[i].to_be_bytes());
                out.extend_from_slice(&(entry.len() as u32).to_be_bytes());
                let flags: u32 = if is_key.get(i).copied().unwrap_or(false) {
                    0x0200_0000 // sample_depends_on = 2 (does not depend on others)
                } else {
                    0x0101_0000 // sample_depends_on = 1, non-sync
                };
                out.extend_from_slice(&flags.to_be_bytes());
            }
        });
    });
}

/// `trun.data_offset` must point from the start of `moof` to the first
/// sample's byte inside the following `mdat`; fill it in now that the
/// total moof length is known.
fn patch_trun_data_offsets(out: &mut BytesMut, moof_len: usize) {
    let data_offset = (moof_len + 8) as u32; // +8 for the mdat box header
    let mut i = 0;
    while i + 8 <= moof_len {
        if &out[i + 4..i + 8] == b"trun" {
            let offset_field = i + 8 /* size+type */ + 4 /* version/flags */ + 4 /* sample_count */;
            out[offset_field..offset_field + 4].copy_from_slice(&data_offset.to_be_bytes());
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sps_pps() -> (Bytes, Bytes) {
        (
            Bytes::from_static(&[0x67, 0x64, 0x00, 0x1f, 0xac]),
            Bytes::from_static(&[0x68, 0xeb, 0xe3, 0xcb]),
        )
    }

    #[test]
    fn init_segment_starts_with_ftyp_then_moov() {
        let (sps, pps) = sps_pps();
        let init = build_init_segment(
            &VideoTrackInit { width: 1080, height: 1920, sps, pps },
            None,
        );
        assert_eq!(&init[4..8], b"ftyp");
        let ftyp_size = u32::from_be_bytes(init[0..4].try_into().unwrap()) as usize;
        assert_eq!(&init[ftyp_size + 4..ftyp_size + 8], b"moov");
    }

    #[test]
    fn sequence_number_strictly_increases_across_fragments() {
        let (sps, pps) = sps_pps();
        let mut writer = FragmentWriter::new(sps, pps);
        let mut seen = Vec::new();
        for n in 0..3u64 {
            let frag = writer
                .write_fragment(vec![FragmentSample {
                    track: TrackKind::Video,
                    data: Bytes::from(vec![0, 0, 0, 1, 0x65, 1, 2, 3]),
                    dts: n * 3000,
                    is_key: true,
                }])
                .unwrap();
            let moof_size = u32::from_be_bytes(frag[0..4].try_into().unwrap()) as usize;
            let mfhd_offset = 8 + 8; // moof header + mfhd size/type
            let seq = u32::from_be_bytes(frag[mfhd_offset + 4..mfhd_offset + 8].try_into().unwrap());
            seen.push(seq);
            let _ = moof_size;
        }
        assert!(seen.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn non_key_video_before_first_keyframe_is_dropped() {
        let (sps, pps) = sps_pps();
        let mut writer = FragmentWriter::new(sps, pps);
        let result = writer.write_fragment(vec![FragmentSample {
            track: TrackKind::Video,
            data: Bytes::from(vec![0, 0, 0, 1, 0x41, 1, 2]),
            dts: 0,
            is_key: false,
        }]);
        assert!(result.is_none());
    }

    #[test]
    fn empty_payload_samples_are_dropped() {
        let (sps, pps) = sps_pps();
        let mut writer = FragmentWriter::new(sps, pps);
        let result = writer.write_fragment(vec![FragmentSample {
            track: TrackKind::Video,
            data: Bytes::new(),
            dts: 0,
            is_key: true,
        }]);
        assert!(result.is_none());
    }

    #[test]
    fn base_media_decode_time_is_relative_to_first_sample_on_track() {
        let (sps, pps) = sps_pps();
        let mut writer = FragmentWriter::new(sps, pps);
        let _first = writer
            .write_fragment(vec![FragmentSample {
                track: TrackKind::Video,
                data: Bytes::from(vec![0, 0, 0, 1, 0x65, 1]),
                dts: 5000,
                is_key: true,
            }])
            .unwrap();
        let second = writer
            .write_fragment(vec![FragmentSample {
                track: TrackKind::Video,
                data: Bytes::from(vec![0, 0, 0, 1, 0x41, 1]),
                dts: 8000,
                is_key: false,
            }])
            .unwrap();
        // tfdt is version=1 (8-byte body), sits after tfhd (full box: 8
        // size/type + 4 version/flags + 4 track_id + 4 flags payload = 20
        // bytes) and its own 12-byte size/type/version-flags header.
        let tfhd_len = 8 + 4 + 4 + 4;
        let tfdt_offset =
            8 /* moof hdr */ + 16 /* mfhd full box */ + 8 /* traf hdr */ + tfhd_len + 12;
        let base_media_decode_time =
            u64::from_be_bytes(second[tfdt_offset..tfdt_offset + 8].try_into().unwrap());
        assert_eq!(base_media_decode_time, 3000);
    }

    #[test]
    fn keyframe_sample_is_prefixed_with_length_prefixed_sps_and_pps() {
        let (sps, pps) = sps_pps();
        let writer = FragmentWriter::new(sps.clone(), pps.clone());
        let nal = Bytes::from(vec![0, 0, 0, 1, 0x65, 1, 2, 3]);
        let encoded = writer.encode_video_sample(&FragmentSample {
            track: TrackKind::Video,
            data: nal,
            dts: 0,
            is_key: true,
        });
        assert_eq!(&encoded[0..4], &(sps.len() as u32).to_be_bytes());
        assert_eq!(&encoded[4..4 + sps.len()], &sps[..]);
        let pps_len_offset = 4 + sps.len();
        assert_eq!(
            &encoded[pps_len_offset..pps_len_offset + 4],
            &(pps.len() as u32).to_be_bytes()
        );
        assert_eq!(&encoded[pps_len_offset + 4..pps_len_offset + 4 + pps.len()], &pps[..]);
    }

    #[test]
    fn non_keyframe_sample_has_no_sps_pps_prefix() {
        let (sps, pps) = sps_pps();
        let writer = FragmentWriter::new(sps, pps);
        let nal = Bytes::from(vec![0, 0, 0, 1, 0x41, 1, 2, 3]);
        let encoded = writer.encode_video_sample(&FragmentSample {
            track: TrackKind::Video,
            data: nal.clone(),
            dts: 0,
            is_key: false,
        });
        assert_eq!(encoded, transcoder::annex_b_to_avcc(&nal));
    }
}
