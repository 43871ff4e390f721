// Frame packaging: elementary stream access units to RTMP audio/video message bodies.
//
// Message bodies use the FLV tag body layout, so the packager hands out
// `FlvTag`s that the publisher forwards unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use flv::{FlvTag, FlvTagType};
use tracing::{debug, trace, warn};
use ts::StreamType;

const CODEC_ID_AVC: u8 = 7;
const CODEC_ID_HEVC: u8 = 12;
const SOUND_FORMAT_AAC: u8 = 10;
/// AAC, 44 kHz, 16-bit, stereo. Players read the real values from the ASC.
const AAC_SOUND_HEADER: u8 = (SOUND_FORMAT_AAC << 4) | 0x0F;

const PACKET_SEQUENCE_HEADER: u8 = 0;
const PACKET_DATA: u8 = 1;

const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;

const AAC_SAMPLES_PER_FRAME: u64 = 1024;

const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn from_stream_type(stream_type: StreamType) -> Option<Self> {
        match stream_type {
            StreamType::H264 => Some(Self::H264),
            StreamType::H265 => Some(Self::H265),
            _ => None,
        }
    }

    fn codec_id(self) -> u8 {
        match self {
            Self::H264 => CODEC_ID_AVC,
            Self::H265 => CODEC_ID_HEVC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
}

impl AudioCodec {
    pub fn from_stream_type(stream_type: StreamType) -> Option<Self> {
        match stream_type {
            StreamType::Aac => Some(Self::Aac),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ParameterSets {
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

/// Turns Annex-B video and ADTS audio into RTMP message bodies.
///
/// Decoder configuration records are sent once, and again whenever the
/// parameter sets change. Frames seen before the first configuration are
/// dropped.
#[derive(Debug, Default)]
pub struct Packager {
    params: ParameterSets,
    video_config: Option<(VideoCodec, Bytes)>,
    audio_config: Option<[u8; 2]>,
    dropped: u64,
}

impl Packager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames dropped so far for lack of a decoder configuration.
    #[cfg(test)]
    fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn package_video(
        &mut self,
        codec: VideoCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Vec<FlvTag> {
        let mut tags = Vec::with_capacity(2);
        let mut nalus = Vec::new();
        let mut key_frame = false;

        for nal in split_annex_b(payload) {
            match classify_nal(codec, nal) {
                NalKind::Vps => self.params.vps = Some(Bytes::copy_from_slice(nal)),
                NalKind::Sps => self.params.sps = Some(Bytes::copy_from_slice(nal)),
                NalKind::Pps => self.params.pps = Some(Bytes::copy_from_slice(nal)),
                NalKind::Aud => {}
                NalKind::Key => {
                    key_frame = true;
                    nalus.push(nal);
                }
                NalKind::Other => nalus.push(nal),
            }
        }

        if let Some(record) = self.configuration_record(codec) {
            let changed = self
                .video_config
                .as_ref()
                .is_none_or(|(c, r)| *c != codec || *r != record);
            if changed {
                debug!(?codec, len = record.len(), "video decoder configuration");
                let mut body = BytesMut::with_capacity(record.len() + 5);
                body.put_u8((FRAME_KEY << 4) | codec.codec_id());
                body.put_u8(PACKET_SEQUENCE_HEADER);
                body.put_slice(&[0, 0, 0]);
                body.put_slice(&record);
                tags.push(tag(FlvTagType::Video, dts_ms, body.freeze()));
                self.video_config = Some((codec, record));
            }
        }

        if nalus.is_empty() {
            return tags;
        }
        if !matches!(self.video_config, Some((c, _)) if c == codec) {
            self.dropped += 1;
            trace!(
                ?codec,
                pts_ms,
                dropped = self.dropped,
                "video frame before parameter sets, dropped"
            );
            return tags;
        }

        let size: usize = nalus.iter().map(|n| n.len() + 4).sum();
        let mut body = BytesMut::with_capacity(size + 5);
        let frame_type = if key_frame { FRAME_KEY } else { FRAME_INTER };
        body.put_u8((frame_type << 4) | codec.codec_id());
        body.put_u8(PACKET_DATA);
        body.put_slice(&composition_time(pts_ms, dts_ms));
        for nal in nalus {
            body.put_u32(nal.len() as u32);
            body.put_slice(nal);
        }
        tags.push(tag(FlvTagType::Video, dts_ms, body.freeze()));
        tags
    }

    /// Package every ADTS frame in `payload`; frames after the first advance
    /// by 1024 samples each.
    pub fn package_audio(
        &mut self,
        codec: AudioCodec,
        payload: &[u8],
        pts_ms: u64,
        _dts_ms: u64,
    ) -> Vec<FlvTag> {
        let AudioCodec::Aac = codec;
        let mut tags = Vec::new();
        let mut offset = 0;
        let mut index = 0u64;

        while offset + 7 <= payload.len() {
            let Some(frame) = AdtsFrame::parse(&payload[offset..]) else {
                warn!(offset, len = payload.len(), "bad ADTS frame, rest of PES dropped");
                break;
            };
            let raw = &payload[offset + frame.header_len..offset + frame.frame_len];
            offset += frame.frame_len;

            let config = frame.audio_specific_config();
            if self.audio_config != Some(config) {
                debug!(
                    sample_rate = frame.sample_rate,
                    channels = frame.channels,
                    "audio specific config"
                );
                let mut body = BytesMut::with_capacity(4);
                body.put_u8(AAC_SOUND_HEADER);
                body.put_u8(PACKET_SEQUENCE_HEADER);
                body.put_slice(&config);
                tags.push(tag(FlvTagType::Audio, pts_ms, body.freeze()));
                self.audio_config = Some(config);
            }

            let ts = pts_ms + index * AAC_SAMPLES_PER_FRAME * 1000 / frame.sample_rate as u64;
            index += 1;

            let mut body = BytesMut::with_capacity(raw.len() + 2);
            body.put_u8(AAC_SOUND_HEADER);
            body.put_u8(PACKET_DATA);
            body.put_slice(raw);
            tags.push(tag(FlvTagType::Audio, ts, body.freeze()));
        }
        tags
    }

    fn configuration_record(&self, codec: VideoCodec) -> Option<Bytes> {
        let sps = self.params.sps.as_ref()?;
        let pps = self.params.pps.as_ref()?;
        match codec {
            VideoCodec::H264 => avc_decoder_configuration(sps, pps),
            VideoCodec::H265 => {
                hevc_decoder_configuration(self.params.vps.as_ref()?, sps, pps)
            }
        }
    }
}

fn tag(tag_type: FlvTagType, timestamp_ms: u64, data: Bytes) -> FlvTag {
    FlvTag {
        timestamp_ms: timestamp_ms as u32,
        stream_id: 0,
        tag_type,
        is_filtered: false,
        data,
    }
}

/// Signed 24-bit composition time offset.
fn composition_time(pts_ms: u64, dts_ms: u64) -> [u8; 3] {
    let cts = (pts_ms as i64 - dts_ms as i64).clamp(-0x80_0000, 0x7F_FFFF) as i32;
    let b = cts.to_be_bytes();
    [b[1], b[2], b[3]]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalKind {
    Vps,
    Sps,
    Pps,
    Aud,
    Key,
    Other,
}

fn classify_nal(codec: VideoCodec, nal: &[u8]) -> NalKind {
    match codec {
        VideoCodec::H264 => match nal[0] & 0x1F {
            5 => NalKind::Key,
            7 => NalKind::Sps,
            8 => NalKind::Pps,
            9 => NalKind::Aud,
            _ => NalKind::Other,
        },
        VideoCodec::H265 => match (nal[0] >> 1) & 0x3F {
            16..=21 => NalKind::Key,
            32 => NalKind::Vps,
            33 => NalKind::Sps,
            34 => NalKind::Pps,
            35 => NalKind::Aud,
            _ => NalKind::Other,
        },
    }
}

/// Position and length of the next 3 or 4 byte start code.
fn find_start_code(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && data.get(i + 3) == Some(&1) {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// NAL units of an Annex-B access unit. Input without a start code is taken
/// as a single NAL unit.
fn split_annex_b(data: &[u8]) -> Vec<&[u8]> {
    fn push<'a>(nals: &mut Vec<&'a [u8]>, nal: &'a [u8]) {
        let end = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        if end > 0 {
            nals.push(&nal[..end]);
        }
    }

    let mut nals = Vec::new();
    let Some((first, len)) = find_start_code(data) else {
        push(&mut nals, data);
        return nals;
    };

    let mut start = first + len;
    loop {
        match find_start_code(&data[start..]) {
            Some((pos, len)) => {
                push(&mut nals, &data[start..start + pos]);
                start += pos + len;
            }
            None => {
                push(&mut nals, &data[start..]);
                return nals;
            }
        }
    }
}

fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// AVCDecoderConfigurationRecord with one SPS and one PPS.
fn avc_decoder_configuration(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    if sps.len() < 4 {
        return None;
    }
    let mut record = BytesMut::with_capacity(11 + sps.len() + pps.len());
    record.put_u8(1);
    // profile, compatibility, level
    record.put_slice(&sps[1..4]);
    // 4-byte NAL lengths
    record.put_u8(0xFF);
    record.put_u8(0xE1);
    record.put_u16(sps.len() as u16);
    record.put_slice(sps);
    record.put_u8(1);
    record.put_u16(pps.len() as u16);
    record.put_slice(pps);
    Some(record.freeze())
}

/// HEVCDecoderConfigurationRecord with one VPS, SPS and PPS. Profile, tier
/// and level come from the SPS; chroma format and bit depth are written as
/// 4:2:0 8-bit.
fn hevc_decoder_configuration(vps: &[u8], sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    let rbsp = remove_emulation_prevention(sps);
    if rbsp.len() < 15 {
        return None;
    }
    let max_sub_layers_minus1 = (rbsp[2] >> 1) & 0x07;
    let temporal_id_nested = rbsp[2] & 0x01;

    let mut record = BytesMut::with_capacity(38 + vps.len() + sps.len() + pps.len());
    record.put_u8(1);
    // profile space, tier, profile idc
    record.put_u8(rbsp[3]);
    // compatibility flags
    record.put_slice(&rbsp[4..8]);
    // constraint indicator flags
    record.put_slice(&rbsp[8..14]);
    record.put_u8(rbsp[14]);
    record.put_u16(0xF000);
    record.put_u8(0xFC);
    record.put_u8(0xFC | 1);
    record.put_u8(0xF8);
    record.put_u8(0xF8);
    record.put_u16(0);
    record.put_u8(((max_sub_layers_minus1 + 1) << 3) | (temporal_id_nested << 2) | 0x03);
    record.put_u8(3);
    for (nal_type, nal) in [(32u8, vps), (33, sps), (34, pps)] {
        record.put_u8(0x80 | nal_type);
        record.put_u16(1);
        record.put_u16(nal.len() as u16);
        record.put_slice(nal);
    }
    Some(record.freeze())
}

struct AdtsFrame {
    object_type: u8,
    sample_rate_index: u8,
    sample_rate: u32,
    channels: u8,
    header_len: usize,
    frame_len: usize,
}

impl AdtsFrame {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 7 || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return None;
        }
        let protection_absent = data[1] & 0x01 == 1;
        let header_len = if protection_absent { 7 } else { 9 };
        let profile = (data[2] >> 6) & 0x03;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        let channels = ((data[2] & 0x01) << 2) | (data[3] >> 6);
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);

        let sample_rate = *AAC_SAMPLE_RATES.get(sample_rate_index as usize)?;
        if frame_len < header_len || frame_len > data.len() {
            return None;
        }
        Some(Self {
            object_type: profile + 1,
            sample_rate_index,
            sample_rate,
            channels,
            header_len,
            frame_len,
        })
    }

    /// Two-byte AudioSpecificConfig.
    fn audio_specific_config(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channels << 3),
        ]
    }
}
