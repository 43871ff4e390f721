use std::fmt;

use bytes::Bytes;

use crate::framing::{self, ParsedTagHeader};

/// An FLV Tag with a `Bytes` payload buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    /// A timestamp in milliseconds
    pub timestamp_ms: u32,
    pub stream_id: u32,
    pub tag_type: FlvTagType,
    /// Filter bit set in the tag header (encrypted payload).
    pub is_filtered: bool,
    /// Tag body without the 11-byte header
    pub data: Bytes,
}

impl FlvTag {
    pub fn is_script_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::ScriptData)
    }

    pub fn is_audio_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::Audio)
    }

    pub fn is_video_tag(&self) -> bool {
        matches!(self.tag_type, FlvTagType::Video)
    }

    pub fn is_key_frame(&self) -> bool {
        if self.is_filtered || !self.is_video_tag() {
            return false;
        }
        let Some(&first) = self.data.first() else {
            return false;
        };
        // enhanced headers use bit 7 as a flag and three bits for the frame type
        let frame_type = if first & 0x80 != 0 {
            (first >> 4) & 0x07
        } else {
            (first >> 4) & 0x0F
        };
        frame_type == 1
    }

    /// AVC/HEVC/AAC sequence header (legacy packet type 0).
    pub fn is_sequence_header(&self) -> bool {
        if self.is_filtered || self.data.len() < 2 {
            return false;
        }
        match self.tag_type {
            FlvTagType::Video => self.data[0] & 0x80 == 0 && self.data[1] == 0,
            // sound format 10 is AAC
            FlvTagType::Audio => (self.data[0] >> 4) == 10 && self.data[1] == 0,
            _ => false,
        }
    }

    /// Size of the tag including its 11-byte header.
    pub fn size(&self) -> usize {
        self.data.len() + framing::TAG_HEADER_SIZE
    }

    /// Serialize the tag with its header, without the trailing PreviousTagSize.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = framing::write_tag_header_bytes(&ParsedTagHeader {
            tag_type: self.tag_type,
            is_filtered: self.is_filtered,
            data_size: self.data.len() as u32,
            timestamp_ms: self.timestamp_ms,
            stream_id: self.stream_id,
        });
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.data);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlvTagType {
    Audio,
    Video,
    ScriptData,
    Unknown(u8),
}

impl From<u8> for FlvTagType {
    fn from(value: u8) -> Self {
        match value {
            8 => FlvTagType::Audio,
            9 => FlvTagType::Video,
            18 => FlvTagType::ScriptData,
            _ => FlvTagType::Unknown(value),
        }
    }
}

impl From<FlvTagType> for u8 {
    fn from(value: FlvTagType) -> Self {
        match value {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::ScriptData => 18,
            FlvTagType::Unknown(val) => val,
        }
    }
}

impl fmt::Display for FlvTagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlvTagType::Audio => write!(f, "Audio"),
            FlvTagType::Video => write!(f, "Video"),
            FlvTagType::ScriptData => write!(f, "Script"),
            FlvTagType::Unknown(value) => write!(f, "Unknown({value})"),
        }
    }
}
