use std::fmt::Display;

use byteorder::{BigEndian, ReadBytesExt};

use crate::FlvError;

pub const FLV_HEADER_SIZE: usize = 9;
pub const FLV_SIGNATURE: u32 = 0x464C56;
// DataOffset is normally 9; bound it to avoid buffering a bogus header.
pub const MAX_DATA_OFFSET: u32 = 64 * 1024;

/// The 9-byte FLV file header.
#[derive(Debug, Clone, PartialEq)]
pub struct FlvHeader {
    pub version: u8,
    pub has_audio: bool,
    pub has_video: bool,
    /// Total size of the header, usually 9
    pub data_offset: u32,
}

impl Display for FlvHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FLV v{} (audio: {}, video: {}, offset: {})",
            self.version, self.has_audio, self.has_video, self.data_offset
        )
    }
}

impl FlvHeader {
    pub fn new(has_audio: bool, has_video: bool) -> Self {
        FlvHeader {
            version: 0x01,
            has_audio,
            has_video,
            data_offset: FLV_HEADER_SIZE as u32,
        }
    }

    /// Parse the fixed 9 header bytes. Extra bytes up to `data_offset` are
    /// left to the caller.
    pub fn parse(data: &[u8]) -> Result<Self, FlvError> {
        if data.len() < FLV_HEADER_SIZE {
            return Err(FlvError::InvalidHeader(format!(
                "need {FLV_HEADER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let mut reader = data;
        let truncated = |_| FlvError::InvalidHeader("truncated".into());

        let signature = reader.read_u24::<BigEndian>().map_err(truncated)?;
        if signature != FLV_SIGNATURE {
            return Err(FlvError::InvalidHeader("invalid signature".into()));
        }

        let version = reader.read_u8().map_err(truncated)?;
        if version != 0x01 {
            return Err(FlvError::InvalidHeader(format!(
                "unsupported version: {version}"
            )));
        }

        let flags = reader.read_u8().map_err(truncated)?;
        let data_offset = reader.read_u32::<BigEndian>().map_err(truncated)?;
        if !(FLV_HEADER_SIZE as u32..=MAX_DATA_OFFSET).contains(&data_offset) {
            return Err(FlvError::InvalidHeader(format!(
                "invalid data offset: {data_offset}"
            )));
        }

        Ok(FlvHeader {
            version,
            has_audio: (flags & 0b0000_0100) != 0,
            has_video: (flags & 0b0000_0001) != 0,
            data_offset,
        })
    }

    pub fn to_bytes(&self) -> [u8; FLV_HEADER_SIZE] {
        let flags = ((self.has_audio as u8) << 2) | self.has_video as u8;
        let offset = self.data_offset.to_be_bytes();
        [
            b'F', b'L', b'V', self.version, flags, offset[0], offset[1], offset[2], offset[3],
        ]
    }
}
