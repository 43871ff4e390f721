use crate::{Result, TsError};

/// Parse a 33-bit PTS or DTS timestamp from 5 bytes.
///
/// Layout: `[marker(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
fn parse_timestamp(data: &[u8]) -> u64 {
    (((data[0] as u64 >> 1) & 0x07) << 30)
        | ((data[1] as u64) << 22)
        | (((data[2] as u64 >> 1) & 0x7F) << 15)
        | ((data[3] as u64) << 7)
        | ((data[4] as u64 >> 1) & 0x7F)
}

/// Stream IDs without the optional PES header (ISO 13818-1 Table 2-18).
fn has_optional_pes_header(stream_id: u8) -> bool {
    !matches!(
        stream_id,
        0xBC | 0xBE | 0xBF | 0xF0 | 0xF1 | 0xFF | 0xF2 | 0xF8
    )
}

/// PES header fields needed to cut out the elementary stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    /// Zero means unbounded (common for video).
    pub pes_packet_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Offset to elementary stream data (past the PES header)
    pub payload_offset: usize,
}

impl PesHeader {
    /// Parse a PES header from a buffer starting with the `00 00 01` prefix.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            return Err(TsError::InsufficientData {
                expected: 6,
                actual: data.len(),
            });
        }
        if data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
            return Err(TsError::InvalidPesStartCode);
        }

        let stream_id = data[3];
        let pes_packet_length = u16::from_be_bytes([data[4], data[5]]);

        if !has_optional_pes_header(stream_id) {
            return Ok(PesHeader {
                stream_id,
                pes_packet_length,
                pts: None,
                dts: None,
                payload_offset: 6,
            });
        }

        if data.len() < 9 {
            return Err(TsError::InsufficientData {
                expected: 9,
                actual: data.len(),
            });
        }

        let pts_dts_flags = (data[7] >> 6) & 0x03;
        let header_end = 9 + data[8] as usize;
        if data.len() < header_end {
            return Err(TsError::InsufficientData {
                expected: header_end,
                actual: data.len(),
            });
        }

        let (pts, dts) = match pts_dts_flags {
            0b00 => (None, None),
            0b10 if header_end >= 14 => (Some(parse_timestamp(&data[9..14])), None),
            0b11 if header_end >= 19 => (
                Some(parse_timestamp(&data[9..14])),
                Some(parse_timestamp(&data[14..19])),
            ),
            flags => return Err(TsError::InvalidPtsDtsFlags(flags)),
        };

        Ok(PesHeader {
            stream_id,
            pes_packet_length,
            pts,
            dts,
            payload_offset: header_end,
        })
    }

    /// Total PES size (header + payload) when the length field is set.
    pub fn total_len(&self) -> Option<usize> {
        (self.pes_packet_length != 0).then(|| 6 + self.pes_packet_length as usize)
    }
}

/// Encode a 33-bit timestamp with the given 4-bit prefix. Used by tests to build
/// PES headers.
#[cfg(test)]
pub(crate) fn encode_timestamp(prefix: u8, ts: u64) -> [u8; 5] {
    [
        (prefix << 4) | (((ts >> 30) as u8 & 0x07) << 1) | 1,
        (ts >> 22) as u8,
        (((ts >> 15) as u8 & 0x7F) << 1) | 1,
        (ts >> 7) as u8,
        ((ts as u8 & 0x7F) << 1) | 1,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pts_and_dts() {
        let mut data = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0xC0, 10];
        data.extend_from_slice(&encode_timestamp(0b0011, 183_000));
        data.extend_from_slice(&encode_timestamp(0b0001, 180_000));
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x09]);

        let header = PesHeader::parse(&data).unwrap();
        assert_eq!(header.stream_id, 0xE0);
        assert_eq!(header.pts, Some(183_000));
        assert_eq!(header.dts, Some(180_000));
        assert_eq!(header.payload_offset, 19);
        assert_eq!(header.total_len(), None);
    }

    #[test]
    fn timestamp_keeps_33_bits() {
        let ts = (1u64 << 33) - 1;
        assert_eq!(parse_timestamp(&encode_timestamp(0b0010, ts)), ts);
    }

    #[test]
    fn rejects_missing_start_code() {
        let data = [0x00, 0x00, 0x02, 0xC0, 0x00, 0x10, 0x80, 0x80, 0x05];
        assert_eq!(
            PesHeader::parse(&data).unwrap_err(),
            TsError::InvalidPesStartCode
        );
    }
}
