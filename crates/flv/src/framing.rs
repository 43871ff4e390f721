use crate::tag::FlvTagType;

pub const PREV_TAG_SIZE_FIELD_SIZE: usize = 4;
pub const TAG_HEADER_SIZE: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTagHeader {
    pub tag_type: FlvTagType,
    pub is_filtered: bool,
    pub data_size: u32,
    pub timestamp_ms: u32,
    pub stream_id: u32,
}

pub fn parse_tag_header_bytes(bytes: &[u8; TAG_HEADER_SIZE]) -> ParsedTagHeader {
    let tag_type = FlvTagType::from(bytes[0] & 0x1F);
    let is_filtered = (bytes[0] & 0x20) != 0;

    let data_size = ((bytes[1] as u32) << 16) | ((bytes[2] as u32) << 8) | (bytes[3] as u32);

    // the fourth timestamp byte holds the upper 8 bits
    let timestamp_ms = ((bytes[7] as u32) << 24)
        | ((bytes[4] as u32) << 16)
        | ((bytes[5] as u32) << 8)
        | (bytes[6] as u32);

    let stream_id = ((bytes[8] as u32) << 16) | ((bytes[9] as u32) << 8) | (bytes[10] as u32);

    ParsedTagHeader {
        tag_type,
        is_filtered,
        data_size,
        timestamp_ms,
        stream_id,
    }
}

/// Serialize a tag header. Mirror of [`parse_tag_header_bytes`].
pub fn write_tag_header_bytes(header: &ParsedTagHeader) -> [u8; TAG_HEADER_SIZE] {
    let type_byte = u8::from(header.tag_type) | if header.is_filtered { 0x20 } else { 0 };
    let size = header.data_size.to_be_bytes();
    let ts = header.timestamp_ms.to_be_bytes();
    let sid = header.stream_id.to_be_bytes();
    [
        type_byte, size[1], size[2], size[3], ts[1], ts[2], ts[3], ts[0], sid[1], sid[2], sid[3],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_timestamp_byte_is_most_significant() {
        let bytes = [9, 0, 0, 5, 0x12, 0x34, 0x56, 0x01, 0, 0, 0];
        let header = parse_tag_header_bytes(&bytes);
        assert_eq!(header.tag_type, FlvTagType::Video);
        assert_eq!(header.data_size, 5);
        assert_eq!(header.timestamp_ms, 0x0112_3456);
        assert_eq!(write_tag_header_bytes(&header), bytes);
    }
}
