// Push-based FLV reader for network streams.
use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::FlvError;
use crate::framing::{self, PREV_TAG_SIZE_FIELD_SIZE, TAG_HEADER_SIZE};
use crate::header::{FLV_HEADER_SIZE, FlvHeader};
use crate::tag::{FlvTag, FlvTagType};

/// Upper bound for a single buffered tag.
pub const DEFAULT_MAX_TAG_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Nothing consumed yet: a file header, a PreviousTagSize or a tag.
    Start,
    PrevTagSize,
    Tag,
}

/// Incremental FLV tag reader.
///
/// Bytes are pushed as they arrive; tags are yielded once complete, regardless
/// of how the input is chunked. The stream may begin with the `FLV` file
/// header, or join mid-stream at a PreviousTagSize field or a tag boundary.
#[derive(Debug)]
pub struct FlvTagReader {
    buffer: BytesMut,
    state: State,
    header: Option<FlvHeader>,
    max_tag_size: usize,
    tags_read: u64,
}

impl Default for FlvTagReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FlvTagReader {
    pub fn new() -> Self {
        Self::with_max_tag_size(DEFAULT_MAX_TAG_SIZE)
    }

    pub fn with_max_tag_size(max_tag_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: State::Start,
            header: None,
            max_tag_size,
            tags_read: 0,
        }
    }

    /// File header, when the stream started with one.
    pub fn header(&self) -> Option<&FlvHeader> {
        self.header.as_ref()
    }

    pub fn tags_read(&self) -> u64 {
        self.tags_read
    }

    /// Feed bytes, invoking `on_tag` for each complete tag.
    pub fn push<F>(&mut self, data: &[u8], mut on_tag: F) -> Result<(), FlvError>
    where
        F: FnMut(FlvTag),
    {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                State::Start => {
                    let Some(&first) = self.buffer.first() else {
                        return Ok(());
                    };
                    if first == b'F' {
                        if self.buffer.len() < FLV_HEADER_SIZE {
                            return Ok(());
                        }
                        let header = FlvHeader::parse(&self.buffer[..FLV_HEADER_SIZE])?;
                        let offset = header.data_offset as usize;
                        if self.buffer.len() < offset {
                            return Ok(());
                        }
                        debug!(header = %header, "FLV header");
                        self.buffer.advance(offset);
                        self.header = Some(header);
                        self.state = State::PrevTagSize;
                    } else if is_known_tag_type(first) {
                        trace!("stream starts at a tag boundary");
                        self.state = State::Tag;
                    } else {
                        self.state = State::PrevTagSize;
                    }
                }
                State::PrevTagSize => {
                    if self.buffer.len() < PREV_TAG_SIZE_FIELD_SIZE {
                        return Ok(());
                    }
                    self.buffer.advance(PREV_TAG_SIZE_FIELD_SIZE);
                    self.state = State::Tag;
                }
                State::Tag => {
                    if self.buffer.len() < TAG_HEADER_SIZE {
                        return Ok(());
                    }
                    let mut header_bytes = [0u8; TAG_HEADER_SIZE];
                    header_bytes.copy_from_slice(&self.buffer[..TAG_HEADER_SIZE]);
                    let header = framing::parse_tag_header_bytes(&header_bytes);

                    let size = header.data_size as usize;
                    if size > self.max_tag_size {
                        return Err(FlvError::TagTooLarge {
                            size,
                            limit: self.max_tag_size,
                        });
                    }
                    if self.buffer.len() < TAG_HEADER_SIZE + size {
                        return Ok(());
                    }

                    self.buffer.advance(TAG_HEADER_SIZE);
                    let data = self.buffer.split_to(size).freeze();
                    self.tags_read += 1;
                    self.state = State::PrevTagSize;

                    on_tag(FlvTag {
                        timestamp_ms: header.timestamp_ms,
                        stream_id: header.stream_id,
                        tag_type: header.tag_type,
                        is_filtered: header.is_filtered,
                        data,
                    });
                }
            }
        }
    }
}

fn is_known_tag_type(byte: u8) -> bool {
    !matches!(FlvTagType::from(byte & 0x1F), FlvTagType::Unknown(_))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn tag(tag_type: FlvTagType, timestamp_ms: u32, data: &'static [u8]) -> FlvTag {
        FlvTag {
            timestamp_ms,
            stream_id: 0,
            tag_type,
            is_filtered: false,
            data: Bytes::from_static(data),
        }
    }

    fn sample_tags() -> Vec<FlvTag> {
        vec![
            tag(FlvTagType::ScriptData, 0, &[0x02, 0x00, 0x0A]),
            tag(FlvTagType::Video, 0, &[0x17, 0x00, 0x00, 0x00, 0x00, 0x01]),
            tag(FlvTagType::Audio, 23, &[0xAF, 0x01, 0x21, 0x10]),
            tag(FlvTagType::Video, 0x0100_0040, &[0x27, 0x01, 0x00, 0x00, 0x00]),
        ]
    }

    fn encode(tags: &[FlvTag], with_header: bool) -> Vec<u8> {
        let mut out = Vec::new();
        if with_header {
            out.extend_from_slice(&FlvHeader::new(true, true).to_bytes());
        }
        let mut prev = 0u32;
        for tag in tags {
            out.extend_from_slice(&prev.to_be_bytes());
            out.extend_from_slice(&tag.to_bytes());
            prev = tag.size() as u32;
        }
        out.extend_from_slice(&prev.to_be_bytes());
        out
    }

    #[test]
    fn yields_tags_across_chunk_boundaries() {
        let tags = sample_tags();
        let bytes = encode(&tags, true);

        for chunk_size in [1, 3, 11, 64] {
            let mut reader = FlvTagReader::new();
            let mut out = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                reader.push(chunk, |t| out.push(t)).unwrap();
            }
            assert_eq!(out, tags, "chunk size {chunk_size}");
            assert!(reader.header().is_some());
        }
    }

    #[test]
    fn reads_headerless_stream() {
        let tags = sample_tags();
        let bytes = encode(&tags, false);

        let mut reader = FlvTagReader::new();
        let mut out = Vec::new();
        reader.push(&bytes, |t| out.push(t)).unwrap();
        assert_eq!(out, tags);
        assert!(reader.header().is_none());
        assert_eq!(reader.tags_read(), 4);
    }

    #[test]
    fn joins_at_tag_boundary() {
        let tags = sample_tags();
        let bytes = encode(&tags, false);

        let mut reader = FlvTagReader::new();
        let mut out = Vec::new();
        reader.push(&bytes[4..], |t| out.push(t)).unwrap();
        assert_eq!(out, tags);
    }

    #[test]
    fn rejects_oversized_tag() {
        let mut reader = FlvTagReader::with_max_tag_size(4);
        let bytes = encode(&sample_tags()[1..2], false);
        assert!(matches!(
            reader.push(&bytes, |_| {}),
            Err(FlvError::TagTooLarge { size: 6, limit: 4 })
        ));
    }
}
