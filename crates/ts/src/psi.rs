use crate::{Result, TsError};

/// Elementary stream types carried in the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Mp3,
    Aac,
    H264,
    H265,
    Private,
    Unknown(u8),
}

impl From<u8> for StreamType {
    fn from(value: u8) -> Self {
        match value {
            0x03 | 0x04 => StreamType::Mp3,
            0x0F => StreamType::Aac,
            0x1B => StreamType::H264,
            0x24 => StreamType::H265,
            0x06 => StreamType::Private,
            other => StreamType::Unknown(other),
        }
    }
}

impl StreamType {
    pub fn is_video(&self) -> bool {
        matches!(self, StreamType::H264 | StreamType::H265)
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, StreamType::Aac | StreamType::Mp3)
    }
}

/// Reads the common long-form section header and returns `(version, body)`,
/// where body excludes the trailing CRC.
fn section_body(data: &[u8], table_id: u8) -> Result<(u8, &[u8])> {
    if data.len() < 8 {
        return Err(TsError::InsufficientData {
            expected: 8,
            actual: data.len(),
        });
    }
    if data[0] != table_id {
        return Err(TsError::InvalidSection(format!(
            "unexpected table id 0x{:02X}",
            data[0]
        )));
    }
    let section_length = (((data[1] & 0x0F) as usize) << 8) | data[2] as usize;
    let end = 3 + section_length;
    if end > data.len() || section_length < 9 {
        return Err(TsError::InsufficientData {
            expected: end,
            actual: data.len(),
        });
    }
    let version = (data[5] >> 1) & 0x1F;
    Ok((version, &data[8..end - 4]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatProgram {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// Program Association Table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pat {
    pub version_number: u8,
    pub programs: Vec<PatProgram>,
}

impl Pat {
    /// Parse a PAT section that fits in one packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (version_number, body) = section_body(data, 0x00)?;
        let programs = body
            .chunks_exact(4)
            .filter_map(|entry| {
                let program_number = u16::from_be_bytes([entry[0], entry[1]]);
                let pid = ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16;
                // program 0 points at the network PID
                (program_number != 0).then_some(PatProgram {
                    program_number,
                    pmt_pid: pid,
                })
            })
            .collect();
        Ok(Pat {
            version_number,
            programs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: StreamType,
    pub elementary_pid: u16,
}

/// Program Map Table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub version_number: u8,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

impl Pmt {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (version_number, body) = section_body(data, 0x02)?;
        if body.len() < 4 {
            return Err(TsError::InvalidSection("PMT body too short".into()));
        }
        let pcr_pid = ((body[0] as u16 & 0x1F) << 8) | body[1] as u16;
        let program_info_length = (((body[2] & 0x0F) as usize) << 8) | body[3] as usize;

        let mut offset = 4 + program_info_length;
        let mut streams = Vec::new();
        while offset + 5 <= body.len() {
            let stream_type = StreamType::from(body[offset]);
            let elementary_pid =
                ((body[offset + 1] as u16 & 0x1F) << 8) | body[offset + 2] as u16;
            let es_info_length =
                (((body[offset + 3] & 0x0F) as usize) << 8) | body[offset + 4] as usize;
            streams.push(PmtStream {
                stream_type,
                elementary_pid,
            });
            offset += 5 + es_info_length;
        }

        Ok(Pmt {
            version_number,
            pcr_pid,
            streams,
        })
    }
}

/// Builds a section with a zeroed CRC. Test helper.
#[cfg(test)]
pub(crate) fn build_section(table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut out = vec![
        table_id,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (id >> 8) as u8,
        id as u8,
        0xC1,
        0x00,
        0x00,
    ];
    out.extend_from_slice(body);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}
