use crate::{Result, TsError};
use bytes::Bytes;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// A single transport stream packet. Payload and adaptation field share the
/// buffer of the input chunk.
#[derive(Debug, Clone)]
pub struct TsPacket {
    pub payload_unit_start_indicator: bool,
    pub pid: u16,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
    pub discontinuity_indicator: bool,
    pub payload: Option<Bytes>,
}

impl TsPacket {
    /// Parse a TS packet from exactly 188 bytes.
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(data[0]));
        }

        let payload_unit_start_indicator = (data[1] & 0x40) != 0;
        let pid = ((data[1] as u16 & 0x1F) << 8) | data[2] as u16;
        let adaptation_field_control = (data[3] >> 4) & 0x03;
        let continuity_counter = data[3] & 0x0F;

        let mut offset = 4;
        let mut discontinuity_indicator = false;

        if adaptation_field_control & 0x02 != 0 {
            let length = data[offset] as usize;
            offset += 1;
            if offset + length > data.len() {
                return Err(TsError::InsufficientData {
                    expected: offset + length,
                    actual: data.len(),
                });
            }
            if length > 0 {
                discontinuity_indicator = data[offset] & 0x80 != 0;
            }
            offset += length;
        }

        let payload = if adaptation_field_control & 0x01 != 0 && offset < data.len() {
            Some(data.slice(offset..))
        } else {
            None
        };

        Ok(TsPacket {
            payload_unit_start_indicator,
            pid,
            adaptation_field_control,
            continuity_counter,
            discontinuity_indicator,
            payload,
        })
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    /// PSI payload with the pointer field skipped. Only section starts are
    /// returned.
    pub fn psi_payload(&self) -> Option<Bytes> {
        let payload = self.payload.as_ref()?;
        if !self.payload_unit_start_indicator || payload.is_empty() {
            return None;
        }
        let start = 1 + payload[0] as usize;
        (start < payload.len()).then(|| payload.slice(start..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_sync_byte() {
        let mut data = vec![0u8; TS_PACKET_SIZE];
        data[0] = 0x46;
        assert_eq!(
            TsPacket::parse(data.into()).unwrap_err(),
            TsError::InvalidSyncByte(0x46)
        );
    }

    #[test]
    fn parses_header_fields() {
        let mut data = vec![0xFFu8; TS_PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = 0x41; // PUSI + PID high bits
        data[2] = 0x00;
        data[3] = 0x17; // payload only, cc = 7

        let packet = TsPacket::parse(data.into()).unwrap();
        assert_eq!(packet.pid, 0x0100);
        assert!(packet.payload_unit_start_indicator);
        assert_eq!(packet.continuity_counter, 7);
        assert!(packet.has_payload());
        assert_eq!(packet.payload.unwrap().len(), TS_PACKET_SIZE - 4);
    }

    #[test]
    fn skips_adaptation_field() {
        let mut data = vec![0u8; TS_PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = 0x01;
        data[3] = 0x30; // adaptation field + payload
        data[4] = 10;
        data[5] = 0x80; // discontinuity

        let packet = TsPacket::parse(data.into()).unwrap();
        assert!(packet.discontinuity_indicator);
        assert_eq!(packet.payload.unwrap().len(), TS_PACKET_SIZE - 4 - 1 - 10);
    }
}
