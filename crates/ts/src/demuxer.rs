// Streaming demuxer: TS bytes in, elementary stream frames out.
use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use tracing::{debug, trace};

use crate::Result;
use crate::packet::{PID_NULL, PID_PAT, SYNC_BYTE, TS_PACKET_SIZE, TsPacket};
use crate::pes::PesHeader;
use crate::psi::{Pat, Pmt, StreamType};

/// One reassembled PES payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsFrame {
    pub stream_type: StreamType,
    pub pid: u16,
    pub payload: Bytes,
    /// 90 kHz
    pub pts: u64,
    /// 90 kHz, equal to `pts` when the PES carries no DTS
    pub dts: u64,
}

#[derive(Debug)]
struct PesAssembler {
    stream_type: StreamType,
    buffer: BytesMut,
    started: bool,
}

impl PesAssembler {
    fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            buffer: BytesMut::new(),
            started: false,
        }
    }

    fn take_frame(&mut self, pid: u16) -> Result<Option<EsFrame>> {
        if !self.started || self.buffer.is_empty() {
            return Ok(None);
        }
        self.started = false;
        let data = self.buffer.split().freeze();
        let header = PesHeader::parse(&data)?;
        let end = header.total_len().unwrap_or(data.len()).min(data.len());
        if header.payload_offset >= end {
            return Ok(None);
        }
        let Some(pts) = header.pts else {
            trace!(pid, "PES without PTS dropped");
            return Ok(None);
        };
        Ok(Some(EsFrame {
            stream_type: self.stream_type,
            pid,
            payload: data.slice(header.payload_offset..end),
            pts,
            dts: header.dts.unwrap_or(pts),
        }))
    }

    /// True once a bounded PES has received all of its bytes.
    fn is_complete(&self) -> bool {
        if !self.started || self.buffer.len() < 6 {
            return false;
        }
        let length = u16::from_be_bytes([self.buffer[4], self.buffer[5]]) as usize;
        length != 0 && self.buffer.len() >= 6 + length
    }
}

/// Incremental MPEG-TS demultiplexer.
///
/// Input may be split at arbitrary byte boundaries; partial packets are kept
/// until the next call. Frames are emitted when the next payload unit of the
/// same PID starts, when a bounded PES is complete, or on [`TsDemuxer::flush`].
#[derive(Debug, Default)]
pub struct TsDemuxer {
    pending: BytesMut,
    pmt_pids: Vec<u16>,
    streams: HashMap<u16, PesAssembler>,
}

impl TsDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, invoking `on_frame` for every completed frame.
    pub fn input<F>(&mut self, data: &[u8], mut on_frame: F) -> Result<()>
    where
        F: FnMut(EsFrame),
    {
        self.pending.extend_from_slice(data);

        loop {
            let Some(sync) = memchr(SYNC_BYTE, &self.pending) else {
                self.pending.clear();
                break;
            };
            if sync > 0 {
                debug!(skipped = sync, "resyncing transport stream");
                self.pending.advance(sync);
            }
            if self.pending.len() < TS_PACKET_SIZE {
                break;
            }

            let chunk = self.pending.split_to(TS_PACKET_SIZE).freeze();
            match TsPacket::parse(chunk) {
                Ok(packet) => self.process_packet(packet, &mut on_frame)?,
                Err(e) => debug!(error = %e, "dropping malformed packet"),
            }
        }
        Ok(())
    }

    /// Emit every partially assembled frame.
    pub fn flush<F>(&mut self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(EsFrame),
    {
        let mut pids: Vec<u16> = self.streams.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if let Some(assembler) = self.streams.get_mut(&pid)
                && let Some(frame) = assembler.take_frame(pid)?
            {
                on_frame(frame);
            }
        }
        Ok(())
    }

    /// Stream type registered for `pid` by the last PMT.
    pub fn stream_type(&self, pid: u16) -> Option<StreamType> {
        self.streams.get(&pid).map(|s| s.stream_type)
    }

    fn process_packet<F>(&mut self, packet: TsPacket, on_frame: &mut F) -> Result<()>
    where
        F: FnMut(EsFrame),
    {
        match packet.pid {
            PID_NULL => Ok(()),
            PID_PAT => {
                if let Some(section) = packet.psi_payload() {
                    let pat = Pat::parse(&section)?;
                    self.pmt_pids = pat.programs.iter().map(|p| p.pmt_pid).collect();
                }
                Ok(())
            }
            pid if self.pmt_pids.contains(&pid) => {
                if let Some(section) = packet.psi_payload() {
                    let pmt = Pmt::parse(&section)?;
                    for stream in pmt.streams {
                        self.streams
                            .entry(stream.elementary_pid)
                            .or_insert_with(|| {
                                debug!(
                                    pid = stream.elementary_pid,
                                    stream_type = ?stream.stream_type,
                                    "elementary stream registered"
                                );
                                PesAssembler::new(stream.stream_type)
                            });
                    }
                }
                Ok(())
            }
            pid => {
                let Some(assembler) = self.streams.get_mut(&pid) else {
                    return Ok(());
                };
                let Some(payload) = packet.payload else {
                    return Ok(());
                };

                if packet.payload_unit_start_indicator {
                    if let Some(frame) = assembler.take_frame(pid)? {
                        on_frame(frame);
                    }
                    assembler.started = true;
                } else if !assembler.started {
                    // joined mid-PES
                    return Ok(());
                }

                assembler.buffer.extend_from_slice(&payload);
                if assembler.is_complete()
                    && let Some(frame) = assembler.take_frame(pid)?
                {
                    on_frame(frame);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pes::encode_timestamp;
    use crate::psi::build_section;

    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x101;

    fn packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= TS_PACKET_SIZE - 4);
        let mut out = vec![
            SYNC_BYTE,
            ((pusi as u8) << 6) | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            0,
        ];
        let stuffing = TS_PACKET_SIZE - 4 - payload.len();
        if stuffing == 0 {
            out[3] = 0x10 | (cc & 0x0F);
        } else {
            out[3] = 0x30 | (cc & 0x0F);
            out.push((stuffing - 1) as u8);
            if stuffing > 1 {
                out.push(0x00);
                out.extend(std::iter::repeat_n(0xFF, stuffing - 2));
            }
        }
        out.extend_from_slice(payload);
        assert_eq!(out.len(), TS_PACKET_SIZE);
        out
    }

    fn psi_packet(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(section);
        payload.resize(TS_PACKET_SIZE - 4, 0xFF);
        packet(pid, true, 0, &payload)
    }

    fn tables() -> Vec<u8> {
        let mut out = psi_packet(PID_PAT, &build_section(0x00, 1, &[0x00, 0x01, 0xF0, 0x00]));
        let pmt_body = [
            0xE1, 0x00, 0xF0, 0x00, 0x1B, 0xE1, 0x00, 0xF0, 0x00, 0x0F, 0xE1, 0x01, 0xF0, 0x00,
        ];
        out.extend(psi_packet(0x1000, &build_section(0x02, 1, &pmt_body)));
        out
    }

    fn pes(stream_id: u8, pts: u64, dts: Option<u64>, es: &[u8], bounded: bool) -> Vec<u8> {
        let header_len = if dts.is_some() { 10 } else { 5 };
        let flags = if dts.is_some() { 0xC0 } else { 0x80 };
        let length = if bounded { 3 + header_len + es.len() } else { 0 };
        let mut out = vec![
            0x00,
            0x00,
            0x01,
            stream_id,
            (length >> 8) as u8,
            length as u8,
            0x80,
            flags,
            header_len as u8,
        ];
        let prefix = if dts.is_some() { 0b0011 } else { 0b0010 };
        out.extend_from_slice(&encode_timestamp(prefix, pts));
        if let Some(dts) = dts {
            out.extend_from_slice(&encode_timestamp(0b0001, dts));
        }
        out.extend_from_slice(es);
        out
    }

    #[test]
    fn reassembles_pes_across_packets() {
        let es: Vec<u8> = (0..400u32).map(|i| i as u8).collect();
        let pes = pes(0xE0, 183_000, Some(180_000), &es, false);

        let mut stream = tables();
        let mut cc = 0;
        for (i, chunk) in pes.chunks(TS_PACKET_SIZE - 4).enumerate() {
            stream.extend(packet(VIDEO_PID, i == 0, cc, chunk));
            cc += 1;
        }

        let mut demuxer = TsDemuxer::new();
        let mut frames = Vec::new();
        demuxer.input(&stream, |f| frames.push(f)).unwrap();
        assert!(frames.is_empty(), "unbounded PES waits for the next unit");

        demuxer.flush(|f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_type, StreamType::H264);
        assert_eq!(frames[0].pts, 183_000);
        assert_eq!(frames[0].dts, 180_000);
        assert_eq!(frames[0].payload.as_ref(), es.as_slice());
    }

    #[test]
    fn emits_bounded_pes_and_handles_split_input() {
        let es = vec![0xFF, 0xF1, 0x50, 0x80, 0x02, 0x1F, 0xFC, 0xAA];
        let pes = pes(0xC0, 90_000, None, &es, true);

        let mut stream = tables();
        stream.extend(packet(AUDIO_PID, true, 0, &pes));

        let mut demuxer = TsDemuxer::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(7) {
            demuxer.input(chunk, |f| frames.push(f)).unwrap();
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_type, StreamType::Aac);
        assert_eq!(frames[0].pts, 90_000);
        assert_eq!(frames[0].dts, 90_000);
        assert_eq!(frames[0].payload.as_ref(), es.as_slice());
    }

    #[test]
    fn next_unit_start_emits_previous_frame() {
        let mut stream = tables();
        stream.extend(packet(VIDEO_PID, true, 0, &pes(0xE0, 3000, None, &[1, 2, 3], false)));
        stream.extend(packet(VIDEO_PID, true, 1, &pes(0xE0, 6000, None, &[4, 5], false)));

        let mut demuxer = TsDemuxer::new();
        let mut frames = Vec::new();
        demuxer.input(&stream, |f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pts, 3000);
        assert_eq!(frames[0].payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn skips_garbage_before_sync() {
        let mut stream = vec![0x00, 0x12, 0x34];
        stream.extend(tables());
        let mut demuxer = TsDemuxer::new();
        demuxer.input(&stream, |_| {}).unwrap();
        assert_eq!(demuxer.stream_type(VIDEO_PID), Some(StreamType::H264));
        assert_eq!(demuxer.stream_type(AUDIO_PID), Some(StreamType::Aac));
    }
}
