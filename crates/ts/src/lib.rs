//! MPEG-2 Transport Stream demultiplexing
//!
//! Parses PAT/PMT tables, reassembles PES packets per elementary PID and hands
//! out timestamped elementary stream frames through [`TsDemuxer`].

pub mod demuxer;
pub mod error;
pub mod packet;
pub mod pes;
pub mod psi;

pub use demuxer::{EsFrame, TsDemuxer};
pub use error::TsError;
pub use packet::{PID_NULL, PID_PAT, TS_PACKET_SIZE, TsPacket};
pub use pes::PesHeader;
pub use psi::{Pat, PatProgram, Pmt, PmtStream, StreamType};

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
