// Push-protocol engine seam and its RTMP implementation over rml_rtmp.
//
// The engine does no I/O. Bytes read from the socket go into `input`; bytes
// to send leave through the output sink given at construction.

use std::collections::VecDeque;

use bytes::Bytes;
use flv::FlvTag;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use tracing::{debug, info, trace};

use super::packager::{AudioCodec, Packager, VideoCodec};
use super::url::RtmpUrl;
use super::{PublishError, PublishState};

/// Receives bytes the engine wants written to the peer.
pub type OutputSink = Box<dyn FnMut(Bytes) + Send>;
/// Notified on every state transition.
pub type StateObserver = Box<dyn FnMut(PublishState) + Send>;

pub trait PublishEngine: Send {
    /// Begin the handshake.
    fn start(&mut self) -> Result<(), PublishError>;

    /// Feed bytes received from the peer.
    fn input(&mut self, data: &[u8]) -> Result<(), PublishError>;

    fn write_audio(
        &mut self,
        codec: AudioCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError>;

    fn write_video(
        &mut self,
        codec: VideoCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError>;

    /// Send an already packaged audio or video tag body. Script tags are ignored.
    fn write_frame(&mut self, tag: &FlvTag) -> Result<(), PublishError>;

    fn state(&self) -> PublishState;
}

/// RTMP client engine: digest handshake, `connect`, then `publish` (live).
pub struct RtmpEngine {
    url: RtmpUrl,
    state: PublishState,
    handshake: Handshake,
    session: Option<ClientSession>,
    packager: Packager,
    output: OutputSink,
    observer: StateObserver,
}

impl RtmpEngine {
    pub fn new(url: RtmpUrl, output: OutputSink, observer: StateObserver) -> Self {
        Self {
            url,
            state: PublishState::Connecting,
            handshake: Handshake::new(PeerType::Client),
            session: None,
            packager: Packager::new(),
            output,
            observer,
        }
    }

    fn set_state(&mut self, state: PublishState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "publish state");
            self.state = state;
            (self.observer)(state);
        }
    }

    fn emit(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            (self.output)(Bytes::from(bytes));
        }
    }

    fn session(&mut self) -> Result<&mut ClientSession, PublishError> {
        let state = self.state;
        self.session.as_mut().ok_or(PublishError::NotReady(state))
    }

    fn handshake_input(&mut self, data: &[u8]) -> Result<(), PublishError> {
        let result = self
            .handshake
            .process_bytes(data)
            .map_err(|e| PublishError::Handshake(format!("{e:?}")))?;
        match result {
            HandshakeProcessResult::InProgress { response_bytes } => {
                self.emit(response_bytes);
                Ok(())
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                self.emit(response_bytes);
                trace!("RTMP handshake completed");

                let mut config = ClientSessionConfig::new();
                config.tc_url = Some(self.url.tc_url());
                let (mut session, mut results) =
                    ClientSession::new(config).map_err(session_error)?;
                results.push(
                    session
                        .request_connection(self.url.app.clone())
                        .map_err(session_error)?,
                );
                if !remaining_bytes.is_empty() {
                    results.extend(session.handle_input(&remaining_bytes).map_err(session_error)?);
                }
                self.session = Some(session);
                self.process(results)
            }
        }
    }

    fn process(&mut self, results: Vec<ClientSessionResult>) -> Result<(), PublishError> {
        let mut queue = VecDeque::from(results);
        while let Some(result) = queue.pop_front() {
            match result {
                ClientSessionResult::OutboundResponse(packet) => self.emit(packet.bytes),
                ClientSessionResult::RaisedEvent(event) => match event {
                    ClientSessionEvent::ConnectionRequestAccepted => {
                        self.set_state(PublishState::Connected);
                        let key = self.url.stream_key.clone();
                        let request = self
                            .session()?
                            .request_publishing(key, PublishRequestType::Live)
                            .map_err(session_error)?;
                        queue.push_back(request);
                        self.set_state(PublishState::PublishRequested);
                    }
                    ClientSessionEvent::ConnectionRequestRejected { description } => {
                        self.set_state(PublishState::Closed);
                        return Err(PublishError::Rejected(description));
                    }
                    ClientSessionEvent::PublishRequestAccepted => {
                        info!(app = %self.url.app, "Server accepted publishing");
                        self.set_state(PublishState::Publishing);
                    }
                    _ => trace!("ignoring RTMP session event"),
                },
                ClientSessionResult::UnhandleableMessageReceived(_) => {
                    trace!("unhandleable RTMP message")
                }
            }
        }
        Ok(())
    }
}

fn session_error<E: std::fmt::Debug>(e: E) -> PublishError {
    PublishError::Session(format!("{e:?}"))
}

impl PublishEngine for RtmpEngine {
    fn start(&mut self) -> Result<(), PublishError> {
        self.set_state(PublishState::Handshaking);
        let p0_p1 = self
            .handshake
            .generate_outbound_p0_and_p1()
            .map_err(|e| PublishError::Handshake(format!("{e:?}")))?;
        self.emit(p0_p1);
        Ok(())
    }

    fn input(&mut self, data: &[u8]) -> Result<(), PublishError> {
        if self.session.is_none() {
            return self.handshake_input(data);
        }
        let results = self.session()?.handle_input(data).map_err(session_error)?;
        self.process(results)
    }

    fn write_audio(
        &mut self,
        codec: AudioCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError> {
        if self.state != PublishState::Publishing {
            return Err(PublishError::NotReady(self.state));
        }
        for tag in self.packager.package_audio(codec, payload, pts_ms, dts_ms) {
            self.write_frame(&tag)?;
        }
        Ok(())
    }

    fn write_video(
        &mut self,
        codec: VideoCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError> {
        if self.state != PublishState::Publishing {
            return Err(PublishError::NotReady(self.state));
        }
        for tag in self.packager.package_video(codec, payload, pts_ms, dts_ms) {
            self.write_frame(&tag)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, tag: &FlvTag) -> Result<(), PublishError> {
        if self.state != PublishState::Publishing {
            return Err(PublishError::NotReady(self.state));
        }
        let timestamp = RtmpTimestamp::new(tag.timestamp_ms);
        let session = self.session()?;
        let result = if tag.is_video_tag() {
            let droppable = !tag.is_key_frame() && !tag.is_sequence_header();
            session.publish_video_data(tag.data.clone(), timestamp, droppable)
        } else if tag.is_audio_tag() {
            session.publish_audio_data(tag.data.clone(), timestamp, false)
        } else {
            return Ok(());
        };
        let result = result.map_err(session_error)?;
        self.process(vec![result])
    }

    fn state(&self) -> PublishState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn engine() -> (RtmpEngine, Arc<Mutex<Vec<Bytes>>>, Arc<Mutex<Vec<PublishState>>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let seen = states.clone();
        let engine = RtmpEngine::new(
            RtmpUrl::parse("rtmp://127.0.0.1/live/key").unwrap(),
            Box::new(move |b| sink.lock().push(b)),
            Box::new(move |s| seen.lock().push(s)),
        );
        (engine, out, states)
    }

    #[test]
    fn start_sends_c0_c1() {
        let (mut engine, out, states) = engine();
        engine.start().unwrap();
        let out = out.lock();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 1 + 1536);
        assert_eq!(out[0][0], 3, "RTMP version");
        assert_eq!(*states.lock(), vec![PublishState::Handshaking]);
    }

    #[test]
    fn frames_before_publishing_are_rejected() {
        let (mut engine, out, _) = engine();
        engine.start().unwrap();
        let tag = FlvTag {
            timestamp_ms: 0,
            stream_id: 0,
            tag_type: flv::FlvTagType::Audio,
            is_filtered: false,
            data: Bytes::from_static(&[0xAF, 0x01, 0x00]),
        };
        assert!(matches!(
            engine.write_frame(&tag),
            Err(PublishError::NotReady(PublishState::Handshaking))
        ));
        assert!(matches!(
            engine.write_audio(AudioCodec::Aac, &[0xFF], 0, 0),
            Err(PublishError::NotReady(_))
        ));
        assert_eq!(out.lock().len(), 1);
    }
}
