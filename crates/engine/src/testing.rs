// In-memory and loopback collaborators for unit tests.
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::StatusCode;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::TidalError;
use crate::http::ResourceFetcher;

#[derive(Debug, Clone)]
enum Reply {
    Body(Bytes),
    Status(StatusCode),
}

/// Serves bodies keyed by URL. A URL with several queued bodies returns them
/// in order and then keeps repeating the last one, which models a live
/// playlist advancing between reloads.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering each fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn add(&self, url: &str, body: impl Into<Bytes>) -> &Self {
        self.replies
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Reply::Body(body.into()));
        self
    }

    pub fn fail(&self, url: &str, status: StatusCode) -> &Self {
        self.replies
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(Reply::Status(status));
        self
    }

    /// Every URL fetched so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.log.lock().iter().filter(|u| u.as_str() == url).count()
    }
}

#[async_trait]
impl ResourceFetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, TidalError> {
        if token.is_cancelled() {
            return Err(TidalError::Cancelled);
        }
        self.log.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = {
            let mut replies = self.replies.lock();
            match replies.get_mut(url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Reply::Body(body)) => Ok(body),
            Some(Reply::Status(status)) => Err(TidalError::http_status(status, url.as_str(), "fetch")),
            None => Err(TidalError::http_status(
                StatusCode::NOT_FOUND,
                url.as_str(),
                "fetch",
            )),
        }
    }
}

/// Render a media playlist with `count` four-second segments named
/// `seg{sequence}.ts`.
pub fn media_playlist(media_sequence: u64, count: u64, end_list: bool) -> String {
    let mut out = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
    );
    for seq in media_sequence..media_sequence + count {
        out.push_str(&format!("#EXTINF:4.000,\nseg{seq}.ts\n"));
    }
    if end_list {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

/// What a loopback RTMP server saw from its publisher.
#[derive(Debug)]
pub enum SinkEvent {
    Publish { app: String, key: String },
    Video { data: Bytes, timestamp: u32 },
    Audio { data: Bytes, timestamp: u32 },
}

/// Start an RTMP server on loopback that accepts one connection and every
/// connect and publish request on it. Returns the publish URL.
pub async fn rtmp_sink() -> (String, mpsc::UnboundedReceiver<SinkEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        accept_publisher(socket, tx).await;
    });
    (format!("rtmp://127.0.0.1:{port}/live/stream-key"), rx)
}

/// Like [`rtmp_sink`] but drops the connection `after` it was accepted,
/// whatever state the session is in by then.
pub async fn rtmp_sink_closing_after(
    after: Duration,
) -> (String, mpsc::UnboundedReceiver<SinkEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let _ = tokio::time::timeout(after, accept_publisher(socket, tx)).await;
    });
    (format!("rtmp://127.0.0.1:{port}/live/stream-key"), rx)
}

async fn accept_publisher(mut socket: TcpStream, seen: mpsc::UnboundedSender<SinkEvent>) {
    let mut handshake = Handshake::new(PeerType::Server);
    let mut buf = vec![0u8; 4096];

    let remaining = loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match handshake.process_bytes(&buf[..n]).unwrap() {
            HandshakeProcessResult::InProgress { response_bytes } => {
                socket.write_all(&response_bytes).await.unwrap();
            }
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                socket.write_all(&response_bytes).await.unwrap();
                break remaining_bytes;
            }
        }
    };

    let (mut session, initial) = ServerSession::new(ServerSessionConfig::new()).unwrap();
    let mut queue = VecDeque::from(initial);
    queue.extend(session.handle_input(&remaining).unwrap());
    loop {
        while let Some(result) = queue.pop_front() {
            let event = match result {
                ServerSessionResult::OutboundResponse(packet) => {
                    if socket.write_all(&packet.bytes).await.is_err() {
                        return;
                    }
                    continue;
                }
                ServerSessionResult::RaisedEvent(event) => event,
                _ => continue,
            };
            match event {
                ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                    queue.extend(session.accept_request(request_id).unwrap());
                }
                ServerSessionEvent::PublishStreamRequested {
                    request_id,
                    app_name,
                    stream_key,
                    ..
                } => {
                    let _ = seen.send(SinkEvent::Publish {
                        app: app_name,
                        key: stream_key,
                    });
                    queue.extend(session.accept_request(request_id).unwrap());
                }
                ServerSessionEvent::VideoDataReceived {
                    data, timestamp, ..
                } => {
                    let _ = seen.send(SinkEvent::Video {
                        data,
                        timestamp: timestamp.value,
                    });
                }
                ServerSessionEvent::AudioDataReceived {
                    data, timestamp, ..
                } => {
                    let _ = seen.send(SinkEvent::Audio {
                        data,
                        timestamp: timestamp.value,
                    });
                }
                _ => {}
            }
        }
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match session.handle_input(&buf[..n]) {
            Ok(results) => queue.extend(results),
            Err(_) => return,
        }
    }
}

/// Serve `(path, content type, body)` routes over HTTP/1.1 on loopback, one
/// request per connection. Unknown paths get a 404. Returns the base URL.
pub async fn serve_routes(routes: Vec<(&'static str, &'static str, Bytes)>) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") && read < buf.len() {
                match socket.read(&mut buf[read..]).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => read += n,
                }
            }
            let request = String::from_utf8_lossy(&buf[..read]).into_owned();
            let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

            let (status, content_type, body) = match routes.iter().find(|(p, _, _)| *p == path) {
                Some((_, content_type, body)) => ("200 OK", *content_type, body.clone()),
                None => ("404 Not Found", "text/plain", Bytes::new()),
            };
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

/// Answer one request with `body` and no Content-Length, then hold the
/// connection open without sending more. Returns the URL of `path`.
pub async fn serve_stalled(path: &'static str, content_type: &'static str, body: Bytes) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let head = format!("HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\n\r\n");
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&body).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    Url::parse(&format!("http://{addr}{path}")).unwrap()
}

const TS_PACKET_SIZE: usize = 188;
const PMT_PID: u16 = 0x1000;

fn ts_packet(pid: u16, pusi: bool, cc: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x47, ((pusi as u8) << 6) | ((pid >> 8) as u8 & 0x1F), pid as u8, 0];
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
    out
}

fn psi_packet(pid: u16, table_id: u8, id: u16, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut payload = vec![
        0x00,
        table_id,
        0xB0 | ((section_length >> 8) as u8 & 0x0F),
        section_length as u8,
        (id >> 8) as u8,
        id as u8,
        0xC1,
        0x00,
        0x00,
    ];
    payload.extend_from_slice(body);
    // CRC is not checked by the demuxer
    payload.extend_from_slice(&[0, 0, 0, 0]);
    payload.resize(TS_PACKET_SIZE - 4, 0xFF);
    ts_packet(pid, true, 0, &payload)
}

/// A transport stream with one elementary stream on PID 0x100 carrying one
/// PES per `(pts, payload)` frame. Timestamps are 90 kHz; each payload must
/// fit a single packet.
pub fn ts_segment(stream_type: u8, frames: &[(u64, &[u8])]) -> Vec<u8> {
    let mut out = psi_packet(0x0000, 0x00, 1, &[0x00, 0x01, 0xF0, 0x00]);
    out.extend(psi_packet(
        PMT_PID,
        0x02,
        1,
        &[0xE1, 0x00, 0xF0, 0x00, stream_type, 0xE1, 0x00, 0xF0, 0x00],
    ));

    for (cc, (pts, es)) in frames.iter().enumerate() {
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x80, 0x05];
        pes.extend_from_slice(&[
            0x21 | (((pts >> 30) & 0x07) as u8) << 1,
            (pts >> 22) as u8,
            (((pts >> 15) & 0x7F) as u8) << 1 | 1,
            (pts >> 7) as u8,
            ((pts & 0x7F) as u8) << 1 | 1,
        ]);
        pes.extend_from_slice(es);
        out.extend(ts_packet(0x100, true, cc as u8, &pes));
    }
    out
}
