//! RTMP publishing.
//!
//! [`RtmpPublisher::start`] connects, runs the handshake and the
//! `connect`/`publish` exchange, and returns once the server accepts frames.
//! A pump task feeds socket reads into the engine and a writer task drains
//! the engine's output. Both stop when the session token is cancelled, and a
//! read failure or EOF cancels the token.

pub mod engine;
pub mod packager;
pub mod url;

use std::future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flv::FlvTag;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use engine::{PublishEngine, RtmpEngine};
pub use packager::{AudioCodec, Packager, VideoCodec};
pub use url::RtmpUrl;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Upper bound on flushing queued output once the session is cancelled.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Connecting,
    Handshaking,
    Connected,
    PublishRequested,
    Publishing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("RTMP handshake failed: {0}")]
    Handshake(String),

    #[error("RTMP session error: {0}")]
    Session(String),

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("publisher not ready (state {0:?})")]
    NotReady(PublishState),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("publish cancelled")]
    Cancelled,

    #[error("timed out waiting for the server to accept publishing")]
    Timeout,

    #[error("invalid RTMP URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Bytes read from the socket per pump iteration
    pub read_buffer_size: usize,
    /// Give up on `start` when publishing is not accepted in time
    pub ready_timeout: Option<Duration>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            ready_timeout: None,
        }
    }
}

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type ReadySender = Arc<Mutex<Option<oneshot::Sender<Result<(), PublishError>>>>>;
type FailureSlot = Arc<Mutex<Option<PublishError>>>;

/// Where the pump and the writer report the error that ended the session.
/// Before readiness it fails `start`, afterwards it is kept for
/// [`RtmpPublisher::take_failure`].
#[derive(Clone)]
struct SessionFailure {
    ready: ReadySender,
    failure: FailureSlot,
}

impl SessionFailure {
    fn report(&self, error: PublishError) {
        if let Some(tx) = self.ready.lock().take() {
            let _ = tx.send(Err(error));
            return;
        }
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

/// A live RTMP publishing session.
pub struct RtmpPublisher {
    engine: Arc<Mutex<Box<dyn PublishEngine>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failure: FailureSlot,
}

impl RtmpPublisher {
    /// Connect to `url` and wait until the server accepts publishing.
    pub async fn start(
        url: &str,
        config: PublisherConfig,
        token: CancellationToken,
    ) -> Result<Self, PublishError> {
        let url = RtmpUrl::parse(url)?;
        info!(host = %url.host, port = url.port, app = %url.app, "Connecting to RTMP server");

        let (reader, writer) = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(PublishError::Cancelled),
            io = connect(&url) => io?,
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready: ReadySender = Arc::new(Mutex::new(Some(ready_tx)));
        let session = SessionFailure {
            ready: ready.clone(),
            failure: Arc::new(Mutex::new(None)),
        };

        let observer_ready = ready.clone();
        let engine = RtmpEngine::new(
            url,
            Box::new(move |bytes| {
                if out_tx.send(bytes).is_err() {
                    debug!("socket writer gone, dropping output");
                }
            }),
            Box::new(move |state| {
                if state == PublishState::Publishing
                    && let Some(tx) = observer_ready.lock().take()
                {
                    let _ = tx.send(Ok(()));
                }
            }),
        );
        let engine: Arc<Mutex<Box<dyn PublishEngine>>> = Arc::new(Mutex::new(Box::new(engine)));

        let tasks = vec![
            tokio::spawn(write_loop(writer, out_rx, session.clone(), token.clone())),
            tokio::spawn(read_loop(
                reader,
                engine.clone(),
                session.clone(),
                token.clone(),
                config.read_buffer_size.max(1),
            )),
        ];
        let publisher = Self {
            engine,
            token,
            tasks: Mutex::new(tasks),
            failure: session.failure,
        };
        publisher.engine.lock().start()?;

        let timeout = async {
            match config.ready_timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => future::pending().await,
            }
        };
        let outcome = tokio::select! {
            biased;
            ready = ready_rx => ready.unwrap_or(Err(PublishError::Session(
                "session ended before publishing".to_string(),
            ))),
            _ = publisher.token.cancelled() => Err(PublishError::Cancelled),
            _ = timeout => Err(PublishError::Timeout),
        };
        outcome?;

        info!("RTMP publisher ready");
        Ok(publisher)
    }

    pub fn write_audio(
        &self,
        codec: AudioCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError> {
        self.check_open()?;
        self.engine.lock().write_audio(codec, payload, pts_ms, dts_ms)
    }

    pub fn write_video(
        &self,
        codec: VideoCodec,
        payload: &[u8],
        pts_ms: u64,
        dts_ms: u64,
    ) -> Result<(), PublishError> {
        self.check_open()?;
        self.engine.lock().write_video(codec, payload, pts_ms, dts_ms)
    }

    pub fn write_frame(&self, tag: &FlvTag) -> Result<(), PublishError> {
        self.check_open()?;
        self.engine.lock().write_frame(tag)
    }

    fn check_open(&self) -> Result<(), PublishError> {
        if self.token.is_cancelled() {
            Err(PublishError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> PublishState {
        if self.token.is_cancelled() {
            PublishState::Closed
        } else {
            self.engine.lock().state()
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The socket or engine error that ended a ready session, if any. A
    /// session stopped through its token has none.
    pub fn take_failure(&self) -> Option<PublishError> {
        self.failure.lock().take()
    }

    /// Cancel the session and wait for the pump and writer to exit. Output
    /// already queued is flushed first.
    pub async fn close(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "publisher task failed");
            }
        }
    }
}

impl Drop for RtmpPublisher {
    fn drop(&mut self) {
        for task in self.tasks.lock().iter() {
            task.abort();
        }
    }
}

async fn connect(url: &RtmpUrl) -> Result<(Reader, Writer), PublishError> {
    let address = format!("{}:{}", url.host, url.port);
    let stream = TcpStream::connect(url.address())
        .await
        .map_err(|source| PublishError::Connect {
            address: address.clone(),
            source,
        })?;
    stream.set_nodelay(true)?;
    debug!(address = %address, tls = url.tls, "TCP connected");

    if !url.tls {
        let (reader, writer) = stream.into_split();
        return Ok((Box::new(reader), Box::new(writer)));
    }

    let config = crate::tls::client_config().map_err(|e| PublishError::Tls(e.to_string()))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(url.host.clone())
        .map_err(|e| PublishError::Tls(e.to_string()))?;
    let stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| PublishError::Tls(e.to_string()))?;
    let (reader, writer) = tokio::io::split(stream);
    Ok((Box::new(reader), Box::new(writer)))
}

async fn write_loop(
    mut writer: Writer,
    mut output: mpsc::UnboundedReceiver<Bytes>,
    failure: SessionFailure,
    token: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let flush = async {
                    while let Ok(bytes) = output.try_recv() {
                        writer.write_all(&bytes).await?;
                    }
                    writer.flush().await
                };
                match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "flush on close failed"),
                    Err(_) => debug!("flush on close timed out"),
                }
                break;
            }
            bytes = output.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(error = %e, "RTMP socket write failed");
            failure.report(PublishError::Io(e));
            token.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("RTMP writer stopped");
}

async fn read_loop(
    mut reader: Reader,
    engine: Arc<Mutex<Box<dyn PublishEngine>>>,
    session: SessionFailure,
    token: CancellationToken,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let failure = loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!("RTMP server closed the connection");
                break Some(PublishError::Session("connection closed by server".to_string()));
            }
            Ok(n) => {
                if let Err(e) = engine.lock().input(&buf[..n]) {
                    warn!(error = %e, "RTMP engine failed");
                    break Some(e);
                }
            }
            Err(e) => {
                warn!(error = %e, "RTMP socket read failed");
                break Some(PublishError::Io(e));
            }
        }
    };

    if let Some(e) = failure {
        session.report(e);
        token.cancel();
    }
    debug!("RTMP pump stopped");
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::testing::{SinkEvent, rtmp_sink, rtmp_sink_closing_after};

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("rtmp://127.0.0.1:{port}/live/stream-key"))
    }

    #[tokio::test]
    async fn publishes_to_accepting_server() {
        let (url, mut seen) = rtmp_sink().await;

        let token = CancellationToken::new();
        let publisher = RtmpPublisher::start(&url, PublisherConfig::default(), token.clone())
            .await
            .unwrap();
        assert_eq!(publisher.state(), PublishState::Publishing);

        match seen.recv().await.unwrap() {
            SinkEvent::Publish { app, key } => {
                assert_eq!(app, "live");
                assert_eq!(key, "stream-key");
            }
            other => panic!("unexpected {other:?}"),
        }

        let access_unit = [
            0, 0, 0, 1, 0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0, 0, 1, 0x68, 0xEB, 0xE3, 0xCB, 0, 0,
            1, 0x65, 0x88, 0x84, 0x00, 0x33,
        ];
        publisher
            .write_video(VideoCodec::H264, &access_unit, 2000, 2000)
            .unwrap();

        match seen.recv().await.unwrap() {
            SinkEvent::Video { data, timestamp } => {
                assert_eq!(&data[..2], &[0x17, 0x00], "sequence header first");
                assert_eq!(timestamp, 2000);
            }
            other => panic!("unexpected {other:?}"),
        }
        match seen.recv().await.unwrap() {
            SinkEvent::Video { data, .. } => assert_eq!(&data[..2], &[0x17, 0x01]),
            other => panic!("unexpected {other:?}"),
        }

        let tag = FlvTag {
            timestamp_ms: 2010,
            stream_id: 0,
            tag_type: flv::FlvTagType::Audio,
            is_filtered: false,
            data: Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]),
        };
        publisher.write_frame(&tag).unwrap();
        match seen.recv().await.unwrap() {
            SinkEvent::Audio { data, .. } => assert_eq!(&data[..], &[0xAF, 0x00, 0x12, 0x10]),
            other => panic!("unexpected {other:?}"),
        }

        publisher.close().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn server_hangup_before_ready_fails_start() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let token = CancellationToken::new();
        let err = RtmpPublisher::start(&url, PublisherConfig::default(), token.clone())
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, PublishError::Session(_) | PublishError::Io(_)),
            "{err}"
        );
        assert!(token.is_cancelled(), "pump cancels the session on EOF");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn server_hangup_after_ready_is_kept_as_failure() {
        let (url, mut seen) = rtmp_sink_closing_after(Duration::from_millis(300)).await;

        let token = CancellationToken::new();
        let publisher = RtmpPublisher::start(&url, PublisherConfig::default(), token.clone())
            .await
            .unwrap();
        assert!(matches!(seen.recv().await, Some(SinkEvent::Publish { .. })));

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("pump cancels the session on EOF");
        let failure = publisher.take_failure();
        assert!(
            matches!(failure, Some(PublishError::Session(_) | PublishError::Io(_))),
            "{failure:?}"
        );
        assert!(publisher.take_failure().is_none());
        publisher.close().await;
    }

    #[tokio::test]
    async fn closing_records_no_failure() {
        let (url, _seen) = rtmp_sink().await;
        let publisher =
            RtmpPublisher::start(&url, PublisherConfig::default(), CancellationToken::new())
                .await
                .unwrap();
        publisher.close().await;
        assert!(publisher.take_failure().is_none());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = PublisherConfig {
            ready_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let err = RtmpPublisher::start(&url, config, CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PublishError::Timeout));
        server.abort();
    }

    #[tokio::test]
    async fn cancellation_interrupts_start() {
        let (listener, url) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = RtmpPublisher::start(&url, PublisherConfig::default(), token)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PublishError::Cancelled));
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let (listener, url) = listener().await;
        drop(listener);
        let err = RtmpPublisher::start(&url, PublisherConfig::default(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PublishError::Connect { .. }));
    }
}
