use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::TidalError;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client options shared by the downloader and the relay.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a request, zero disables it.
    ///
    /// Keep this at zero for the relay: an HTTP-FLV body is read for as long
    /// as the stream runs.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Idle timeout for pooled connections
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Headers sent with every request, merged over the defaults
    pub headers: HeaderMap,

    /// Retry behaviour for playlist and segment fetches
    pub retry: RetryPolicy,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloaderConfig {
    /// Merge custom headers over the defaults. Custom values win.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Result<Self, TidalError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_ref().trim().as_bytes()).map_err(|e| {
                TidalError::Internal {
                    reason: format!("invalid header name `{}`: {e}", name.as_ref()),
                }
            })?;
            let value = HeaderValue::from_str(value.as_ref().trim()).map_err(|e| {
                TidalError::Internal {
                    reason: format!("invalid value for header `{name}`: {e}"),
                }
            })?;
            self.headers.insert(name, value);
        }
        Ok(self)
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }
}

/// Split a `Key: Value` header line.
pub fn parse_header_line(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
