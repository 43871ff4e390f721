use url::Url;

use super::PublishError;

pub const DEFAULT_RTMP_PORT: u16 = 1935;
pub const DEFAULT_RTMPS_PORT: u16 = 443;

/// Connection parameters taken from an `rtmp://` or `rtmps://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// Application name, with the query string when one is present
    pub app: String,
    pub stream_key: String,
}

impl RtmpUrl {
    /// Parse `rtmp[s]://host[:port]/app[/...]/stream_key[?query]`.
    pub fn parse(input: &str) -> Result<Self, PublishError> {
        let invalid = |reason: &str| PublishError::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(input.trim()).map_err(|e| invalid(&e.to_string()))?;
        let tls = match url.scheme() {
            "rtmp" => false,
            "rtmps" => true,
            _ => return Err(invalid("scheme must be rtmp or rtmps")),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_RTMPS_PORT } else { DEFAULT_RTMP_PORT });

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();
        let Some((stream_key, app)) = segments.split_last() else {
            return Err(invalid("missing app and stream key"));
        };
        if app.is_empty() {
            return Err(invalid("missing stream key"));
        }

        let mut app = app.join("/");
        if let Some(query) = url.query().filter(|q| !q.is_empty()) {
            app.push('?');
            app.push_str(query);
        }

        Ok(Self {
            tls,
            host,
            port,
            app,
            stream_key: stream_key.to_string(),
        })
    }

    /// `tcUrl` sent in the connect command.
    pub fn tc_url(&self) -> String {
        let scheme = if self.tls { "rtmps" } else { "rtmp" };
        format!("{scheme}://{}:{}/{}", self.host, self.port, self.app)
    }

    pub fn address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}
