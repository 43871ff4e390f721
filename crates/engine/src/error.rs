use flv::FlvError;
use process_utils::ProcessError;
use reqwest::StatusCode;
use ts::TsError;

use crate::publisher::PublishError;

#[derive(Debug, thiserror::Error)]
pub enum TidalError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("unsupported protocol `{protocol}`")]
    UnsupportedProtocol { protocol: String },

    #[error("unsupported content type `{content_type}` for {url}")]
    UnsupportedContentType { content_type: String, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("no variant with supported codecs")]
    NoSupportedVariant,

    #[error("demux error: {reason}")]
    Demux { reason: String },

    #[error("publish error: {source}")]
    Publish {
        #[from]
        source: PublishError,
    },

    #[error("remux failed: {reason}")]
    Remux { reason: String },

    #[error("process error: {source}")]
    Process {
        #[from]
        source: ProcessError,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TidalError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Transport failures and 5xx/429 responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => crate::retry::is_retryable_reqwest_error(source),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Io { .. } | Self::Timeout { .. } => true,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::UnsupportedProtocol { .. }
            | Self::UnsupportedContentType { .. }
            | Self::Playlist { .. }
            | Self::NoSupportedVariant
            | Self::Demux { .. }
            | Self::Publish { .. }
            | Self::Remux { .. }
            | Self::Process { .. }
            | Self::Internal { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Publish {
                    source: PublishError::Cancelled
                }
                | Self::Process {
                    source: ProcessError::Cancelled(_)
                }
        )
    }
}

impl From<TsError> for TidalError {
    fn from(err: TsError) -> Self {
        Self::Demux {
            reason: format!("TS: {err}"),
        }
    }
}

impl From<FlvError> for TidalError {
    fn from(err: FlvError) -> Self {
        Self::Demux {
            reason: format!("FLV: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_retryability() {
        let err = TidalError::http_status(StatusCode::BAD_GATEWAY, "http://a/b", "segment");
        assert!(err.is_retryable());
        let err = TidalError::http_status(StatusCode::TOO_MANY_REQUESTS, "http://a/b", "segment");
        assert!(err.is_retryable());
        let err = TidalError::http_status(StatusCode::NOT_FOUND, "http://a/b", "segment");
        assert!(!err.is_retryable());
    }

    #[test]
    fn parse_errors_are_not_retryable() {
        assert!(!TidalError::playlist("bad").is_retryable());
        assert!(!TidalError::from(TsError::InvalidPesStartCode).is_retryable());
        assert!(TidalError::from(PublishError::Cancelled).is_cancelled());
    }
}
