use url::Url;

/// Container of a relay source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// HLS playlist with MPEG-TS segments
    Hls,
    /// HTTP-FLV, including the `video/x-p2p` flavour
    Flv,
}

const HLS_CONTENT_TYPES: [&str; 2] = ["application/vnd.apple.mpegurl", "application/x-mpegurl"];
const FLV_CONTENT_TYPES: [&str; 2] = ["video/x-flv", "video/x-p2p"];

/// Classify a source by its declared content type, falling back to the
/// extension of the URL path.
pub fn detect_source(content_type: Option<&str>, url: &Url) -> Option<SourceKind> {
    if let Some(kind) = content_type.and_then(from_content_type) {
        return Some(kind);
    }

    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".m3u8") {
        Some(SourceKind::Hls)
    } else if path.ends_with(".flv") || path.ends_with(".xs") {
        Some(SourceKind::Flv)
    } else {
        None
    }
}

fn from_content_type(content_type: &str) -> Option<SourceKind> {
    let content_type = content_type.to_ascii_lowercase();
    if HLS_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
        Some(SourceKind::Hls)
    } else if FLV_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
        Some(SourceKind::Flv)
    } else {
        None
    }
}
