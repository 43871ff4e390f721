// Playlist helpers: parsing, leading-variant choice, live edge and reload timing.
use std::time::Duration;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, MediaPlaylistType, Playlist, VariantStream};
use url::Url;

use crate::TidalError;

/// Default segment index to start live streams at, counted from the end.
pub const DEFAULT_LIVE_START_INDEX: i64 = -3;

const SUPPORTED_CODEC_PREFIXES: [&str; 4] = ["avc1.", "hvc1.", "hev1.", "mp4a."];

pub fn parse_playlist(bytes: &[u8], url: &Url) -> Result<Playlist, TidalError> {
    m3u8_rs::parse_playlist_res(bytes)
        .map_err(|e| TidalError::playlist(format!("failed to parse playlist {url}: {e}")))
}

/// Parse a playlist that must be a media playlist.
pub fn parse_media_playlist(bytes: &[u8], url: &Url) -> Result<MediaPlaylist, TidalError> {
    match parse_playlist(bytes, url)? {
        Playlist::MediaPlaylist(pl) => Ok(pl),
        Playlist::MasterPlaylist(_) => Err(TidalError::playlist(format!(
            "expected media playlist, got master for {url}"
        ))),
    }
}

/// True when every codec in the comma separated list is one we can carry.
/// A missing or empty list is accepted.
pub fn is_supported_codecs(codecs: Option<&str>) -> bool {
    codecs
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .all(|codec| {
            codec == "opus"
                || SUPPORTED_CODEC_PREFIXES
                    .iter()
                    .any(|prefix| codec.starts_with(prefix))
        })
}

/// Pick the supported variant with the greatest bandwidth. The first one seen
/// wins ties. I-frame only renditions are never picked.
pub fn select_variant(master: &MasterPlaylist) -> Option<&VariantStream> {
    master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame && is_supported_codecs(v.codecs.as_deref()))
        .fold(None, |best: Option<&VariantStream>, v| match best {
            Some(b) if v.bandwidth <= b.bandwidth => Some(b),
            _ => Some(v),
        })
}

/// A playlist is finite once it carries `EXT-X-ENDLIST` or is typed VOD.
pub fn is_vod(playlist: &MediaPlaylist) -> bool {
    playlist.end_list || matches!(playlist.playlist_type, Some(MediaPlaylistType::Vod))
}

/// Sequence number of the first segment to dispatch.
///
/// Live playlists start `live_start_index` segments from the start
/// (non-negative) or the end (negative), clamped to the snapshot. Returns
/// `None` for a live playlist without segments.
pub fn select_start_sequence(playlist: &MediaPlaylist, live_start_index: i64) -> Option<u64> {
    let ms = playlist.media_sequence;
    if is_vod(playlist) {
        return Some(ms);
    }
    let count = playlist.segments.len() as i64;
    if count == 0 {
        return None;
    }
    let offset = if live_start_index < 0 {
        (live_start_index + count).max(0)
    } else {
        live_start_index.min(count - 1)
    };
    Some(ms + offset as u64)
}

/// Index of the last segment in the snapshot.
pub fn last_sequence(playlist: &MediaPlaylist) -> Option<u64> {
    (!playlist.segments.is_empty())
        .then(|| playlist.media_sequence + playlist.segments.len() as u64 - 1)
}

/// Wait before the next reload: the newest segment's duration, or the target
/// duration for an empty playlist. A duration that does not fit a
/// [`Duration`] is a playlist error.
pub fn default_reload_interval(playlist: &MediaPlaylist) -> Result<Duration, TidalError> {
    match playlist.segments.last() {
        Some(segment) => Duration::try_from_secs_f32(segment.duration.max(0.0)).map_err(|e| {
            TidalError::playlist(format!("invalid segment duration {}: {e}", segment.duration))
        }),
        None => Ok(Duration::from_secs(playlist.target_duration)),
    }
}

/// Reload interval after a refetch. Without new segments past `watermark`,
/// back off to half the target duration (at least one second).
pub fn reload_interval(
    playlist: &MediaPlaylist,
    watermark: Option<u64>,
) -> Result<Duration, TidalError> {
    let has_new = match (last_sequence(playlist), watermark) {
        (Some(last), Some(mark)) => last > mark,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if has_new {
        default_reload_interval(playlist)
    } else {
        Ok(Duration::from_secs((playlist.target_duration / 2).max(1)))
    }
}

/// Resolve a playlist or segment URI against the URL it was listed in.
pub fn resolve_url(uri: &str, base_url: &Url) -> Result<Url, TidalError> {
    base_url
        .join(uri.trim())
        .map_err(|e| TidalError::invalid_url(uri, e.to_string()))
}
