// HLS playlist metadata resolution.
//
// Fetches playlists, follows master -> variant indirection (highest declared
// BANDWIDTH wins), and reduces the final media playlist to the counters the
// download core plans around: segment count and total media duration.

mod resolver;

pub use resolver::{
    DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_MAX_VARIANT_HOPS, HttpPlaylistResolver, ResolverConfig,
    fetch_playlist, resolve_playlist,
};

use async_trait::async_trait;
use url::Url;

/// Counters extracted from a media playlist.
///
/// Both are zero-capable: a live playlist with no `#EXTINF` entries yet, or a
/// failed resolution upstream, leaves the consumer with `0` / `0.0` and it
/// must plan without them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaylistSummary {
    pub segment_count: u64,
    pub total_duration_secs: f64,
}

/// Outcome of parsing one playlist document.
#[derive(Debug, Clone)]
pub enum ResolvedPlaylist {
    /// A media playlist, reduced to its summary.
    Media(PlaylistSummary),
    /// A master playlist; `variant_url` points at the selected variant.
    Master { variant_url: Url, bandwidth: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("invalid playlist url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to fetch playlist {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("playlist fetch {url} returned HTTP {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to parse playlist: {0}")]
    Parse(String),

    #[error("master playlist nesting exceeded {0} hops")]
    VariantDepthExceeded(usize),
}

/// Seam between the download core and playlist fetching, so tests can stub
/// resolution without a network.
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    /// Resolve `url` down to a media playlist summary, following master
    /// playlist indirection as needed.
    async fn probe(&self, url: &str) -> Result<PlaylistSummary, PlaylistError>;
}
