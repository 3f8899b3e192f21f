// Playlist fetching and reduction.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use m3u8_rs::{MediaPlaylist, parse_playlist_res};
use tracing::{debug, warn};
use url::Url;

use crate::{PlaylistError, PlaylistResolver, PlaylistSummary, ResolvedPlaylist};

/// Timeout applied to each individual playlist request.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;

/// Master playlists occasionally point at further master playlists; give up
/// after this many hops.
pub const DEFAULT_MAX_VARIANT_HOPS: usize = 4;

fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Another crate may have installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Per-request timeout.
    pub fetch_timeout: Duration,
    /// Maximum master -> variant indirection depth.
    pub max_variant_hops: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            max_variant_hops: DEFAULT_MAX_VARIANT_HOPS,
        }
    }
}

/// Network-backed [`PlaylistResolver`].
pub struct HttpPlaylistResolver {
    client: reqwest::Client,
    config: ResolverConfig,
}

impl HttpPlaylistResolver {
    pub fn new() -> Self {
        Self::with_config(ResolverConfig::default())
    }

    pub fn with_config(config: ResolverConfig) -> Self {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap_or_else(|error| {
                warn!(error = %error, "failed to build HTTP client; falling back to defaults");
                reqwest::Client::new()
            });
        Self { client, config }
    }
}

impl Default for HttpPlaylistResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaylistResolver for HttpPlaylistResolver {
    async fn probe(&self, url: &str) -> Result<PlaylistSummary, PlaylistError> {
        let mut current = Url::parse(url).map_err(|e| PlaylistError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        for _ in 0..self.config.max_variant_hops {
            let text = fetch_playlist(&self.client, &current).await?;
            let base_url = current.join(".").map_err(|e| PlaylistError::InvalidUrl {
                url: current.to_string(),
                reason: e.to_string(),
            })?;
            match resolve_playlist(&text, &base_url)? {
                ResolvedPlaylist::Media(summary) => {
                    debug!(
                        url = %current,
                        segments = summary.segment_count,
                        duration_secs = summary.total_duration_secs,
                        "resolved media playlist"
                    );
                    return Ok(summary);
                }
                ResolvedPlaylist::Master {
                    variant_url,
                    bandwidth,
                } => {
                    debug!(url = %variant_url, bandwidth, "following master playlist variant");
                    current = variant_url;
                }
            }
        }

        Err(PlaylistError::VariantDepthExceeded(
            self.config.max_variant_hops,
        ))
    }
}

/// GET `url` and return the body as text. Non-2xx statuses are errors.
pub async fn fetch_playlist(client: &reqwest::Client, url: &Url) -> Result<String, PlaylistError> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| PlaylistError::Fetch {
            url: url.to_string(),
            source: e,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(PlaylistError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }

    response.text().await.map_err(|e| PlaylistError::Fetch {
        url: url.to_string(),
        source: e,
    })
}

/// Parse one playlist document.
///
/// Media playlists reduce to a [`PlaylistSummary`]; master playlists select
/// the variant with the highest declared BANDWIDTH and resolve its URI
/// (possibly relative) against `base_url`.
pub fn resolve_playlist(text: &str, base_url: &Url) -> Result<ResolvedPlaylist, PlaylistError> {
    match parse_playlist_res(text.as_bytes()) {
        Ok(m3u8_rs::Playlist::MediaPlaylist(playlist)) => {
            Ok(ResolvedPlaylist::Media(summarize(&playlist)))
        }
        Ok(m3u8_rs::Playlist::MasterPlaylist(playlist)) => {
            let variant = playlist
                .variants
                .iter()
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| PlaylistError::Parse("master playlist has no variants".into()))?;
            let variant_url = base_url.join(&variant.uri).map_err(|e| {
                PlaylistError::Parse(format!(
                    "could not join variant URI {} against {base_url}: {e}",
                    variant.uri
                ))
            })?;
            Ok(ResolvedPlaylist::Master {
                variant_url,
                bandwidth: variant.bandwidth,
            })
        }
        Err(e) => Err(PlaylistError::Parse(format!("{e}"))),
    }
}

fn summarize(playlist: &MediaPlaylist) -> PlaylistSummary {
    PlaylistSummary {
        segment_count: playlist.segments.len() as u64,
        total_duration_secs: playlist
            .segments
            .iter()
            .map(|s| f64::from(s.duration))
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXTINF:9.009,\n\
seg0.ts\n\
#EXTINF:9.009,\n\
seg1.ts\n\
#EXTINF:3.003,\n\
seg2.ts\n\
#EXT-X-ENDLIST\n";

    const MASTER_PLAYLIST: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=640x360\n\
low/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2560000,RESOLUTION=1280x720\n\
mid/index.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=7680000,RESOLUTION=1920x1080\n\
high/index.m3u8\n";

    fn base() -> Url {
        Url::parse("https://cdn.example.com/stream/").unwrap()
    }

    #[test]
    fn test_media_playlist_summary() {
        let resolved = resolve_playlist(MEDIA_PLAYLIST, &base()).unwrap();
        match resolved {
            ResolvedPlaylist::Media(summary) => {
                assert_eq!(summary.segment_count, 3);
                assert!((summary.total_duration_secs - 21.021).abs() < 0.001);
            }
            other => panic!("expected media playlist, got {other:?}"),
        }
    }

    #[test]
    fn test_master_selects_highest_bandwidth() {
        let resolved = resolve_playlist(MASTER_PLAYLIST, &base()).unwrap();
        match resolved {
            ResolvedPlaylist::Master {
                variant_url,
                bandwidth,
            } => {
                assert_eq!(bandwidth, 7_680_000);
                assert_eq!(
                    variant_url.as_str(),
                    "https://cdn.example.com/stream/high/index.m3u8"
                );
            }
            other => panic!("expected master playlist, got {other:?}"),
        }
    }

    #[test]
    fn test_master_absolute_variant_uri() {
        let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000\n\
https://other.example.net/v/index.m3u8\n";
        match resolve_playlist(master, &base()).unwrap() {
            ResolvedPlaylist::Master { variant_url, .. } => {
                assert_eq!(variant_url.as_str(), "https://other.example.net/v/index.m3u8");
            }
            other => panic!("expected master playlist, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_media_playlist_is_zero() {
        let empty = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-ENDLIST\n";
        match resolve_playlist(empty, &base()).unwrap() {
            ResolvedPlaylist::Media(summary) => {
                assert_eq!(summary.segment_count, 0);
                assert_eq!(summary.total_duration_secs, 0.0);
            }
            other => panic!("expected media playlist, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let err = resolve_playlist("this is not a playlist", &base()).unwrap_err();
        assert!(matches!(err, PlaylistError::Parse(_)));
    }

    #[tokio::test]
    async fn test_probe_rejects_malformed_url() {
        let resolver = HttpPlaylistResolver::new();
        let err = resolver.probe("not a url").await.unwrap_err();
        assert!(matches!(err, PlaylistError::InvalidUrl { .. }));
    }
}
