//! Stream descriptors and the providers that produce them.
//!
//! A [`StreamProvider`] turns a user-supplied URL into one or more
//! [`StreamDescriptor`]s, each listing the concrete stream variants that can be
//! fetched. Page scraping for streaming platforms lives outside this crate;
//! the only built-in provider is [`DirectLinkProvider`], which treats the URL
//! itself as a direct media link.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::ResolutionError;

/// Kind of media carried by a stream variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Audio-only stream.
    Audio,
    /// Video stream (usually muxed with audio).
    Video,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// One fetchable rendition of a piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamVariant {
    /// Audio or video.
    pub kind: StreamKind,
    /// Direct URL the bytes are fetched from.
    pub fetch_url: String,
    /// Size in bytes, if the provider knows it.
    pub byte_size: Option<u64>,
    /// Human-readable quality, e.g. `720p` or `128kbps`.
    pub quality_label: String,
}

impl StreamVariant {
    /// Create a new variant.
    pub fn new(kind: StreamKind, fetch_url: impl Into<String>) -> Self {
        Self {
            kind,
            fetch_url: fetch_url.into(),
            byte_size: None,
            quality_label: String::new(),
        }
    }

    /// Set the byte size.
    #[must_use]
    pub const fn with_byte_size(mut self, size: u64) -> Self {
        self.byte_size = Some(size);
        self
    }

    /// Set the quality label.
    #[must_use]
    pub fn with_quality_label(mut self, label: impl Into<String>) -> Self {
        self.quality_label = label.into();
        self
    }

    /// Vertical resolution parsed from the quality label (`"1080p60"` -> 1080).
    fn resolution(&self) -> u32 {
        let digits: String = self
            .quality_label
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().unwrap_or(0)
    }

    /// File extension implied by the fetch URL path, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        let url = Url::parse(&self.fetch_url).ok()?;
        let segment = url.path_segments()?.next_back()?.to_string();
        let (_, ext) = segment.rsplit_once('.')?;
        let valid = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
        valid.then(|| ext.to_ascii_lowercase())
    }
}

/// Metadata and stream variants for one piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Provider-specific media ID.
    pub id: String,
    /// Media title.
    pub title: String,
    /// Duration in seconds, when known.
    pub duration_seconds: Option<u64>,
    /// Available variants, in provider order.
    pub variants: Vec<StreamVariant>,
    /// Thumbnail URL for previews.
    pub thumbnail_url: Option<String>,
}

impl StreamDescriptor {
    /// Pick the variant to download for the requested kind.
    ///
    /// Audio takes the first audio variant the provider lists. Video takes the
    /// highest resolution by quality label, keeping provider order on ties.
    pub fn select_variant(&self, kind: StreamKind) -> Result<&StreamVariant, ResolutionError> {
        let mut candidates = self.variants.iter().filter(|v| v.kind == kind);

        let selected = match kind {
            StreamKind::Audio => candidates.next(),
            StreamKind::Video => candidates.fold(None, |best: Option<&StreamVariant>, v| match best {
                Some(b) if b.resolution() >= v.resolution() => Some(b),
                _ => Some(v),
            }),
        };

        selected.ok_or_else(|| ResolutionError::NoMatchingVariant {
            title: self.title.clone(),
            kind: kind.to_string(),
        })
    }

    /// Duration formatted for display.
    #[must_use]
    pub fn formatted_duration(&self) -> Option<String> {
        self.duration_seconds.map(format_duration)
    }
}

/// Format a duration in seconds as `M:SS`, or `H:MM:SS` past one hour.
#[must_use]
pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Validate that `input` is an absolute `http` or `https` URL.
pub fn validate_url(input: &str) -> Result<Url, ResolutionError> {
    let trimmed = input.trim();
    let url = Url::parse(trimmed).map_err(|e| ResolutionError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        "http" | "https" => Err(ResolutionError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing host".to_string(),
        }),
        _ => Err(ResolutionError::UnsupportedSource {
            url: trimmed.to_string(),
        }),
    }
}

/// Resolves URLs into stream descriptors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamProvider: Send + Sync {
    /// Resolve a URL into one descriptor (single media) or many (playlist).
    async fn resolve(&self, url: &str) -> Result<Vec<StreamDescriptor>, ResolutionError>;
}

/// Default timeout for the HEAD request.
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Provider for URLs that already point at a media file.
///
/// The URL is checked with a `HEAD` request to learn its size and content type.
/// The result is a single descriptor with a single variant whose kind follows
/// the `Content-Type` header, falling back to the file extension.
#[derive(Debug, Clone)]
pub struct DirectLinkProvider {
    client: reqwest::Client,
    head_timeout: Duration,
}

impl DirectLinkProvider {
    /// Create a provider with its own HTTP client.
    #[must_use]
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Create a provider sharing an existing HTTP client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    /// Set the HEAD request timeout.
    #[must_use]
    pub const fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }
}

impl Default for DirectLinkProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Guess the stream kind from a content type, then from a file extension.
fn classify_kind(content_type: Option<&str>, extension: Option<&str>) -> Option<StreamKind> {
    if let Some(ct) = content_type {
        if ct.starts_with("audio/") {
            return Some(StreamKind::Audio);
        }
        if ct.starts_with("video/") {
            return Some(StreamKind::Video);
        }
    }
    match extension? {
        "mp3" | "m4a" | "aac" | "ogg" | "opus" | "flac" | "wav" | "weba" => Some(StreamKind::Audio),
        "mp4" | "webm" | "mkv" | "mov" | "avi" | "m4v" => Some(StreamKind::Video),
        _ => None,
    }
}

#[async_trait]
impl StreamProvider for DirectLinkProvider {
    async fn resolve(&self, url: &str) -> Result<Vec<StreamDescriptor>, ResolutionError> {
        let parsed = validate_url(url)?;
        debug!("Probing direct link {}", parsed);

        let response = tokio::time::timeout(self.head_timeout, self.client.head(parsed.as_str()).send())
            .await
            .map_err(|_| ResolutionError::Unreachable {
                url: url.to_string(),
                reason: format!("no response within {:?}", self.head_timeout),
            })?
            .map_err(|e| ResolutionError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ResolutionError::Restricted {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ResolutionError::NotFound {
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        let mut variant = StreamVariant::new(StreamKind::Video, parsed.as_str());
        let extension = variant.extension();
        variant.kind = classify_kind(content_type.as_deref(), extension.as_deref()).ok_or_else(|| {
            ResolutionError::UnsupportedSource {
                url: url.to_string(),
            }
        })?;
        variant.byte_size = response.content_length().filter(|&len| len > 0);
        variant.quality_label = "original".to_string();

        let title = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|name| name.rsplit_once('.').map_or(Some(name), |(stem, _)| Some(stem)))
            .filter(|name| !name.is_empty())
            .unwrap_or("download")
            .to_string();

        info!(
            "Resolved direct link '{}' as {} ({:?} bytes)",
            title, variant.kind, variant.byte_size
        );

        Ok(vec![StreamDescriptor {
            id: parsed.to_string(),
            title,
            duration_seconds: None,
            variants: vec![variant],
            thumbnail_url: None,
        }])
    }
}
