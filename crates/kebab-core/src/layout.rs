//! On-disk layout for downloads.
//!
//! Downloads land under a root directory partitioned by type:
//!
//! ```text
//! <root>/Audio/
//! <root>/Video/
//! <root>/Playlist/Audio/
//! <root>/Playlist/Video/
//! ```
//!
//! While a transfer is running the bytes go to `<destination>.part`, which is
//! renamed over the destination once the transfer completes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::provider::{StreamKind, StreamVariant};

/// Suffix appended to a destination path while its transfer is in progress.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Maximum length in bytes of a sanitized file stem.
const MAX_STEM_LEN: usize = 200;

/// What the user asked to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadType {
    /// A single item, audio only.
    #[default]
    Audio,
    /// A single item, best video.
    Video,
    /// Every item of a playlist, audio only.
    PlaylistAudio,
    /// Every item of a playlist, best video.
    PlaylistVideo,
}

impl DownloadType {
    /// Stream kind to select for this download type.
    #[must_use]
    pub const fn stream_kind(self) -> StreamKind {
        match self {
            Self::Audio | Self::PlaylistAudio => StreamKind::Audio,
            Self::Video | Self::PlaylistVideo => StreamKind::Video,
        }
    }

    /// Whether every resolved descriptor is enqueued rather than only the first.
    #[must_use]
    pub const fn is_playlist(self) -> bool {
        matches!(self, Self::PlaylistAudio | Self::PlaylistVideo)
    }

    /// Directory for this type, relative to the download root.
    #[must_use]
    pub fn subdirectory(self) -> PathBuf {
        match self {
            Self::Audio => PathBuf::from("Audio"),
            Self::Video => PathBuf::from("Video"),
            Self::PlaylistAudio => Path::new("Playlist").join("Audio"),
            Self::PlaylistVideo => Path::new("Playlist").join("Video"),
        }
    }
}

impl std::fmt::Display for DownloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
            Self::PlaylistAudio => write!(f, "playlist-audio"),
            Self::PlaylistVideo => write!(f, "playlist-video"),
        }
    }
}

impl std::str::FromStr for DownloadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "playlist-audio" => Ok(Self::PlaylistAudio),
            "playlist-video" => Ok(Self::PlaylistVideo),
            other => Err(format!(
                "unknown download type '{other}' (expected audio, video, playlist-audio or playlist-video)"
            )),
        }
    }
}

/// Sanitize a string for use as a filename.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| if invalid_chars.contains(&c) || c.is_control() { '_' } else { c })
        .collect();

    let trimmed = sanitized.trim().trim_matches('.');

    let mut end = trimmed.len().min(MAX_STEM_LEN);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let result = trimmed[..end].trim_end();

    if result.is_empty() {
        "untitled".to_string()
    } else {
        result.to_string()
    }
}

/// Build the final destination path for a title and variant.
#[must_use]
pub fn destination_path(
    root: &Path,
    download_type: DownloadType,
    title: &str,
    variant: &StreamVariant,
) -> PathBuf {
    let extension = variant.extension().unwrap_or_else(|| {
        match variant.kind {
            StreamKind::Audio => "m4a",
            StreamKind::Video => "mp4",
        }
        .to_string()
    });

    root.join(download_type.subdirectory())
        .join(format!("{}.{extension}", sanitize_filename(title)))
}

/// Path of the partial file used while `destination` is being written.
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}
