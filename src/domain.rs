//! Core data model shared by the service, repositories and the event hub.
//!
//! The metadata structs mirror the field names yt-dlp writes into
//! `*.info.json`, so they deserialize straight from the descriptor files.
//! Everything that older or exotic videos may lack is optional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a job. Stored as lowercase snake_case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "in_progress" => JobStatus::InProgress,
            "complete" => JobStatus::Complete,
            "error" => JobStatus::Error,
            _ => return None,
        })
    }
}

/// One user-submitted unit of archival work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_quality: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Job {
    /// Fresh pending job stamped with the current time.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            status: JobStatus::Pending,
            progress: 0.0,
            custom_quality: None,
            created_at: now,
            updated_at: now,
            warnings: Vec::new(),
        }
    }
}

/// Which stream of a job an update talks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Video,
    Audio,
    Metadata,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Video => "video",
            JobType::Audio => "audio",
            JobType::Metadata => "metadata",
        }
    }
}

/// What the downloader is currently doing for a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    Metadata,
    Video,
    Audio,
    Merging,
    Complete,
}

impl DownloadPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadPhase::Metadata => "metadata",
            DownloadPhase::Video => "video",
            DownloadPhase::Audio => "audio",
            DownloadPhase::Merging => "merging",
            DownloadPhase::Complete => "complete",
        }
    }
}

/// Single video descriptor, deserialized from yt-dlp's info JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(rename = "channel_follower_count", skip_serializing_if = "Option::is_none")]
    pub channel_followers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_is_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader_url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(rename = "filesize_approx", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "ext", skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_range: Option<String>,
    #[serde(rename = "vcodec", skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    #[serde(rename = "acodec", skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_channels: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub was_live: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpage_url_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulltitle: Option<String>,
}

/// Thumbnail variant as listed in playlist/channel descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Thumbnail {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Per-video summary used for playlist items and channel recent-videos.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(rename = "filesize_approx", skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(rename = "ext", skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Playlist descriptor. `items` is only populated after the second,
/// non-flat extraction pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistMetadata {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_url: Option<String>,
    #[serde(rename = "channel_follower_count", skip_serializing_if = "Option::is_none")]
    pub channel_followers: Option<i64>,
    #[serde(rename = "playlist_count")]
    pub item_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<PlaylistItem>,
}

/// Channel descriptor. yt-dlp reports channels as playlists titled
/// "<name> - Videos"; the classifier strips that suffix before this is
/// stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMetadata {
    pub id: String,
    pub channel: String,
    #[serde(rename = "channel_url", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(rename = "channel_follower_count", skip_serializing_if = "Option::is_none")]
    pub channel_followers: Option<i64>,
    pub playlist_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_storage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_views: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_videos: Vec<PlaylistItem>,
}

/// Tagged metadata variant. At most one per job; the repository dispatches
/// each variant to its own table.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Metadata {
    Video(VideoMetadata),
    Playlist(PlaylistMetadata),
    Channel(ChannelMetadata),
}

impl Metadata {
    pub fn kind(&self) -> &'static str {
        match self {
            Metadata::Video(_) => "video",
            Metadata::Playlist(_) => "playlist",
            Metadata::Channel(_) => "channel",
        }
    }

    /// Human-readable title used for the per-variant title columns.
    pub fn title(&self) -> &str {
        match self {
            Metadata::Video(v) => &v.title,
            Metadata::Playlist(p) => &p.title,
            Metadata::Channel(c) => &c.channel,
        }
    }
}

/// A job joined with its metadata, if any has been stored yet.
#[derive(Debug, Clone, Serialize)]
pub struct JobWithMetadata {
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Progress snapshot broadcast to subscribers and mirrored onto the job row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub job_type: JobType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub current_item: usize,
    pub total_items: usize,
    pub progress: f64,
    pub current_video_progress: f64,
    pub download_phase: DownloadPhase,
    pub is_retrying: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Metadata became available (or was enriched) for a job.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataUpdate {
    #[serde(rename = "jobID")]
    pub job_id: String,
    pub metadata: Metadata,
}

/// Everything the hub can fan out. Subscribers discriminate by shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    Progress(ProgressUpdate),
    Metadata(MetadataUpdate),
}

/// Tunables persisted as the single settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub id: i64,
    pub theme: String,
    pub download_quality: i64,
    pub concurrent_downloads: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Settings {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 1,
            theme: "dark".to_string(),
            download_quality: 1080,
            concurrent_downloads: 2,
            created_at: now,
            updated_at: now,
        }
    }
}
