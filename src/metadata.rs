//! Metadata extraction: runs the downloader in info-only mode, classifies the
//! descriptor it writes, and optionally enriches playlists and channels with
//! per-item details from a second, non-flat pass.
//!
//! Classification rule: yt-dlp reports channels as playlists whose title ends
//! in " - Videos", so `_type == "playlist"` plus that suffix means channel,
//! `_type == "playlist"` alone means playlist, anything else is a video.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use crate::domain::{
    ChannelMetadata, DownloadPhase, Event, Job, JobType, Metadata, MetadataUpdate, PlaylistItem,
    PlaylistMetadata, ProgressUpdate, VideoMetadata,
};
use crate::hub::EventHub;
use crate::repository::JobRepository;

const CHANNEL_TITLE_SUFFIX: &str = " - Videos";
/// Channels list their full history; only this many land in recent_videos.
const RECENT_VIDEO_LIMIT: usize = 10;

static INFO_JSON_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Writing (?:video|playlist) metadata as JSON to: (.+\.info\.json)")
        .expect("info json pattern")
});

/// Runs the downloader with download skipped and turns the resulting
/// `*.info.json` into a stored [`Metadata`] variant.
pub struct MetadataExtractor {
    ytdlp_bin: PathBuf,
    repo: Arc<dyn JobRepository>,
    hub: Arc<EventHub>,
}

impl MetadataExtractor {
    pub fn new(ytdlp_bin: PathBuf, repo: Arc<dyn JobRepository>, hub: Arc<EventHub>) -> Self {
        Self {
            ytdlp_bin,
            repo,
            hub,
        }
    }

    /// Extracts, classifies, stores and broadcasts metadata for a job.
    ///
    /// The flat pass result is stored as soon as the info file parses so the
    /// UI gets immediate feedback; enrichment failures only log.
    pub async fn extract(&self, job: &Job, output_template: &str) -> Result<Metadata> {
        self.hub
            .broadcast(Event::Progress(metadata_progress(&job.id, 0.0)))
            .await;

        let output = Command::new(&self.ytdlp_bin)
            .arg("--skip-download")
            .arg("--write-info-json")
            .arg("--no-progress")
            .arg("--flat-playlist")
            .arg("--output")
            .arg(output_template)
            .arg(&job.url)
            .output()
            .await
            .context("starting metadata extraction")?;

        if !output.status.success() {
            bail!("metadata extraction exited with {}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let info_path = [stdout.as_ref(), stderr.as_ref()]
            .iter()
            .find_map(|text| {
                INFO_JSON_PATH
                    .captures(text)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().trim().to_string())
            })
            .ok_or_else(|| anyhow!("could not find metadata file path in downloader output"))?;

        let raw = tokio::fs::read_to_string(&info_path)
            .await
            .with_context(|| format!("reading info file {info_path}"))?;
        let value: Value = serde_json::from_str(&raw).context("parsing info file")?;
        let mut metadata = classify_info(&value)?;

        self.store_and_broadcast(&job.id, &metadata).await;

        if matches!(metadata, Metadata::Playlist(_) | Metadata::Channel(_)) {
            match self.enrich(job, &mut metadata).await {
                Ok(()) => self.store_and_broadcast(&job.id, &metadata).await,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "metadata enrichment failed, keeping flat metadata");
                }
            }
        }

        self.hub
            .broadcast(Event::Progress(metadata_progress(&job.id, 1.0)))
            .await;

        Ok(metadata)
    }

    async fn store_and_broadcast(&self, job_id: &str, metadata: &Metadata) {
        if let Err(err) = self.repo.store_metadata(job_id, metadata).await {
            tracing::warn!(job_id, error = %err, "failed to store metadata");
            return;
        }
        self.hub
            .broadcast(Event::Metadata(MetadataUpdate {
                job_id: job_id.to_string(),
                metadata: metadata.clone(),
            }))
            .await;
    }

    /// Second pass with `--dump-single-json --no-flat-playlist` to pull the
    /// per-item details the flat listing omits.
    async fn enrich(&self, job: &Job, metadata: &mut Metadata) -> Result<()> {
        let output = Command::new(&self.ytdlp_bin)
            .arg("--skip-download")
            .arg("--dump-single-json")
            .arg("--no-flat-playlist")
            .arg(&job.url)
            .output()
            .await
            .context("starting detailed metadata extraction")?;

        if !output.status.success() {
            bail!("detailed metadata extraction exited with {}", output.status);
        }

        let detailed: Value =
            serde_json::from_slice(&output.stdout).context("parsing detailed metadata")?;

        match metadata {
            Metadata::Playlist(playlist) => enrich_playlist(playlist, &detailed),
            Metadata::Channel(channel) => enrich_channel(channel, &detailed),
            Metadata::Video(_) => Ok(()),
        }
    }
}

fn metadata_progress(job_id: &str, progress: f64) -> ProgressUpdate {
    ProgressUpdate {
        job_id: job_id.to_string(),
        job_type: JobType::Metadata,
        status: None,
        current_item: 0,
        total_items: 0,
        progress,
        current_video_progress: 0.0,
        download_phase: DownloadPhase::Metadata,
        is_retrying: false,
        retry_count: 0,
        max_retries: 0,
        retry_error: None,
        warnings: Vec::new(),
    }
}

/// Classifies a parsed info file into its metadata variant.
pub fn classify_info(value: &Value) -> Result<Metadata> {
    let entry_type = value.get("_type").and_then(Value::as_str).unwrap_or("");
    if entry_type != "playlist" {
        let video: VideoMetadata =
            serde_json::from_value(value.clone()).context("deserializing video metadata")?;
        return Ok(Metadata::Video(video));
    }

    let title = value.get("title").and_then(Value::as_str).unwrap_or("");
    if let Some(channel_name) = title.strip_suffix(CHANNEL_TITLE_SUFFIX) {
        let mut channel: ChannelMetadata =
            serde_json::from_value(value.clone()).context("deserializing channel metadata")?;
        if channel.channel.is_empty() {
            channel.channel = channel_name.to_string();
        } else if let Some(stripped) = channel.channel.strip_suffix(CHANNEL_TITLE_SUFFIX) {
            channel.channel = stripped.to_string();
        }
        return Ok(Metadata::Channel(channel));
    }

    let playlist: PlaylistMetadata =
        serde_json::from_value(value.clone()).context("deserializing playlist metadata")?;
    Ok(Metadata::Playlist(playlist))
}

fn enrich_playlist(playlist: &mut PlaylistMetadata, detailed: &Value) -> Result<()> {
    let entries = detailed
        .get("entries")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("no entries in detailed playlist data"))?;

    playlist.items = entries.iter().map(playlist_item_from_entry).collect();
    playlist.item_count = playlist.items.len() as i64;

    if playlist.view_count.unwrap_or(0) == 0 && !playlist.items.is_empty() {
        let total: i64 = playlist
            .items
            .iter()
            .filter_map(|item| item.view_count)
            .sum();
        if total > 0 {
            playlist.view_count = Some(total);
        }
    }
    Ok(())
}

fn enrich_channel(channel: &mut ChannelMetadata, detailed: &Value) -> Result<()> {
    let entries = detailed
        .get("entries")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("no entries in detailed channel data"))?;

    channel.video_count = Some(entries.len() as i64);
    channel.recent_videos = entries
        .iter()
        .take(RECENT_VIDEO_LIMIT)
        .map(playlist_item_from_entry)
        .collect();
    channel.total_views = Some(
        entries
            .iter()
            .filter_map(|entry| entry.get("view_count").and_then(Value::as_i64))
            .sum(),
    );
    channel.total_storage = Some(
        entries
            .iter()
            .filter_map(|entry| entry.get("filesize_approx").and_then(Value::as_i64))
            .sum(),
    );
    Ok(())
}

fn playlist_item_from_entry(entry: &Value) -> PlaylistItem {
    let duration = entry.get("duration").and_then(Value::as_i64);
    PlaylistItem {
        id: string_field(entry, "id"),
        title: string_field(entry, "title"),
        description: optional_string(entry, "description"),
        thumbnail: best_thumbnail(entry),
        duration,
        duration_string: duration.and_then(format_duration),
        upload_date: optional_string(entry, "upload_date"),
        view_count: entry.get("view_count").and_then(Value::as_i64),
        like_count: entry.get("like_count").and_then(Value::as_i64),
        channel: optional_string(entry, "channel"),
        channel_id: optional_string(entry, "channel_id"),
        channel_url: optional_string(entry, "channel_url"),
        width: entry.get("width").and_then(Value::as_i64),
        height: entry.get("height").and_then(Value::as_i64),
        resolution: optional_string(entry, "resolution"),
        file_size: entry.get("filesize_approx").and_then(Value::as_i64),
        format: optional_string(entry, "format"),
        extension: optional_string(entry, "ext"),
        tags: entry
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn string_field(entry: &Value, key: &str) -> String {
    entry
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn optional_string(entry: &Value, key: &str) -> Option<String> {
    entry
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Highest-quality thumbnail; yt-dlp sorts them worst to best.
fn best_thumbnail(entry: &Value) -> Option<String> {
    entry
        .get("thumbnails")
        .and_then(Value::as_array)
        .and_then(|thumbnails| thumbnails.last())
        .and_then(|thumbnail| thumbnail.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn format_duration(seconds: i64) -> Option<String> {
    if seconds <= 0 {
        return None;
    }
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    Some(if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SqliteStore;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const VIDEO_INFO: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Rick Astley - Never Gonna Give You Up (Official Video)",
        "channel": "Rick Astley",
        "duration": 212,
        "width": 1920,
        "height": 1080,
        "_type": "video"
    }"#;

    const PLAYLIST_INFO: &str = r#"{
        "id": "PLrAXtmErZgOeiKm4sgNOknGvNjby9efdf",
        "title": "Best Music Videos",
        "channel": "Test User",
        "playlist_count": 25,
        "_type": "playlist"
    }"#;

    const CHANNEL_INFO: &str = r#"{
        "id": "UCuAXFkgsw1L7xaCfnd5JJOw",
        "title": "Rick Astley - Videos",
        "channel": "Rick Astley",
        "channel_follower_count": 3500000,
        "playlist_count": 10,
        "_type": "playlist"
    }"#;

    #[test]
    fn classifies_video_info() {
        let value: Value = serde_json::from_str(VIDEO_INFO).unwrap();
        match classify_info(&value).unwrap() {
            Metadata::Video(video) => {
                assert_eq!(video.id, "dQw4w9WgXcQ");
                assert_eq!(video.height, Some(1080));
            }
            other => panic!("expected video, got {other:?}"),
        }
    }

    #[test]
    fn classifies_playlist_info() {
        let value: Value = serde_json::from_str(PLAYLIST_INFO).unwrap();
        match classify_info(&value).unwrap() {
            Metadata::Playlist(playlist) => {
                assert_eq!(playlist.title, "Best Music Videos");
                assert_eq!(playlist.item_count, 25);
            }
            other => panic!("expected playlist, got {other:?}"),
        }
    }

    #[test]
    fn classifies_channel_and_strips_suffix() {
        let value: Value = serde_json::from_str(CHANNEL_INFO).unwrap();
        match classify_info(&value).unwrap() {
            Metadata::Channel(channel) => {
                assert_eq!(channel.channel, "Rick Astley");
                assert_eq!(channel.playlist_count, 10);
            }
            other => panic!("expected channel, got {other:?}"),
        }
    }

    #[test]
    fn channel_name_falls_back_to_stripped_title() {
        let value = json!({
            "_type": "playlist",
            "title": "Rick Astley - Videos"
        });
        match classify_info(&value).unwrap() {
            Metadata::Channel(channel) => assert_eq!(channel.channel, "Rick Astley"),
            other => panic!("expected channel, got {other:?}"),
        }
    }

    #[test]
    fn enrich_playlist_builds_items_and_sums_views() {
        let mut playlist = PlaylistMetadata {
            id: "pl".into(),
            title: "Mix".into(),
            item_count: 2,
            ..Default::default()
        };
        let detailed = json!({
            "entries": [
                {
                    "id": "video1",
                    "title": "Video 1",
                    "duration": 125,
                    "view_count": 100,
                    "thumbnails": [
                        {"url": "https://img/low.jpg"},
                        {"url": "https://img/high.jpg"}
                    ]
                },
                {"id": "video2", "title": "Video 2", "duration": 3725, "view_count": 50}
            ]
        });

        enrich_playlist(&mut playlist, &detailed).unwrap();
        assert_eq!(playlist.items.len(), 2);
        assert_eq!(playlist.item_count, 2);
        assert_eq!(playlist.view_count, Some(150));
        assert_eq!(playlist.items[0].duration_string.as_deref(), Some("2:05"));
        assert_eq!(playlist.items[1].duration_string.as_deref(), Some("1:02:05"));
        assert_eq!(
            playlist.items[0].thumbnail.as_deref(),
            Some("https://img/high.jpg")
        );
    }

    #[test]
    fn enrich_channel_aggregates_views_and_storage() {
        let mut channel = ChannelMetadata {
            id: "ch".into(),
            channel: "Test".into(),
            ..Default::default()
        };
        let entries: Vec<Value> = (0..12)
            .map(|i| {
                json!({
                    "id": format!("v{i}"),
                    "title": format!("Video {i}"),
                    "view_count": 10,
                    "filesize_approx": 1000
                })
            })
            .collect();
        let detailed = json!({ "entries": entries });

        enrich_channel(&mut channel, &detailed).unwrap();
        assert_eq!(channel.video_count, Some(12));
        assert_eq!(channel.recent_videos.len(), 10);
        assert_eq!(channel.total_views, Some(120));
        assert_eq!(channel.total_storage, Some(12000));
    }

    #[test]
    fn enrich_without_entries_is_an_error() {
        let mut playlist = PlaylistMetadata::default();
        assert!(enrich_playlist(&mut playlist, &json!({})).is_err());
    }

    /// End-to-end against a stub downloader that announces a pre-written
    /// info file, the way yt-dlp does.
    #[tokio::test]
    async fn extract_runs_stub_downloader_and_stores_video_metadata() {
        let dir = tempdir().unwrap();
        let info_path = dir.path().join("video.info.json");
        std::fs::write(&info_path, VIDEO_INFO).unwrap();

        let stub = dir.path().join("yt-dlp-stub");
        std::fs::write(
            &stub,
            format!(
                "#!/bin/sh\necho \"[info] Writing video metadata as JSON to: {}\"\n",
                info_path.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(
            SqliteStore::open(&dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let hub = EventHub::new();
        tokio::spawn(Arc::clone(&hub).run());

        let job = Job::new("job-1", "https://youtube.com/watch?v=dQw4w9WgXcQ");
        store.create(&job).await.unwrap();

        let extractor = MetadataExtractor::new(
            stub,
            Arc::clone(&store) as Arc<dyn JobRepository>,
            Arc::clone(&hub),
        );
        let metadata = extractor
            .extract(&job, "/tmp/%(uploader)s/%(title)s")
            .await
            .unwrap();

        assert_eq!(metadata.kind(), "video");
        let stored = store.get_job_with_metadata("job-1").await.unwrap().unwrap();
        match stored.metadata {
            Some(Metadata::Video(video)) => assert_eq!(video.id, "dQw4w9WgXcQ"),
            other => panic!("expected stored video metadata, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn extract_fails_when_no_info_path_announced() {
        let dir = tempdir().unwrap();
        let stub = dir.path().join("yt-dlp-stub");
        std::fs::write(&stub, "#!/bin/sh\necho \"nothing useful\"\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = Arc::new(
            SqliteStore::open(&dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let hub = EventHub::new();
        tokio::spawn(Arc::clone(&hub).run());

        let extractor =
            MetadataExtractor::new(stub, Arc::clone(&store) as Arc<dyn JobRepository>, hub);
        let job = Job::new("job-1", "https://youtube.com/watch?v=missing");
        assert!(
            extractor
                .extract(&job, "/tmp/%(uploader)s/%(title)s")
                .await
                .is_err()
        );
    }
}
