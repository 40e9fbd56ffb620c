//! Download execution: spawns the downloader, streams its output into a
//! [`ProgressTracker`], and reconciles playlist/channel results into child
//! jobs linked to their parent.
//!
//! Both stdout and stderr feed the same tracker from a single task, so
//! per-job updates stay totally ordered even though the two pipes interleave.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::domain::{ChannelMetadata, Event, Job, JobStatus, Metadata, PlaylistMetadata,
    ProgressUpdate, VideoMetadata};
use crate::hub::EventHub;
use crate::progress::{ContentType, ProgressTracker};
use crate::repository::JobRepository;

/// Structured template for single videos; the leading counters are NA
/// because there is exactly one item.
const SINGLE_PROGRESS_TEMPLATE: &str = "[NA][NA][%(info.id)s][%(info.title).50s][%(info.format_id)s][%(info.format_note)s][%(info.vcodec)s][%(info.acodec)s]prog:[%(progress.downloaded_bytes)s/%(progress.total_bytes)s][%(progress._percent_str)s][%(progress.speed)s][%(progress.eta)s]";

/// Playlist/channel variant carries the known item total so the parser can
/// do whole-run arithmetic.
fn collection_progress_template(total_items: usize) -> String {
    format!(
        "[{total_items}][%(info.playlist_index)s][%(info.id)s][%(info.title).50s][%(info.format_id)s][%(info.format_note)s][%(info.vcodec)s][%(info.acodec)s]prog:[%(progress.downloaded_bytes)s/%(progress.total_bytes)s][%(progress._percent_str)s][%(progress.speed)s][%(progress.eta)s]"
    )
}

/// How deep under the download root the info-file search will walk.
const INFO_SEARCH_DEPTH: usize = 8;

/// Runs the downloader for one job and keeps the repository and hub fed
/// while it executes.
pub struct DownloadRunner {
    ytdlp_bin: PathBuf,
    download_root: PathBuf,
    repo: Arc<dyn JobRepository>,
    hub: Arc<EventHub>,
}

impl DownloadRunner {
    pub fn new(
        ytdlp_bin: PathBuf,
        download_root: PathBuf,
        repo: Arc<dyn JobRepository>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            ytdlp_bin,
            download_root,
            repo,
            hub,
        }
    }

    fn base_command(
        &self,
        concurrency: usize,
        max_quality: i64,
        progress_template: &str,
        output_template: &str,
    ) -> Command {
        let mut command = Command::new(&self.ytdlp_bin);
        command
            .arg("-N")
            .arg(concurrency.to_string())
            .arg("--format")
            .arg(format!("bestvideo[height<={max_quality}]+bestaudio/best"))
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--newline")
            .arg("--progress-template")
            .arg(progress_template)
            .arg("--retries")
            .arg("3")
            .arg("--fragment-retries")
            .arg("5")
            .arg("--file-access-retries")
            .arg("2")
            .arg("--continue")
            .arg("--ignore-errors")
            .arg("--add-metadata")
            .arg("--write-info-json")
            .arg("--output")
            .arg(output_template);
        command
    }

    /// Downloads a single video and caps its stored resolution at what was
    /// actually fetched.
    pub async fn download_video(
        &self,
        job: &mut Job,
        output_template: &str,
        concurrency: usize,
        max_quality: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::info!(job_id = %job.id, quality = max_quality, concurrency, "starting video download");
        let mut command = self.base_command(
            concurrency,
            max_quality,
            SINGLE_PROGRESS_TEMPLATE,
            output_template,
        );
        command.arg(&job.url);

        let tracker = ProgressTracker::new(&job.id);
        self.drive(job, command, tracker, cancel).await?;

        if let Err(err) = self.update_downloaded_metadata(&job.id, max_quality).await {
            tracing::warn!(job_id = %job.id, error = %err, "could not update downloaded metadata");
        }
        Ok(())
    }

    /// Downloads every item of a playlist or channel, then resolves the
    /// archive file into child video jobs linked to the parent.
    pub async fn download_collection(
        &self,
        job: &mut Job,
        metadata: &Metadata,
        output_template: &str,
        concurrency: usize,
        max_quality: i64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total_items = total_items_for(metadata);
        let membership_type = match metadata {
            Metadata::Channel(_) => "channel",
            _ => "playlist",
        };
        tracing::info!(
            job_id = %job.id,
            total_items,
            membership_type,
            "starting collection download"
        );

        // The archive lives in a per-job tempdir so concurrent collection
        // jobs never share ledgers.
        let temp = tempfile::tempdir().context("creating archive tempdir")?;
        let archive_path = temp.path().join("archive.txt");

        let mut command = self.base_command(
            concurrency,
            max_quality,
            &collection_progress_template(total_items),
            output_template,
        );
        command
            .arg("--download-archive")
            .arg(&archive_path)
            .arg("--yes-playlist")
            .arg(&job.url);

        let content_type = match metadata {
            Metadata::Channel(_) => ContentType::Channel,
            _ => ContentType::Playlist,
        };
        let tracker = ProgressTracker::new(&job.id)
            .with_total_items(total_items)
            .with_content_type(content_type);
        self.drive(job, command, tracker, cancel).await?;

        let warnings = self
            .reconcile_archive(job, membership_type, &archive_path)
            .await?;
        job.warnings.extend(warnings);
        Ok(())
    }

    /// Spawns the child and pumps both pipes through the tracker until EOF.
    async fn drive(
        &self,
        job: &mut Job,
        mut command: Command,
        mut tracker: ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().context("starting downloader")?;
        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut cancelled = false;

        while stdout_open || stderr_open {
            let line = tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    // Killing the child closes both pipes, which lets the
                    // readers drain to EOF below.
                    cancelled = true;
                    let _ = child.start_kill();
                    continue;
                }
                line = stdout_lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stdout_open = false;
                        None
                    }
                },
                line = stderr_lines.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stderr_open = false;
                        None
                    }
                },
            };

            let Some(line) = line else { continue };
            tracing::debug!(job_id = %job.id, line = %line, "downloader output");
            if let Some(update) = tracker.process_line(&line) {
                self.publish(&job.id, &update).await;
            }
        }

        let status = child.wait().await.context("waiting for downloader")?;

        if cancelled {
            bail!("download cancelled");
        }
        if tracker.is_stuck() {
            merge_warnings(&mut job.warnings, tracker.warnings());
            bail!("download stuck: retried without progress for over a minute");
        }
        if tracker.has_error() {
            merge_warnings(&mut job.warnings, tracker.warnings());
            bail!("downloader reported errors");
        }
        if !status.success() {
            merge_warnings(&mut job.warnings, tracker.warnings());
            bail!("downloader exited with {status}");
        }

        if let Some(update) = tracker.finalize() {
            self.publish(&job.id, &update).await;
        }
        job.progress = 100.0;
        Ok(())
    }

    async fn publish(&self, job_id: &str, update: &ProgressUpdate) {
        if let Err(err) = self.persist_progress(job_id, update.progress).await {
            tracing::warn!(job_id, error = %err, "failed to persist job progress");
        }
        self.hub.broadcast(Event::Progress(update.clone())).await;
    }

    async fn persist_progress(&self, job_id: &str, progress: f64) -> Result<()> {
        if let Some(mut job) = self.repo.get_by_id(job_id).await? {
            job.progress = progress;
            self.repo.update(&job).await?;
        }
        Ok(())
    }

    /// Walks the archive file the downloader wrote and makes sure every
    /// fetched video exists as a job linked to the parent. Individual
    /// failures degrade to warnings; only an unreadable archive is fatal.
    async fn reconcile_archive(
        &self,
        parent: &Job,
        membership_type: &str,
        archive_path: &Path,
    ) -> Result<Vec<String>> {
        let raw = tokio::fs::read_to_string(archive_path)
            .await
            .with_context(|| format!("reading archive file {}", archive_path.display()))?;
        let entries = parse_archive(&raw);
        if entries.is_empty() {
            tracing::warn!(job_id = %parent.id, "archive file is empty, nothing to reconcile");
            return Ok(Vec::new());
        }

        let mut warnings = Vec::new();
        for (extractor, video_id) in entries {
            if let Err(err) = self
                .reconcile_one(parent, membership_type, &extractor, &video_id)
                .await
            {
                tracing::warn!(
                    job_id = %parent.id,
                    video_id = %video_id,
                    error = %err,
                    "failed to reconcile archived video"
                );
                warnings.push(format!("could not link video {video_id}: {err}"));
            }
        }
        Ok(warnings)
    }

    async fn reconcile_one(
        &self,
        parent: &Job,
        membership_type: &str,
        extractor: &str,
        video_id: &str,
    ) -> Result<()> {
        if self.repo.get_by_id(video_id).await?.is_some() {
            return self
                .repo
                .add_video_to_parent(video_id, &parent.id, membership_type)
                .await;
        }

        let info_path = find_info_file(&self.download_root, extractor, video_id)
            .ok_or_else(|| anyhow::anyhow!("no info file found"))?;
        let raw = tokio::fs::read_to_string(&info_path)
            .await
            .with_context(|| format!("reading info file {}", info_path.display()))?;
        let video: VideoMetadata = serde_json::from_str(&raw).context("parsing info file")?;

        let mut child = Job::new(
            video_id,
            format!("https://{extractor}.com/watch?v={video_id}"),
        );
        child.status = JobStatus::Complete;
        child.progress = 100.0;
        self.repo.create(&child).await?;
        self.repo
            .store_metadata(video_id, &Metadata::Video(video))
            .await?;
        self.repo
            .add_video_to_parent(video_id, &parent.id, membership_type)
            .await
    }

    /// Rewrites stored width/height to the capped values when the source was
    /// taller than the effective quality limit, keeping the aspect ratio.
    async fn update_downloaded_metadata(&self, job_id: &str, max_quality: i64) -> Result<()> {
        let Some(with_meta) = self.repo.get_job_with_metadata(job_id).await? else {
            return Ok(());
        };
        let Some(Metadata::Video(mut video)) = with_meta.metadata else {
            bail!("stored metadata is not a video");
        };
        let (Some(width), Some(height)) = (video.width, video.height) else {
            return Ok(());
        };
        if height <= max_quality || height == 0 {
            return Ok(());
        }

        let aspect = width as f64 / height as f64;
        let capped_width = (max_quality as f64 * aspect).round() as i64;
        tracing::info!(
            job_id,
            "capping stored resolution {width}x{height} -> {capped_width}x{max_quality}"
        );
        video.width = Some(capped_width);
        video.height = Some(max_quality);
        video.resolution = Some(format!("{capped_width}x{max_quality}"));
        self.repo
            .store_metadata(job_id, &Metadata::Video(video))
            .await
    }
}

fn merge_warnings(into: &mut Vec<String>, from: &[String]) {
    for warning in from {
        if !into.iter().any(|existing| existing == warning) {
            into.push(warning.clone());
        }
    }
}

/// Derives the expected item count from enriched metadata, falling back to
/// the flat counters and finally to 1 so progress math never divides by zero.
pub fn total_items_for(metadata: &Metadata) -> usize {
    let total = match metadata {
        Metadata::Playlist(PlaylistMetadata {
            items, item_count, ..
        }) => {
            if items.is_empty() {
                *item_count
            } else {
                items.len() as i64
            }
        }
        Metadata::Channel(ChannelMetadata {
            video_count,
            playlist_count,
            ..
        }) => video_count.filter(|count| *count > 0).unwrap_or(*playlist_count),
        Metadata::Video(_) => 1,
    };
    total.max(1) as usize
}

/// Parses `<extractor> <video_id>` lines, collapsing duplicates while
/// preserving first-seen order.
pub fn parse_archive(raw: &str) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((extractor, video_id)) = line.split_once(' ') else {
            tracing::warn!(line, "invalid archive line");
            continue;
        };
        let key = (extractor.to_string(), video_id.trim().to_string());
        if seen.insert(key.clone()) {
            entries.push(key);
        }
    }
    entries
}

/// Locates the info file for a downloaded video. Filename patterns win over
/// the content scan: `{extractor}-{id}.info.json`, then `{id}.info.json`,
/// then any info file whose `id` field matches.
fn find_info_file(root: &Path, extractor: &str, video_id: &str) -> Option<PathBuf> {
    let by_extractor = format!("{extractor}-{video_id}.info.json");
    let by_id = format!("{video_id}.info.json");

    let info_files: Vec<PathBuf> = WalkDir::new(root)
        .max_depth(INFO_SEARCH_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(".info.json"))
        })
        .map(|entry| entry.into_path())
        .collect();

    for pattern in [by_extractor.as_str(), by_id.as_str()] {
        if let Some(path) = info_files
            .iter()
            .find(|path| path.file_name().and_then(|name| name.to_str()) == Some(pattern))
        {
            return Some(path.clone());
        }
    }

    info_files.into_iter().find(|path| {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|value| {
                value
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string)
            })
            .is_some_and(|id| id == video_id)
    })
}
