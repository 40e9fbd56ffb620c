//! Line-by-line parser that turns yt-dlp output into a monotonic progress
//! state.
//!
//! The downloader is invoked with a structured `--progress-template` so every
//! progress emission is one self-identifying line carrying the video id,
//! format, codecs and percentage. Everything else (destinations, playlist
//! markers, merger lines, retries, errors) arrives as free-form text that the
//! patterns below classify.
//!
//! The tracker is a pure state machine: [`ProgressTracker::process_line`]
//! returns the update to broadcast, or `None` when the line changed nothing
//! worth emitting or the 100 ms throttle suppressed it. The caller owns
//! broadcasting and persistence, which keeps per-job updates totally ordered.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{DownloadPhase, JobType, ProgressUpdate};

/// A separate video stream is credited with this share of an item.
const VIDEO_STREAM_SHARE: f64 = 0.80;
/// The audio stream fills the remainder on top of the saved video base.
const AUDIO_STREAM_SHARE: f64 = 0.20;
/// Assumed base when audio arrives without a preceding video stream.
const DEFAULT_VIDEO_BASE: f64 = 80.0;
/// Item progress while the merger is running.
const MERGE_PROGRESS: f64 = 95.0;
/// Single videos stay below this until the merger has been observed.
const SINGLE_VIDEO_CAP: f64 = 99.0;
/// yt-dlp format codes below this are audio-only formats.
const AUDIO_FORMAT_CODE_LIMIT: u32 = 300;
/// Minimum gap between two emitted updates.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);
/// A download retrying longer than this without progress is stuck.
const STUCK_AFTER: Duration = Duration::from_secs(60);

/// One line of the structured progress template:
/// `[total][index][id][title][format_id][format_note][vcodec][acodec]prog:[dl/total][pct%][speed][eta]`
static PROGRESS_TEMPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[(\d+|NA)\]\[(\d+|NA)\]\[([^\]]*)\]\[([^\]]*)\]\[([^\]]*)\]\[([^\]]*)\]\[([^\]]*)\]\[([^\]]*)\]prog:\[([^/\]]*)/([^\]]*)\]\[\s*([0-9.]+|NA)%?\s*\]\[([^\]]*)\]\[([^\]]*)\]",
    )
    .expect("progress template pattern")
});

static STREAM_DESTINATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\] Destination: .+\.f(\d+)\.(mp4|webm|m4a)$")
        .expect("destination pattern")
});

static PLAYLIST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\] Downloading item (\d+) of (\d+)").expect("playlist item pattern")
});

static PLAYLIST_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\] Downloading playlist: (.+)").expect("playlist start pattern")
});

static PLAYLIST_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\] Finished downloading playlist:").expect("playlist end pattern")
});

static METADATA_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r": Downloading (webpage|tv client config|.* API JSON|playlist metadata)")
        .expect("metadata marker pattern")
});

static MERGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[Merger\] Merging formats into").expect("merger pattern"));

static ITEM_COMPLETE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Deleting original file|Finished downloading|has already been downloaded|has already been recorded in archive",
    )
    .expect("item complete pattern")
});

static RETRY_FRAGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Retrying fragment \d+ \((\d+)/(\d+)\)").expect("retry fragment pattern")
});

static HTTP_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"HTTP Error (\d+): (.+?)\.?\s*(?:Retrying|$)").expect("http error pattern"));

static SKIP_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"fragment not found; Skipping fragment").expect("skip pattern"));

/// What kind of content this download turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Video,
    Playlist,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Video,
    Audio,
}

/// In-memory state for one download run, owned by its tracker.
#[derive(Debug)]
pub struct ProgressState {
    pub job_id: String,
    pub job_type: JobType,
    pub content_type: ContentType,
    pub phase: DownloadPhase,
    pub current_item: usize,
    pub total_items: usize,
    pub items_completed: usize,
    /// Progress of the item currently downloading, 0..=100.
    pub current_progress: f64,
    pub overall_progress: f64,
    /// Saved scaled video-stream progress per video id, so the audio stream
    /// can stack on top of it.
    pub video_progress: HashMap<String, f64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry: Option<Instant>,
    pub retry_error: Option<String>,
    pub stuck: bool,
    pub has_error: bool,
    pub warnings: Vec<String>,
    merger_seen: bool,
}

impl ProgressState {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            job_type: JobType::Video,
            content_type: ContentType::Video,
            phase: DownloadPhase::Metadata,
            current_item: 1,
            total_items: 1,
            items_completed: 0,
            current_progress: 0.0,
            overall_progress: 0.0,
            video_progress: HashMap::new(),
            retry_count: 0,
            max_retries: 0,
            last_retry: None,
            retry_error: None,
            stuck: false,
            has_error: false,
            warnings: Vec::new(),
            merger_seen: false,
        }
    }
}

/// Per-download state machine. Feed it every line from both the child's
/// stdout and stderr; it hands back throttled updates for the hub.
pub struct ProgressTracker {
    state: ProgressState,
    last_emit: Option<Instant>,
    last_emitted: Option<(f64, DownloadPhase)>,
}

impl ProgressTracker {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            state: ProgressState::new(job_id.into()),
            last_emit: None,
            last_emitted: None,
        }
    }

    /// Seeds the item count known from metadata (playlists and channels).
    pub fn with_total_items(mut self, total: usize) -> Self {
        self.state.total_items = total.max(1);
        if self.state.total_items > 1 {
            self.state.content_type = ContentType::Playlist;
        }
        self
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.state.content_type = content_type;
        self
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn is_stuck(&self) -> bool {
        self.state.stuck
    }

    pub fn has_error(&self) -> bool {
        self.state.has_error
    }

    pub fn warnings(&self) -> &[String] {
        &self.state.warnings
    }

    /// Classifies one output line and folds it into the state. Returns the
    /// update to broadcast, if any survives the throttle.
    pub fn process_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        self.check_stuck();
        if self.state.stuck {
            return None;
        }

        if let Some(caps) = PROGRESS_TEMPLATE.captures(line) {
            self.reset_retries();
            self.handle_template(&caps);
            return self.emit(false);
        }

        if let Some(caps) = STREAM_DESTINATION.captures(line) {
            self.reset_retries();
            self.handle_destination(&caps);
            return self.emit(false);
        }

        if let Some(caps) = PLAYLIST_ITEM.captures(line) {
            self.reset_retries();
            self.handle_playlist_item(&caps);
            return self.emit(false);
        }

        if PLAYLIST_END.is_match(line) {
            self.reset_retries();
            self.state.items_completed = self.state.total_items;
            self.state.current_item = self.state.total_items;
            self.state.current_progress = 100.0;
            self.state.phase = DownloadPhase::Complete;
            self.state.overall_progress = 100.0;
            return self.emit(true);
        }

        if let Some(caps) = PLAYLIST_START.captures(line) {
            self.reset_retries();
            let title = caps.get(1).map_or("", |m| m.as_str());
            self.state.content_type = if is_channel_title(title) {
                ContentType::Channel
            } else {
                ContentType::Playlist
            };
            return None;
        }

        if METADATA_MARKER.is_match(line) {
            self.reset_retries();
            if matches!(
                self.state.phase,
                DownloadPhase::Metadata | DownloadPhase::Complete
            ) {
                self.state.phase = DownloadPhase::Metadata;
            }
            return None;
        }

        if MERGER.is_match(line) {
            self.reset_retries();
            self.state.merger_seen = true;
            self.state.phase = DownloadPhase::Merging;
            self.state.current_progress = self.state.current_progress.max(MERGE_PROGRESS);
            self.recalculate_overall();
            return self.emit(false);
        }

        if ITEM_COMPLETE.is_match(line) {
            self.reset_retries();
            if self.state.phase == DownloadPhase::Complete
                && self.state.overall_progress >= 100.0
            {
                return None;
            }
            self.complete_current_item();
            return self.emit(true);
        }

        if SKIP_FRAGMENT.is_match(line) {
            // The failing fragment is behind us; retry bookkeeping resets.
            self.reset_retries();
            return None;
        }

        // ERROR:-prefixed lines are terminal even when they carry an HTTP
        // code that would otherwise read as a retry marker.
        if line.starts_with("ERROR:") || line.contains("The downloaded file is empty") {
            if !self.state.warnings.iter().any(|warning| warning == line) {
                self.state.warnings.push(line.to_string());
            }
            self.state.has_error = true;
            return self.emit(false);
        }

        if RETRY_FRAGMENT.is_match(line) || HTTP_ERROR.is_match(line) {
            self.handle_retry(line);
            return self.emit(false);
        }

        self.reset_retries();
        None
    }

    /// EOF handling. A clean run is forced to 100 %; a run that logged
    /// errors or got stuck never claims completion.
    pub fn finalize(&mut self) -> Option<ProgressUpdate> {
        if self.state.has_error || self.state.stuck {
            return None;
        }
        if self.last_emitted == Some((100.0, DownloadPhase::Complete)) {
            return None;
        }
        self.state.phase = DownloadPhase::Complete;
        self.state.current_progress = 100.0;
        self.state.items_completed = self.state.total_items;
        self.state.overall_progress = 100.0;
        self.emit(true)
    }

    fn check_stuck(&mut self) {
        if self.state.stuck {
            return;
        }
        if let Some(last_retry) = self.state.last_retry
            && last_retry.elapsed() > STUCK_AFTER
        {
            self.state.stuck = true;
            let detail = self
                .state
                .retry_error
                .clone()
                .unwrap_or_else(|| "no further output".to_string());
            self.state.warnings.push(format!(
                "download stalled: retrying for over {}s ({detail})",
                STUCK_AFTER.as_secs()
            ));
        }
    }

    fn handle_template(&mut self, caps: &regex::Captures<'_>) {
        if let Some(total) = parse_counter(caps.get(1))
            && total > 0
        {
            self.state.total_items = total;
        }
        if let Some(index) = parse_counter(caps.get(2))
            && index > 0
        {
            if index > self.state.current_item {
                self.state.items_completed = self.state.items_completed.max(index - 1);
                self.state.current_progress = 0.0;
            }
            self.state.current_item = index;
        }

        let video_id = caps.get(3).map_or("", |m| m.as_str()).to_string();
        let format_id = caps.get(5).map_or("", |m| m.as_str());
        let vcodec = caps.get(7).map_or("", |m| m.as_str());
        let acodec = caps.get(8).map_or("", |m| m.as_str());
        let Some(percent) = caps
            .get(11)
            .map(|m| m.as_str())
            .filter(|raw| *raw != "NA")
            .and_then(|raw| raw.parse::<f64>().ok())
        else {
            return;
        };
        let percent = percent.clamp(0.0, 100.0);

        match classify_stream(vcodec, acodec, format_id) {
            StreamKind::Video => {
                self.state.phase = DownloadPhase::Video;
                self.state.job_type = JobType::Video;
                let scaled = percent * VIDEO_STREAM_SHARE;
                let base = self
                    .state
                    .video_progress
                    .entry(video_id)
                    .or_insert(0.0);
                *base = base.max(scaled);
                self.state.current_progress = self.state.current_progress.max(scaled);
            }
            StreamKind::Audio => {
                self.state.phase = DownloadPhase::Audio;
                self.state.job_type = JobType::Audio;
                let base = self
                    .state
                    .video_progress
                    .get(&video_id)
                    .copied()
                    .unwrap_or(DEFAULT_VIDEO_BASE);
                let combined = base + percent * AUDIO_STREAM_SHARE;
                self.state.current_progress = self.state.current_progress.max(combined);
            }
        }
        self.recalculate_overall();
    }

    fn handle_destination(&mut self, caps: &regex::Captures<'_>) {
        let format_code: u32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let extension = caps.get(2).map_or("", |m| m.as_str());

        let kind = match extension {
            "webm" | "m4a" => StreamKind::Audio,
            "mp4" => StreamKind::Video,
            _ if format_code >= AUDIO_FORMAT_CODE_LIMIT => StreamKind::Video,
            _ => StreamKind::Audio,
        };
        match kind {
            StreamKind::Video => {
                self.state.phase = DownloadPhase::Video;
                self.state.job_type = JobType::Video;
            }
            StreamKind::Audio => {
                self.state.phase = DownloadPhase::Audio;
                self.state.job_type = JobType::Audio;
            }
        }
    }

    fn handle_playlist_item(&mut self, caps: &regex::Captures<'_>) {
        let current: usize = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(self.state.current_item);
        let total: usize = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(self.state.total_items);

        if self.state.content_type == ContentType::Video {
            self.state.content_type = ContentType::Playlist;
        }
        self.state.current_item = current.max(1);
        self.state.total_items = total.max(1);
        self.state.items_completed = self.state.items_completed.max(current.saturating_sub(1));
        self.state.current_progress = 0.0;
        self.recalculate_overall();
    }

    fn complete_current_item(&mut self) {
        self.state.items_completed = self
            .state
            .items_completed
            .max(self.state.current_item.max(1));
        self.state.current_progress = 100.0;
        self.state.phase = DownloadPhase::Complete;
        if self.state.items_completed >= self.state.total_items {
            self.state.overall_progress = 100.0;
        } else {
            let done = (self.state.items_completed as f64 * 100.0) / self.state.total_items as f64;
            self.state.overall_progress = self.state.overall_progress.max(done);
        }
    }

    fn recalculate_overall(&mut self) {
        let computed = if self.state.total_items <= 1 {
            let mut progress = self.state.current_progress;
            if !self.state.merger_seen && progress > SINGLE_VIDEO_CAP {
                progress = SINGLE_VIDEO_CAP;
            }
            progress
        } else {
            (self.state.items_completed as f64 * 100.0 + self.state.current_progress)
                / self.state.total_items as f64
        };
        // Emitted progress never goes backwards within a run.
        self.state.overall_progress = self
            .state
            .overall_progress
            .max(computed.clamp(0.0, 100.0))
            .min(100.0);
    }

    fn handle_retry(&mut self, line: &str) {
        if let Some(caps) = RETRY_FRAGMENT.captures(line) {
            if let Some(count) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
                self.state.retry_count = self.state.retry_count.max(count);
            }
            if let Some(max) = caps.get(2).and_then(|m| m.as_str().parse().ok()) {
                self.state.max_retries = max;
            }
        } else {
            self.state.retry_count += 1;
        }
        if let Some(caps) = HTTP_ERROR.captures(line) {
            let code = caps.get(1).map_or("", |m| m.as_str());
            let message = caps.get(2).map_or("", |m| m.as_str());
            self.state.retry_error = Some(format!("HTTP Error {code}: {message}"));
        }
        if self.state.last_retry.is_none() {
            self.state.last_retry = Some(Instant::now());
        }
    }

    fn reset_retries(&mut self) {
        if self.state.retry_count > 0 || self.state.last_retry.is_some() {
            self.state.retry_count = 0;
            self.state.max_retries = 0;
            self.state.last_retry = None;
            self.state.retry_error = None;
        }
    }

    fn emit(&mut self, force: bool) -> Option<ProgressUpdate> {
        let due = force
            || self
                .last_emit
                .is_none_or(|last| last.elapsed() >= BROADCAST_INTERVAL);
        if !due {
            return None;
        }
        self.last_emit = Some(Instant::now());
        self.last_emitted = Some((self.state.overall_progress, self.state.phase));
        Some(self.snapshot())
    }

    fn snapshot(&self) -> ProgressUpdate {
        ProgressUpdate {
            job_id: self.state.job_id.clone(),
            job_type: self.state.job_type,
            status: None,
            current_item: self.state.current_item,
            total_items: self.state.total_items,
            progress: self.state.overall_progress,
            current_video_progress: self.state.current_progress.clamp(0.0, 100.0),
            download_phase: self.state.phase,
            is_retrying: self.state.retry_count > 0,
            retry_count: self.state.retry_count,
            max_retries: self.state.max_retries,
            retry_error: self.state.retry_error.clone(),
            warnings: self.state.warnings.clone(),
        }
    }
}

fn parse_counter(group: Option<regex::Match<'_>>) -> Option<usize> {
    group
        .map(|m| m.as_str())
        .filter(|raw| *raw != "NA")
        .and_then(|raw| raw.parse().ok())
}

fn codec_present(codec: &str) -> bool {
    !codec.is_empty() && codec != "none" && codec != "NA"
}

fn classify_stream(vcodec: &str, acodec: &str, format_id: &str) -> StreamKind {
    let has_video = codec_present(vcodec);
    let has_audio = codec_present(acodec);
    match (has_video, has_audio) {
        (true, false) => StreamKind::Video,
        (false, true) => StreamKind::Audio,
        // Combined formats carry both codecs; treated as the video stream.
        (true, true) => StreamKind::Video,
        (false, false) => match format_id.parse::<u32>() {
            Ok(code) if code < AUDIO_FORMAT_CODE_LIMIT => StreamKind::Audio,
            _ => StreamKind::Video,
        },
    }
}

fn is_channel_title(title: &str) -> bool {
    title.ends_with(" - Videos") || (title.contains('@') && title.contains(':'))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds lines through a tracker with the throttle opened between lines,
    /// collecting every emitted update.
    fn run_lines(tracker: &mut ProgressTracker, lines: &[&str]) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        for line in lines {
            open_throttle(tracker);
            if let Some(update) = tracker.process_line(line) {
                updates.push(update);
            }
        }
        updates
    }

    fn open_throttle(tracker: &mut ProgressTracker) {
        tracker.last_emit = tracker
            .last_emit
            .map(|last| last - BROADCAST_INTERVAL * 2);
    }

    const SINGLE_VIDEO_LINES: &[&str] = &[
        "[youtube] Extracting URL: https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "[youtube] dQw4w9WgXcQ: Downloading webpage",
        "[youtube] dQw4w9WgXcQ: Downloading tv client config",
        "[download] Destination: /downloads/Rick Astley/Never Gonna Give You Up [dQw4w9WgXcQ].f401.mp4",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][401][1080p][avc1][none]prog:[1048576/20971520][   5.0%][2.5MiB/s][00:08]",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][401][1080p][avc1][none]prog:[5242880/20971520][  25.0%][2.8MiB/s][00:06]",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][401][1080p][avc1][none]prog:[10485760/20971520][  50.0%][3.0MiB/s][00:04]",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][401][1080p][avc1][none]prog:[20971520/20971520][ 100.0%][3.3MiB/s][00:00]",
        "[download] Destination: /downloads/Rick Astley/Never Gonna Give You Up [dQw4w9WgXcQ].f251.webm",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][251][opus][none][opus]prog:[524288/5242880][  10.0%][1.2MiB/s][00:04]",
        "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][251][opus][none][opus]prog:[5242880/5242880][ 100.0%][1.6MiB/s][00:00]",
        "[Merger] Merging formats into \"/downloads/Rick Astley/Never Gonna Give You Up [dQw4w9WgXcQ].mp4\"",
        "Deleting original file /downloads/Rick Astley/Never Gonna Give You Up [dQw4w9WgXcQ].f401.mp4",
    ];

    #[test]
    fn new_tracker_starts_in_metadata_phase() {
        let tracker = ProgressTracker::new("job-1");
        assert_eq!(tracker.state().phase, DownloadPhase::Metadata);
        assert_eq!(tracker.state().total_items, 1);
        assert_eq!(tracker.state().current_item, 1);
        assert_eq!(tracker.state().overall_progress, 0.0);
    }

    #[test]
    fn template_pattern_matches_structured_lines_only() {
        assert!(PROGRESS_TEMPLATE.is_match(
            "[1][NA][dQw4w9WgXcQ][Never Gonna Give You Up][401][1080p][avc1][none]prog:[1048576/10485760][  10.0%][1.5MiB/s][00:06]"
        ));
        assert!(PROGRESS_TEMPLATE.is_match(
            "[3][2][video2][Video 2][401][1080p][avc1][none]prog:[10485760/20971520][  50.0%][3.0MiB/s][00:04]"
        ));
        assert!(!PROGRESS_TEMPLATE.is_match("[download] Downloading item 1 of 3"));
        assert!(!PROGRESS_TEMPLATE.is_match(
            "[youtube] Extracting URL: https://www.youtube.com/watch?v=test"
        ));
    }

    #[test]
    fn video_stream_scales_to_eighty_percent() {
        let mut tracker = ProgressTracker::new("job-1");
        let update = tracker
            .process_line(
                "[1][NA][testID][Test Video][401][1080p][avc1][none]prog:[5242880/10485760][  50.0%][1.5MiB/s][00:05]",
            )
            .expect("update emitted");
        assert_eq!(update.download_phase, DownloadPhase::Video);
        assert!((update.progress - 40.0).abs() < 0.01);
        assert_eq!(tracker.state().video_progress.get("testID"), Some(&40.0));
    }

    #[test]
    fn audio_stream_stacks_on_saved_video_base() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.state.video_progress.insert("testID".into(), 80.0);
        let update = tracker
            .process_line(
                "[1][NA][testID][Test Video][251][opus][none][opus]prog:[2621440/5242880][  50.0%][800KiB/s][00:03]",
            )
            .expect("update emitted");
        assert_eq!(update.download_phase, DownloadPhase::Audio);
        assert!((update.progress - 90.0).abs() < 0.01);
    }

    #[test]
    fn audio_without_video_assumes_default_base() {
        let mut tracker = ProgressTracker::new("job-1");
        let update = tracker
            .process_line(
                "[1][NA][soloAudio][Test][251][opus][none][opus]prog:[100/200][  50.0%][1MiB/s][00:01]",
            )
            .expect("update emitted");
        assert!((update.progress - 90.0).abs() < 0.01);
    }

    // Combined formats (both codecs present) count as the video stream.
    #[test]
    fn combined_format_is_treated_as_video() {
        let mut tracker = ProgressTracker::new("job-1");
        let update = tracker
            .process_line(
                "[1][NA][comb][Test][22][720p][avc1][mp4a]prog:[100/200][  50.0%][1MiB/s][00:01]",
            )
            .expect("update emitted");
        assert_eq!(update.download_phase, DownloadPhase::Video);
        assert!((update.progress - 40.0).abs() < 0.01);
    }

    #[test]
    fn destination_line_disambiguates_stream_kind() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("[download] Destination: /p/video [id].f401.mp4");
        assert_eq!(tracker.state().phase, DownloadPhase::Video);

        open_throttle(&mut tracker);
        tracker.process_line("[download] Destination: /p/audio [id].f251.webm");
        assert_eq!(tracker.state().phase, DownloadPhase::Audio);
        assert_eq!(tracker.state().job_type, JobType::Audio);
    }

    #[test]
    fn merger_line_sets_merging_phase() {
        let mut tracker = ProgressTracker::new("job-1");
        let update = tracker
            .process_line("[Merger] Merging formats into \"video.mp4\"")
            .expect("update emitted");
        assert_eq!(update.download_phase, DownloadPhase::Merging);
        assert!((update.current_video_progress - MERGE_PROGRESS).abs() < 0.01);
    }

    #[test]
    fn playlist_item_marker_advances_counters() {
        let mut tracker = ProgressTracker::new("job-1").with_total_items(10);
        let update = tracker
            .process_line("[download] Downloading item 3 of 10")
            .expect("update emitted");
        assert_eq!(update.current_item, 3);
        assert_eq!(update.total_items, 10);
        assert_eq!(tracker.state().items_completed, 2);
        assert_eq!(tracker.state().current_progress, 0.0);
        assert_eq!(tracker.state().content_type, ContentType::Playlist);
    }

    #[test]
    fn playlist_start_title_detects_channels() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("[download] Downloading playlist: My Awesome Playlist");
        assert_eq!(tracker.state().content_type, ContentType::Playlist);

        let mut tracker = ProgressTracker::new("job-2");
        tracker.process_line("[download] Downloading playlist: TestChannel - Videos");
        assert_eq!(tracker.state().content_type, ContentType::Channel);
    }

    #[test]
    fn playlist_arithmetic_matches_formula() {
        let mut tracker = ProgressTracker::new("job-1").with_total_items(5);
        tracker.state.items_completed = 1;
        tracker.state.current_item = 2;

        let update = tracker
            .process_line(
                "[5][2][video2][Video 2][401][1080p][avc1][none]prog:[1/2][  50.0%][1MiB/s][00:01]",
            )
            .expect("update emitted");
        // (100 * 1 + 50 * 0.8) / 5
        assert!((update.progress - 28.0).abs() < 0.01);
    }

    #[test]
    fn item_completion_caps_overall_at_whole_items() {
        let mut tracker = ProgressTracker::new("job-1").with_total_items(5);
        tracker.state.current_item = 1;
        tracker.process_line("Deleting original file /p/video1.f401.mp4");
        assert_eq!(tracker.state().items_completed, 1);
        assert_eq!(tracker.state().phase, DownloadPhase::Complete);
        assert!((tracker.state().overall_progress - 20.0).abs() < 0.01);

        tracker.state.current_item = 5;
        tracker.state.items_completed = 4;
        open_throttle(&mut tracker);
        let update = tracker
            .process_line("Deleting original file /p/video5.f401.mp4")
            .expect("forced completion update");
        assert_eq!(update.progress, 100.0);
    }

    #[test]
    fn single_video_run_emits_monotonic_bounded_progress() {
        let mut tracker = ProgressTracker::new("job-1");
        let updates = run_lines(&mut tracker, SINGLE_VIDEO_LINES);
        assert!(!updates.is_empty());

        let mut previous = 0.0;
        for update in &updates {
            assert!(update.progress >= previous, "progress regressed");
            assert!((0.0..=100.0).contains(&update.progress));
            assert!((0.0..=100.0).contains(&update.current_video_progress));
            previous = update.progress;
        }

        let last = updates.last().unwrap();
        assert_eq!(last.progress, 100.0);
        assert_eq!(last.download_phase, DownloadPhase::Complete);
        assert!(tracker.finalize().is_none(), "completion already emitted");
    }

    #[test]
    fn single_video_never_reaches_100_before_merger() {
        let mut tracker = ProgressTracker::new("job-1");
        let merger_index = SINGLE_VIDEO_LINES
            .iter()
            .position(|line| line.starts_with("[Merger]"))
            .unwrap();
        let updates = run_lines(&mut tracker, &SINGLE_VIDEO_LINES[..merger_index]);
        for update in updates {
            assert!(
                update.progress < 100.0,
                "hit 100% before the merger: {}",
                update.progress
            );
        }
        assert!(tracker.state().overall_progress <= SINGLE_VIDEO_CAP);
    }

    #[test]
    fn already_downloaded_single_video_completes_in_one_update() {
        let mut tracker = ProgressTracker::new("job-1");
        let update = tracker
            .process_line(
                "[download] /downloads/Rick Astley/Never Gonna Give You Up.mp4 has already been downloaded",
            )
            .expect("completion update");
        assert_eq!(update.progress, 100.0);
        assert_eq!(update.download_phase, DownloadPhase::Complete);
        assert!(update.warnings.is_empty());
        assert!(tracker.finalize().is_none());
    }

    #[test]
    fn archive_recorded_line_counts_item_complete() {
        let mut tracker = ProgressTracker::new("job-1").with_total_items(3);
        tracker.state.current_item = 3;
        tracker.state.items_completed = 2;
        let update = tracker
            .process_line("[download] video3: video3 has already been recorded in archive")
            .expect("completion update");
        assert_eq!(update.progress, 100.0);
    }

    #[test]
    fn playlist_fixture_links_three_items() {
        let lines: &[&str] = &[
            "[youtube:tab] Extracting URL: https://www.youtube.com/playlist?list=PLtest",
            "[download] Downloading playlist: Best Music Videos",
            "[download] Downloading item 1 of 3",
            "[download] Destination: /downloads/Channel/Video 1 [video1].f401.mp4",
            "[3][1][video1][Video 1][401][1080p][avc1][none]prog:[10485760/20971520][  50.0%][3.0MiB/s][00:04]",
            "[3][1][video1][Video 1][401][1080p][avc1][none]prog:[20971520/20971520][ 100.0%][3.3MiB/s][00:00]",
            "[download] Downloading item 2 of 3",
            "[3][2][video2][Video 2][401][1080p][avc1][none]prog:[10485760/20971520][  50.0%][3.0MiB/s][00:04]",
            "[download] Downloading item 3 of 3",
            "[youtube] video3 has already been downloaded",
        ];
        let mut tracker = ProgressTracker::new("job-1").with_total_items(3);
        let updates = run_lines(&mut tracker, lines);

        assert_eq!(tracker.state().content_type, ContentType::Playlist);
        let last = updates.last().unwrap();
        assert_eq!(last.progress, 100.0);
        assert_eq!(last.total_items, 3);

        let mut previous = 0.0;
        for update in &updates {
            assert!(update.progress >= previous);
            previous = update.progress;
        }
    }

    #[test]
    fn retry_lines_mark_retrying_without_advancing_progress() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line(
            "[1][NA][vid][Test][401][1080p][avc1][none]prog:[1/4][  25.0%][1MiB/s][00:03]",
        );
        let before = tracker.state().overall_progress;

        open_throttle(&mut tracker);
        let update = tracker
            .process_line(
                "[download] Got error: HTTP Error 429: Too Many Requests. Retrying fragment 5 (1/5)...",
            )
            .expect("retry update");
        assert!(update.is_retrying);
        assert_eq!(update.retry_count, 1);
        assert_eq!(update.max_retries, 5);
        assert_eq!(
            update.retry_error.as_deref(),
            Some("HTTP Error 429: Too Many Requests")
        );
        assert_eq!(update.progress, before);
    }

    #[test]
    fn retries_longer_than_a_minute_mark_the_job_stuck() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line(
            "[download] Got error: HTTP Error 429: Too Many Requests. Retrying fragment 5 (1/5)...",
        );
        assert!(!tracker.is_stuck());

        // Backdate the first retry past the threshold, as if 70s of identical
        // retry lines had gone by without progress.
        tracker.state.last_retry = Instant::now().checked_sub(Duration::from_secs(70));

        open_throttle(&mut tracker);
        let update = tracker.process_line(
            "[download] Got error: HTTP Error 429: Too Many Requests. Retrying fragment 5 (2/5)...",
        );
        assert!(update.is_none(), "stuck trackers stop emitting");
        assert!(tracker.is_stuck());
        assert!(!tracker.warnings().is_empty());
        assert!(tracker.finalize().is_none(), "stuck runs never claim 100%");
        assert!(tracker.state().overall_progress < 100.0);
    }

    #[test]
    fn progress_line_resets_retry_bookkeeping() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("Retrying fragment 5 (2/5)...");
        assert_eq!(tracker.state().retry_count, 2);

        open_throttle(&mut tracker);
        tracker.process_line(
            "[1][NA][vid][Test][401][1080p][avc1][none]prog:[1/4][  30.0%][1MiB/s][00:03]",
        );
        assert_eq!(tracker.state().retry_count, 0);
        assert!(tracker.state().last_retry.is_none());
    }

    #[test]
    fn skipping_a_fragment_resets_retry_bookkeeping() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("Retrying fragment 5 (2/5)...");
        tracker.process_line("[download] fragment not found; Skipping fragment 5 ...");
        assert_eq!(tracker.state().retry_count, 0);
        assert!(!tracker.is_stuck());
    }

    #[test]
    fn error_lines_become_deduplicated_warnings_and_block_completion() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("ERROR: unable to download video data: HTTP Error 403: Forbidden");
        open_throttle(&mut tracker);
        tracker.process_line("ERROR: unable to download video data: HTTP Error 403: Forbidden");
        assert_eq!(tracker.warnings().len(), 1);
        assert!(tracker.has_error());
        assert!(tracker.finalize().is_none(), "errored runs never force 100%");
    }

    #[test]
    fn empty_file_marker_counts_as_hard_error() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line("[download] The downloaded file is empty");
        assert!(tracker.has_error());
    }

    #[test]
    fn throttle_suppresses_rapid_updates_but_not_finalize() {
        let mut tracker = ProgressTracker::new("job-1");
        let first = tracker.process_line(
            "[1][NA][vid][Test][401][1080p][avc1][none]prog:[1/4][  10.0%][1MiB/s][00:03]",
        );
        assert!(first.is_some());

        // Same instant: inside the 100ms window.
        let second = tracker.process_line(
            "[1][NA][vid][Test][401][1080p][avc1][none]prog:[2/4][  20.0%][1MiB/s][00:02]",
        );
        assert!(second.is_none(), "throttle should swallow the second update");
        // State still advanced even though nothing was emitted.
        assert!((tracker.state().overall_progress - 16.0).abs() < 0.01);

        let last = tracker.finalize().expect("finalize bypasses the throttle");
        assert_eq!(last.progress, 100.0);
        assert_eq!(last.download_phase, DownloadPhase::Complete);
    }

    #[test]
    fn finalize_forces_completion_on_clean_eof() {
        let mut tracker = ProgressTracker::new("job-1");
        tracker.process_line(
            "[1][NA][vid][Test][401][1080p][avc1][none]prog:[1/2][  50.0%][1MiB/s][00:01]",
        );
        let update = tracker.finalize().expect("final update");
        assert_eq!(update.progress, 100.0);
        assert_eq!(update.download_phase, DownloadPhase::Complete);
    }
}
