//! Download orchestration: accepts submissions, owns the worker pool, and
//! sequences metadata extraction before the actual download.
//!
//! Workers pull from a bounded submission channel and run one job at a time.
//! A shared cancellation token stops the pool; workers finish (or kill) their
//! current job and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    DownloadPhase, Event, Job, JobStatus, JobType, Metadata, ProgressUpdate,
};
use crate::hub::EventHub;
use crate::metadata::MetadataExtractor;
use crate::repository::{JobRepository, SettingsRepository};
use crate::runner::DownloadRunner;

/// Submissions waiting for a worker. Overflowing this is a `queue_full`
/// error back to the caller, not a silent drop.
const SUBMISSION_QUEUE_CAPACITY: usize = 100;

/// Construction-time defaults; per-job values come from the settings
/// repository with these as the fallback.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub download_root: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub concurrency: usize,
    pub max_quality: i64,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// The orchestrator. Create with [`Service::new`], call [`Service::start`]
/// once, submit jobs, and [`Service::stop`] to drain.
pub struct Service {
    config: ServiceConfig,
    repo: Arc<dyn JobRepository>,
    settings: Arc<dyn SettingsRepository>,
    hub: Arc<EventHub>,
    extractor: MetadataExtractor,
    runner: DownloadRunner,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<Job>>>,
    cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Service {
    pub fn new(
        config: ServiceConfig,
        repo: Arc<dyn JobRepository>,
        settings: Arc<dyn SettingsRepository>,
        hub: Arc<EventHub>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(SUBMISSION_QUEUE_CAPACITY);
        let extractor = MetadataExtractor::new(
            config.ytdlp_bin.clone(),
            Arc::clone(&repo),
            Arc::clone(&hub),
        );
        let runner = DownloadRunner::new(
            config.ytdlp_bin.clone(),
            config.download_root.clone(),
            Arc::clone(&repo),
            Arc::clone(&hub),
        );
        Arc::new(Self {
            config,
            repo,
            settings,
            hub,
            extractor,
            runner,
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
            cancel: CancellationToken::new(),
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Launches the hub run loop and the worker pool.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(&self.hub).run());

        let queue = self
            .queue_rx
            .lock()
            .take()
            .expect("Service::start called twice");
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(queue));

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.concurrency.max(1) {
            let service = Arc::clone(self);
            let queue = Arc::clone(&queue);
            workers.push(tokio::spawn(async move {
                service.worker_loop(worker_id, queue).await;
            }));
        }
        tracing::info!(workers = workers.len(), "download service started");
    }

    /// Cancels the shared context and waits for every worker to drain its
    /// current job. No new work is accepted afterwards.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("download service stopped");
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        Arc::clone(&self.repo)
    }

    /// Persists the job as pending and queues it for a worker.
    ///
    /// Rejects ids that already exist and fails fast when the queue is full;
    /// neither leaves a partially-queued job behind.
    pub async fn submit(&self, mut job: Job) -> Result<()> {
        job.status = JobStatus::Pending;
        job.progress = 0.0;

        if self.repo.get_by_id(&job.id).await?.is_some() {
            bail!("duplicate job id: {}", job.id);
        }
        self.repo.create(&job).await.context("failed to create job")?;

        match self.queue_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("download queue is full")),
            Err(TrySendError::Closed(_)) => Err(anyhow!("download service is not running")),
        }
    }

    async fn worker_loop(&self, worker_id: usize, queue: SharedQueue) {
        loop {
            let job = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    job = queue.recv() => match job {
                        Some(job) => job,
                        None => return,
                    },
                }
            };

            tracing::info!(worker_id, job_id = %job.id, url = %job.url, "processing job");
            let mut job = job;
            if let Err(err) = self.process_job(&mut job).await {
                tracing::error!(worker_id, job_id = %job.id, error = %err, "job failed");
                job.status = JobStatus::Error;
                if let Err(err) = self.repo.update(&job).await {
                    tracing::error!(job_id = %job.id, error = %err, "failed to persist error status");
                }
                self.hub.broadcast(Event::Progress(error_update(&job))).await;
            }
        }
    }

    async fn process_job(&self, job: &mut Job) -> Result<()> {
        job.status = JobStatus::InProgress;
        self.repo
            .update(job)
            .await
            .context("failed to update job status")?;

        let base_path = format!(
            "{}/%(uploader)s/%(title)s",
            self.config.download_root.display()
        );

        // Downloads can succeed without up-front metadata, so extraction
        // failures log and move on.
        let metadata = match self.extractor.extract(job, &base_path).await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                tracing::warn!(job_id = %job.id, error = %err, "metadata extraction failed, continuing");
                None
            }
        };

        let (concurrency, _) = self.effective_settings().await;
        let quality = self.quality_for_job(job).await;

        match &metadata {
            Some(collection @ (Metadata::Playlist(_) | Metadata::Channel(_))) => {
                self.runner
                    .download_collection(
                        job,
                        collection,
                        &base_path,
                        concurrency,
                        quality,
                        &self.cancel,
                    )
                    .await
                    .context("download failed")?;
            }
            _ => {
                self.runner
                    .download_video(job, &base_path, concurrency, quality, &self.cancel)
                    .await
                    .context("download failed")?;
            }
        }

        job.status = JobStatus::Complete;
        job.progress = 100.0;
        self.repo
            .update(job)
            .await
            .context("failed to persist terminal state")
    }

    /// Current (concurrency, quality) from settings, or the construction
    /// defaults when the settings row cannot be read.
    async fn effective_settings(&self) -> (usize, i64) {
        match self.settings.get().await {
            Ok(settings) => (
                settings.concurrent_downloads.max(1) as usize,
                settings.download_quality,
            ),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read settings, using defaults");
                (self.config.concurrency, self.config.max_quality)
            }
        }
    }

    async fn quality_for_job(&self, job: &Job) -> i64 {
        if let Some(custom) = job.custom_quality {
            tracing::debug!(job_id = %job.id, quality = custom, "using custom quality");
            return custom;
        }
        self.effective_settings().await.1
    }
}

fn error_update(job: &Job) -> ProgressUpdate {
    ProgressUpdate {
        job_id: job.id.clone(),
        job_type: JobType::Video,
        status: Some(JobStatus::Error),
        current_item: 0,
        total_items: 0,
        progress: job.progress,
        current_video_progress: 0.0,
        download_phase: DownloadPhase::Complete,
        is_retrying: false,
        retry_count: 0,
        max_retries: 0,
        retry_error: None,
        warnings: job.warnings.clone(),
    }
}
