//! Persistence layer: jobs, per-variant metadata tables, memberships and
//! settings on a local SQLite database.
//!
//! The service only ever talks to the [`JobRepository`] and
//! [`SettingsRepository`] traits; the libsql-backed implementations below are
//! wired in by the binaries. Metadata payloads are stored as JSON columns next
//! to a denormalized title so listings can sort without deserializing.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};
use once_cell::sync::Lazy;

use crate::domain::{
    ChannelMetadata, Job, JobStatus, JobWithMetadata, Metadata, PlaylistMetadata, Settings,
    VideoMetadata,
};

/// Durable store of jobs, metadata and parent/child links.
///
/// Implementations must be internally thread-safe; callers never retry on
/// failure, any I/O or constraint violation surfaces as an error.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;
    async fn update(&self, job: &Job) -> Result<()>;
    async fn get_by_id(&self, id: &str) -> Result<Option<Job>>;
    async fn get_recent(&self, limit: i64) -> Result<Vec<Job>>;
    async fn get_jobs(&self) -> Result<Vec<Job>>;
    async fn store_metadata(&self, job_id: &str, metadata: &Metadata) -> Result<()>;
    async fn get_job_with_metadata(&self, job_id: &str) -> Result<Option<JobWithMetadata>>;
    async fn get_recent_with_metadata(&self, limit: i64) -> Result<Vec<JobWithMetadata>>;
    async fn get_all_jobs_with_metadata(&self) -> Result<Vec<JobWithMetadata>>;
    async fn count_videos(&self) -> Result<i64>;
    async fn count_playlists(&self) -> Result<i64>;
    async fn count_channels(&self) -> Result<i64>;
    /// Paginated listing of one metadata variant. `content_type` must be one
    /// of `videos`, `playlists` or `channels`; unknown values are an error
    /// while invalid `sort_by`/`order` silently fall back to their defaults.
    async fn get_metadata_by_type(
        &self,
        content_type: &str,
        page: i64,
        limit: i64,
        sort_by: &str,
        order: &str,
    ) -> Result<(Vec<JobWithMetadata>, i64)>;
    /// Idempotent: inserting an existing (video, parent) pair is a no-op.
    async fn add_video_to_parent(
        &self,
        video_job_id: &str,
        parent_job_id: &str,
        membership_type: &str,
    ) -> Result<()>;
    async fn get_videos_for_parent(&self, parent_job_id: &str) -> Result<Vec<JobWithMetadata>>;
    async fn get_parents_for_video(&self, video_job_id: &str) -> Result<Vec<JobWithMetadata>>;
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    async fn get(&self) -> Result<Settings>;
    async fn update(&self, settings: &Settings) -> Result<()>;
}

/// Allowed sort columns per content type. Anything not listed here falls
/// back to `jobs.created_at`, keeping user input out of the SQL text.
static SORT_FIELDS: Lazy<HashMap<&'static str, HashMap<&'static str, &'static str>>> =
    Lazy::new(|| {
        let mut map = HashMap::new();
        map.insert(
            "videos",
            HashMap::from([
                ("created_at", "jobs.created_at"),
                ("updated_at", "jobs.updated_at"),
                ("title", "videos.title"),
            ]),
        );
        map.insert(
            "playlists",
            HashMap::from([
                ("created_at", "jobs.created_at"),
                ("updated_at", "jobs.updated_at"),
                ("title", "playlists.title"),
            ]),
        );
        map.insert(
            "channels",
            HashMap::from([
                ("created_at", "jobs.created_at"),
                ("updated_at", "jobs.updated_at"),
                ("title", "channels.name"),
            ]),
        );
        map
    });

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            status TEXT NOT NULL,
            progress REAL NOT NULL DEFAULT 0,
            custom_quality INTEGER,
            warnings_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            FOREIGN KEY(job_id) REFERENCES jobs(job_id)
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            FOREIGN KEY(job_id) REFERENCES jobs(job_id)
        );

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            FOREIGN KEY(job_id) REFERENCES jobs(job_id)
        );

        CREATE TABLE IF NOT EXISTS video_memberships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_job_id TEXT NOT NULL,
            parent_job_id TEXT NOT NULL,
            membership_type TEXT NOT NULL,
            FOREIGN KEY(video_job_id) REFERENCES jobs(job_id),
            FOREIGN KEY(parent_job_id) REFERENCES jobs(job_id),
            UNIQUE(video_job_id, parent_job_id)
        );

        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            theme TEXT NOT NULL,
            download_quality INTEGER NOT NULL,
            concurrent_downloads INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_parent ON video_memberships(parent_job_id);
        CREATE INDEX IF NOT EXISTS idx_jobs_updated ON jobs(updated_at);
        "#,
    )
    .await?;
    Ok(())
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn row_to_job(row: &Row) -> Result<Job> {
    let status_raw: String = row.get(2)?;
    let warnings_json: String = row.get(5)?;
    let created_raw: String = row.get(6)?;
    let updated_raw: String = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        url: row.get(1)?,
        status: JobStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown job status {status_raw}"))?,
        progress: row.get(3)?,
        custom_quality: row.get(4)?,
        warnings: serde_json::from_str(&warnings_json).context("parsing stored warnings")?,
        created_at: parse_time(&created_raw)?,
        updated_at: parse_time(&updated_raw)?,
    })
}

const JOB_COLUMNS: &str =
    "job_id, url, status, progress, custom_quality, warnings_json, created_at, updated_at";

fn metadata_from_json(kind: &str, raw: &str) -> Result<Metadata> {
    match kind {
        "video" => Ok(Metadata::Video(
            serde_json::from_str::<VideoMetadata>(raw).context("unmarshal video metadata")?,
        )),
        "playlist" => Ok(Metadata::Playlist(
            serde_json::from_str::<PlaylistMetadata>(raw).context("unmarshal playlist metadata")?,
        )),
        "channel" => Ok(Metadata::Channel(
            serde_json::from_str::<ChannelMetadata>(raw).context("unmarshal channel metadata")?,
        )),
        other => bail!("unknown metadata type: {other}"),
    }
}

/// Job and settings store backed by a local SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the database and provisions the
    /// expected schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    async fn metadata_for_job(&self, job_id: &str) -> Result<Option<Metadata>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT 'video' AS type, metadata_json FROM videos WHERE job_id = ?1
                UNION
                SELECT 'playlist' AS type, metadata_json FROM playlists WHERE job_id = ?1
                UNION
                SELECT 'channel' AS type, metadata_json FROM channels WHERE job_id = ?1
                LIMIT 1
                "#,
                params![job_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let kind: String = row.get(0)?;
        let raw: String = row.get(1)?;
        Ok(Some(metadata_from_json(&kind, &raw)?))
    }

    async fn with_metadata(&self, jobs: Vec<Job>) -> Result<Vec<JobWithMetadata>> {
        let mut result = Vec::with_capacity(jobs.len());
        for job in jobs {
            let metadata = match self.metadata_for_job(&job.id).await {
                Ok(metadata) => metadata,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "could not load metadata for job");
                    None
                }
            };
            result.push(JobWithMetadata { job, metadata });
        }
        Ok(result)
    }

    async fn count_table(&self, table: &str) -> Result<i64> {
        let mut rows = self
            .conn
            .query(&format!("SELECT COUNT(*) FROM {table}"), params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    async fn upsert_variant(
        &self,
        table: &str,
        title_column: &str,
        job_id: &str,
        title: &str,
        payload: String,
    ) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    r#"
                    INSERT INTO {table} (job_id, {title_column}, metadata_json)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(job_id) DO UPDATE SET
                        {title_column} = excluded.{title_column},
                        metadata_json = excluded.metadata_json
                    "#,
                ),
                params![job_id, title, payload],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for SqliteStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let warnings = serde_json::to_string(&job.warnings).context("serializing warnings")?;
        self.conn
            .execute(
                r#"
                INSERT INTO jobs (job_id, url, status, progress, custom_quality, warnings_json, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    job.id.as_str(),
                    job.url.as_str(),
                    job.status.as_str(),
                    job.progress,
                    job.custom_quality,
                    warnings,
                    format_time(job.created_at),
                    format_time(job.updated_at),
                ],
            )
            .await
            .context("create job")?;
        Ok(())
    }

    async fn update(&self, job: &Job) -> Result<()> {
        let warnings = serde_json::to_string(&job.warnings).context("serializing warnings")?;
        self.conn
            .execute(
                r#"
                UPDATE jobs
                SET status = ?1, progress = ?2, custom_quality = ?3, warnings_json = ?4, updated_at = ?5
                WHERE job_id = ?6
                "#,
                params![
                    job.status.as_str(),
                    job.progress,
                    job.custom_quality,
                    warnings,
                    format_time(Utc::now()),
                    job.id.as_str(),
                ],
            )
            .await
            .context("update job")?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_recent(&self, limit: i64) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY updated_at DESC LIMIT ?1"),
                params![limit],
            )
            .await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn get_jobs(&self) -> Result<Vec<Job>> {
        let mut rows = self
            .conn
            .query(&format!("SELECT {JOB_COLUMNS} FROM jobs"), params![])
            .await?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn store_metadata(&self, job_id: &str, metadata: &Metadata) -> Result<()> {
        match metadata {
            Metadata::Video(video) => {
                let payload = serde_json::to_string(video).context("marshal video metadata")?;
                self.upsert_variant("videos", "title", job_id, &video.title, payload)
                    .await
            }
            Metadata::Playlist(playlist) => {
                // Re-storing a playlist without items would throw away a
                // previous enrichment pass, so that overwrite is dropped.
                if playlist.items.is_empty() {
                    let mut rows = self
                        .conn
                        .query(
                            "SELECT COUNT(*) FROM playlists WHERE job_id = ?1",
                            params![job_id],
                        )
                        .await?;
                    let count: i64 = rows
                        .next()
                        .await?
                        .context("missing playlist count row")?
                        .get(0)?;
                    if count > 0 {
                        tracing::debug!(job_id, "playlist metadata has no items, keeping stored row");
                        return Ok(());
                    }
                }
                let payload =
                    serde_json::to_string(playlist).context("marshal playlist metadata")?;
                self.upsert_variant("playlists", "title", job_id, &playlist.title, payload)
                    .await
            }
            Metadata::Channel(channel) => {
                let payload = serde_json::to_string(channel).context("marshal channel metadata")?;
                self.upsert_variant("channels", "name", job_id, &channel.channel, payload)
                    .await
            }
        }
    }

    async fn get_job_with_metadata(&self, job_id: &str) -> Result<Option<JobWithMetadata>> {
        let Some(job) = self.get_by_id(job_id).await? else {
            return Ok(None);
        };
        let metadata = self.metadata_for_job(job_id).await?;
        Ok(Some(JobWithMetadata { job, metadata }))
    }

    async fn get_recent_with_metadata(&self, limit: i64) -> Result<Vec<JobWithMetadata>> {
        let jobs = self.get_recent(limit).await?;
        self.with_metadata(jobs).await
    }

    async fn get_all_jobs_with_metadata(&self) -> Result<Vec<JobWithMetadata>> {
        let jobs = self.get_jobs().await?;
        self.with_metadata(jobs).await
    }

    async fn count_videos(&self) -> Result<i64> {
        self.count_table("videos").await
    }

    async fn count_playlists(&self) -> Result<i64> {
        self.count_table("playlists").await
    }

    async fn count_channels(&self) -> Result<i64> {
        self.count_table("channels").await
    }

    async fn get_metadata_by_type(
        &self,
        content_type: &str,
        page: i64,
        limit: i64,
        sort_by: &str,
        order: &str,
    ) -> Result<(Vec<JobWithMetadata>, i64)> {
        let page = page.max(1);
        let limit = if (1..=100).contains(&limit) { limit } else { 20 };
        let offset = (page - 1) * limit;

        let (table, kind) = match content_type {
            "videos" => ("videos", "video"),
            "playlists" => ("playlists", "playlist"),
            "channels" => ("channels", "channel"),
            other => bail!("invalid content type: {other}"),
        };

        let order_direction = match order.to_ascii_lowercase().as_str() {
            "asc" => "ASC",
            _ => "DESC",
        };

        let sort_field = SORT_FIELDS
            .get(content_type)
            .and_then(|fields| fields.get(sort_by).copied())
            .unwrap_or("jobs.created_at");

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} JOIN jobs ON {table}.job_id = jobs.job_id"),
                params![],
            )
            .await?;
        let total: i64 = rows.next().await?.context("missing count row")?.get(0)?;

        let query = format!(
            r#"
            SELECT jobs.job_id, jobs.url, jobs.status, jobs.progress, jobs.custom_quality,
                   jobs.warnings_json, jobs.created_at, jobs.updated_at, {table}.metadata_json
            FROM {table}
            JOIN jobs ON {table}.job_id = jobs.job_id
            ORDER BY {sort_field} {order_direction}
            LIMIT ?1 OFFSET ?2
            "#,
        );

        let mut rows = self.conn.query(&query, params![limit, offset]).await?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            let job = row_to_job(&row)?;
            let raw: String = row.get(8)?;
            match metadata_from_json(kind, &raw) {
                Ok(metadata) => result.push(JobWithMetadata {
                    job,
                    metadata: Some(metadata),
                }),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "skipping row with bad metadata");
                }
            }
        }
        Ok((result, total))
    }

    async fn add_video_to_parent(
        &self,
        video_job_id: &str,
        parent_job_id: &str,
        membership_type: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO video_memberships (video_job_id, parent_job_id, membership_type)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(video_job_id, parent_job_id) DO NOTHING
                "#,
                params![video_job_id, parent_job_id, membership_type],
            )
            .await
            .context("insert video membership")?;
        Ok(())
    }

    async fn get_videos_for_parent(&self, parent_job_id: &str) -> Result<Vec<JobWithMetadata>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT j.job_id, j.url, j.status, j.progress, j.custom_quality,
                       j.warnings_json, j.created_at, j.updated_at, v.metadata_json
                FROM jobs j
                JOIN video_memberships vm ON j.job_id = vm.video_job_id
                JOIN videos v ON j.job_id = v.job_id
                WHERE vm.parent_job_id = ?1
                "#,
                params![parent_job_id],
            )
            .await?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            let job = row_to_job(&row)?;
            let raw: String = row.get(8)?;
            match metadata_from_json("video", &raw) {
                Ok(metadata) => result.push(JobWithMetadata {
                    job,
                    metadata: Some(metadata),
                }),
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "skipping video with bad metadata");
                }
            }
        }
        Ok(result)
    }

    async fn get_parents_for_video(&self, video_job_id: &str) -> Result<Vec<JobWithMetadata>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT j.job_id, j.url, j.status, j.progress, j.custom_quality,
                       j.warnings_json, j.created_at, j.updated_at,
                       vm.membership_type,
                       CASE
                           WHEN vm.membership_type = 'playlist' THEN p.metadata_json
                           WHEN vm.membership_type = 'channel' THEN c.metadata_json
                           ELSE NULL
                       END AS metadata_json
                FROM jobs j
                JOIN video_memberships vm ON j.job_id = vm.parent_job_id
                LEFT JOIN playlists p ON j.job_id = p.job_id AND vm.membership_type = 'playlist'
                LEFT JOIN channels c ON j.job_id = c.job_id AND vm.membership_type = 'channel'
                WHERE vm.video_job_id = ?1
                "#,
                params![video_job_id],
            )
            .await?;

        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            let job = row_to_job(&row)?;
            let membership_type: String = row.get(8)?;
            let raw: Option<String> = row.get(9)?;
            let metadata = raw.and_then(|raw| metadata_from_json(&membership_type, &raw).ok());
            result.push(JobWithMetadata { job, metadata });
        }
        Ok(result)
    }
}

#[async_trait]
impl SettingsRepository for SqliteStore {
    async fn get(&self) -> Result<Settings> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, theme, download_quality, concurrent_downloads, created_at, updated_at
                FROM settings WHERE id = 1
                "#,
                params![],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            let created_raw: String = row.get(4)?;
            let updated_raw: String = row.get(5)?;
            return Ok(Settings {
                id: row.get(0)?,
                theme: row.get(1)?,
                download_quality: row.get(2)?,
                concurrent_downloads: row.get(3)?,
                created_at: parse_time(&created_raw)?,
                updated_at: parse_time(&updated_raw)?,
            });
        }

        // First access seeds the defaults so readers never see an empty row.
        let defaults = Settings::default();
        self.conn
            .execute(
                r#"
                INSERT OR IGNORE INTO settings (id, theme, download_quality, concurrent_downloads, created_at, updated_at)
                VALUES (1, ?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    defaults.theme.as_str(),
                    defaults.download_quality,
                    defaults.concurrent_downloads,
                    format_time(defaults.created_at),
                    format_time(defaults.updated_at),
                ],
            )
            .await
            .context("seed default settings")?;
        Ok(defaults)
    }

    async fn update(&self, settings: &Settings) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE settings
                SET theme = ?1, download_quality = ?2, concurrent_downloads = ?3, updated_at = ?4
                WHERE id = 1
                "#,
                params![
                    settings.theme.as_str(),
                    settings.download_quality,
                    settings.concurrent_downloads,
                    format_time(Utc::now()),
                ],
            )
            .await
            .context("update settings")?;
        Ok(())
    }
}
