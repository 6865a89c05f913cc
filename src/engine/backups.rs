//! Scheduled backups of the SQLite database and uploaded media.
//!
//! Each cycle writes `db_<ts>.sqlite.gz` and `media_<ts>.tar.gz` into the backup
//! directory, uploads them when an artifact store is configured, then prunes local and
//! remote artifacts older than the retention period. A cycle stops at the first failing
//! step; whatever it already wrote stays on disk and is pruned by age like any other
//! artifact.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::db::{self, BackupKind};
use crate::DbPool;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{step} failed: {source}")]
    Io {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("upload failed: {0}")]
    Store(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl BackupError {
    fn io(step: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { step, source }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Remote home for backup artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, path: &Path) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    /// Credentials come from the standard AWS environment chain
    pub async fn new(bucket: String, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket,
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, key: &str, path: &Path) -> Result<()> {
        let body = aws_sdk_s3::primitives::ByteStream::from_path(path)
            .await
            .map_err(|e| BackupError::Store(e.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::Store(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| BackupError::Store(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;

            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => continuation = Some(token.to_string()),
                _ => break,
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::Store(aws_sdk_s3::error::DisplayErrorContext(e).to_string()))?;
        Ok(())
    }
}

/// When an artifact was taken, from its file name
pub fn artifact_timestamp(name: &str) -> Option<NaiveDateTime> {
    let stamp = name
        .strip_prefix("db_")
        .and_then(|rest| rest.strip_suffix(".sqlite.gz"))
        .or_else(|| {
            name.strip_prefix("media_")
                .and_then(|rest| rest.strip_suffix(".tar.gz"))
        })?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Strictly older than the retention period
pub fn is_expired(taken_at: NaiveDateTime, now: NaiveDateTime, retention_days: i64) -> bool {
    now - taken_at > ChronoDuration::days(retention_days)
}

#[derive(Debug, Default)]
pub struct BackupStats {
    pub artifacts_created: u64,
    pub artifacts_uploaded: u64,
    pub local_pruned: u64,
    pub remote_pruned: u64,
}

pub struct BackupTask {
    db: DbPool,
    config: BackupConfig,
    backup_dir: PathBuf,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl BackupTask {
    pub fn new(
        db: DbPool,
        config: BackupConfig,
        data_dir: &Path,
        store: Option<Arc<dyn ArtifactStore>>,
    ) -> Self {
        let backup_dir = if config.backup_dir.is_absolute() {
            config.backup_dir.clone()
        } else {
            data_dir.join(&config.backup_dir)
        };
        Self {
            db,
            config,
            backup_dir,
            store,
        }
    }

    pub async fn run_backup_cycle(&self) -> Result<BackupStats> {
        self.run_backup_cycle_at(Utc::now()).await
    }

    pub async fn run_backup_cycle_at(&self, now: DateTime<Utc>) -> Result<BackupStats> {
        let mut stats = BackupStats::default();
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(BackupError::io("create backup dir"))?;

        let mut artifacts = vec![(BackupKind::Database, self.snapshot_database(&stamp).await?)];
        if let Some(media) = self.archive_media(&stamp).await? {
            artifacts.push((BackupKind::Media, media));
        }
        stats.artifacts_created = artifacts.len() as u64;

        for (kind, path) in &artifacts {
            let remote_key = match &self.store {
                Some(store) => {
                    let key = self.remote_key(path);
                    store.put(&key, path).await?;
                    stats.artifacts_uploaded += 1;
                    Some(key)
                }
                None => None,
            };
            self.record(*kind, path, remote_key.as_deref()).await?;
        }

        let now_naive = now.naive_utc();
        stats.local_pruned = self.prune_local(now_naive).await?;
        stats.remote_pruned = self.prune_remote(now_naive).await?;

        info!(
            created = stats.artifacts_created,
            uploaded = stats.artifacts_uploaded,
            local_pruned = stats.local_pruned,
            remote_pruned = stats.remote_pruned,
            "Backup cycle completed"
        );
        Ok(stats)
    }

    fn remote_key(&self, path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}{}", self.config.s3_prefix, name)
    }

    async fn snapshot_database(&self, stamp: &str) -> Result<PathBuf> {
        let raw = self.backup_dir.join(format!("db_{}.sqlite", stamp));
        let gz = self.backup_dir.join(format!("db_{}.sqlite.gz", stamp));

        // VACUUM INTO gives a consistent copy while the pool stays live
        sqlx::query("VACUUM INTO ?")
            .bind(raw.to_string_lossy().into_owned())
            .execute(&self.db)
            .await?;

        let (src, dst) = (raw.clone(), gz.clone());
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut input = File::open(&src)?;
            let mut encoder = GzEncoder::new(File::create(&dst)?, Compression::default());
            std::io::copy(&mut input, &mut encoder)?;
            encoder.finish()?;
            std::fs::remove_file(&src)
        })
        .await
        .map_err(|e| BackupError::Io {
            step: "compress database",
            source: std::io::Error::other(e),
        })?
        .map_err(BackupError::io("compress database"))?;

        debug!(path = %gz.display(), "Database snapshot written");
        Ok(gz)
    }

    async fn archive_media(&self, stamp: &str) -> Result<Option<PathBuf>> {
        let media_dir = self.config.media_dir.clone();
        if !media_dir.is_dir() {
            debug!(media_dir = %media_dir.display(), "No media directory, skipping media archive");
            return Ok(None);
        }

        let archive = self.backup_dir.join(format!("media_{}.tar.gz", stamp));
        let dst = archive.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let encoder = GzEncoder::new(File::create(&dst)?, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all("media", &media_dir)?;
            builder.into_inner()?.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| BackupError::Io {
            step: "archive media",
            source: std::io::Error::other(e),
        })?
        .map_err(BackupError::io("archive media"))?;

        debug!(path = %archive.display(), "Media archive written");
        Ok(Some(archive))
    }

    async fn record(&self, kind: BackupKind, path: &Path, remote_key: Option<&str>) -> Result<()> {
        let size = tokio::fs::metadata(path).await.map(|m| m.len() as i64).unwrap_or(0);
        sqlx::query(
            "INSERT INTO backups (id, kind, file_path, remote_key, size_bytes, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind.to_string())
        .bind(path.to_string_lossy().into_owned())
        .bind(remote_key)
        .bind(size)
        .bind(db::timestamp())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Delete local artifacts past retention. Files that are not artifacts are left alone.
    pub async fn prune_local(&self, now: NaiveDateTime) -> Result<u64> {
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BackupError::io("read backup dir")(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(BackupError::io("read backup dir"))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(taken_at) = artifact_timestamp(&name) else {
                continue;
            };
            if !is_expired(taken_at, now, self.config.retention_days) {
                continue;
            }

            let path = entry.path();
            tokio::fs::remove_file(&path)
                .await
                .map_err(BackupError::io("remove old backup"))?;
            sqlx::query("DELETE FROM backups WHERE file_path = ?")
                .bind(path.to_string_lossy().into_owned())
                .execute(&self.db)
                .await?;
            debug!(file = %name, "Removed expired local backup");
            removed += 1;
        }
        Ok(removed)
    }

    /// Delete remote artifacts past retention
    pub async fn prune_remote(&self, now: NaiveDateTime) -> Result<u64> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut removed = 0;
        for key in store.list(&self.config.s3_prefix).await? {
            let name = key.rsplit('/').next().unwrap_or(&key);
            let Some(taken_at) = artifact_timestamp(name) else {
                continue;
            };
            if is_expired(taken_at, now, self.config.retention_days) {
                store.delete(&key).await?;
                debug!(key = %key, "Removed expired remote backup");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Spawn the periodic backup task
pub async fn spawn_backup_task(db: DbPool, config: BackupConfig, data_dir: PathBuf) {
    if !config.enabled {
        info!("Scheduled backups are disabled");
        return;
    }

    let store: Option<Arc<dyn ArtifactStore>> = match &config.s3_bucket {
        Some(bucket) => {
            info!(bucket = %bucket, prefix = %config.s3_prefix, "Backups will be uploaded to S3");
            Some(Arc::new(S3ArtifactStore::new(bucket.clone(), config.s3_region.clone()).await))
        }
        None => {
            warn!("No S3 bucket configured, backups stay local only");
            None
        }
    };

    let interval_secs = config.interval_seconds.max(60);
    info!(
        interval_secs = interval_secs,
        retention_days = config.retention_days,
        "Starting backup scheduler"
    );

    let task = BackupTask::new(db, config, &data_dir, store);

    tokio::spawn(async move {
        // Let startup settle before the first snapshot
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = task.run_backup_cycle().await {
                error!(error = %e, "Backup cycle failed");
            }
        }
    });
}
