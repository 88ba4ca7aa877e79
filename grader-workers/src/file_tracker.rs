//! Tracker storing one JSON document per job on disk.
//!
//! Lets the submitting process and the worker process share job state
//! without a database. Writes go to a temp file that is renamed over the
//! record, so readers never see a partial document.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use grader_job_queue::{JobId, JobOutcome};

use crate::error::TrackerError;
use crate::tracker::{JobRecord, LifecycleTracker, Transition};

/// Keeps temp file names unique within this process.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct FileTracker {
    dir: PathBuf,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl FileTracker {
    /// Open (creating if needed) the state directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file tracker");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TrackerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TrackerError::Unavailable("tracker is closed".into()))
        } else {
            Ok(())
        }
    }

    fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }

    async fn load(&self, id: &JobId) -> Result<Option<JobRecord>, TrackerError> {
        let bytes = match fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| TrackerError::Corrupt {
                job_id: id.clone(),
                source,
            })
    }

    /// Serialize `record` into a uniquely named temp file.
    async fn write_temp(&self, record: &JobRecord) -> Result<PathBuf, TrackerError> {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(
            ".{}.{}-{seq}.tmp",
            file_stem(&record.job_id),
            std::process::id()
        ));
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| TrackerError::Corrupt {
            job_id: record.job_id.clone(),
            source,
        })?;
        fs::write(&tmp, bytes).await?;
        Ok(tmp)
    }

    /// Replace an existing record.
    async fn store(&self, record: &JobRecord) -> Result<(), TrackerError> {
        let tmp = self.write_temp(record).await?;
        fs::rename(&tmp, self.path_for(&record.job_id)).await?;
        Ok(())
    }

    /// Create a record, failing with `AlreadyExists` if another writer got
    /// there first.
    async fn create(&self, record: &JobRecord) -> Result<(), TrackerError> {
        let tmp = self.write_temp(record).await?;
        let linked = fs::hard_link(&tmp, self.path_for(&record.job_id)).await;
        if let Err(e) = fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "failed to remove temp record");
        }
        linked?;
        Ok(())
    }

    /// Load-modify-store under the write lock. Unchanged records are not
    /// rewritten.
    ///
    /// Creation is atomic across processes: if another process creates the
    /// record first, the change is re-applied on top of theirs.
    async fn update<T>(
        &self,
        id: &JobId,
        apply: impl Fn(&mut JobRecord) -> T,
    ) -> Result<T, TrackerError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        loop {
            let Some(mut record) = self.load(id).await? else {
                let mut record = JobRecord::queued(id.clone());
                let result = apply(&mut record);
                match self.create(&record).await {
                    Ok(()) => return Ok(result),
                    Err(TrackerError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(e),
                }
            };
            let before = record.clone();
            let result = apply(&mut record);
            if record != before {
                self.store(&record).await?;
            }
            return Ok(result);
        }
    }
}

/// File name for a job id. Characters outside `[A-Za-z0-9_-]` are escaped
/// so ids cannot traverse out of the state directory.
fn file_stem(id: &JobId) -> String {
    let mut stem = String::with_capacity(id.as_str().len());
    for byte in id.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

#[async_trait]
impl LifecycleTracker for FileTracker {
    async fn mark_queued(&self, id: &JobId) -> Result<(), TrackerError> {
        self.update(id, |_| ()).await
    }

    async fn mark_running(&self, id: &JobId) -> Result<Transition, TrackerError> {
        self.update(id, JobRecord::start).await
    }

    async fn mark_done(&self, id: &JobId, outcome: JobOutcome) -> Result<Transition, TrackerError> {
        self.update(id, |record| record.finish(outcome.clone())).await
    }

    async fn increment_retry(&self, id: &JobId) -> Result<u32, TrackerError> {
        self.update(id, JobRecord::bump_retry).await
    }

    async fn record(&self, id: &JobId) -> Result<Option<JobRecord>, TrackerError> {
        self.ensure_open()?;
        self.load(id).await
    }

    async fn close(&self) -> Result<(), TrackerError> {
        // Wait for an in-progress write before refusing new ones.
        let _guard = self.write_lock.lock().await;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
