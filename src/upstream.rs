use crate::config::ProfileType;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, PoisonError};
use ulid::Ulid;

/// One finished profile, ready to be shipped.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub id: Ulid,
    /// Series name, e.g. `app.cpu{env=prod}`.
    pub name: String,
    pub profile_type: ProfileType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample_rate: u32,
    /// Gzip-compressed profile bytes.
    pub payload: Vec<u8>,
}

/// Receiver of finished profiles. Implementations own transport and retries.
pub trait Upstream: Send + Sync {
    fn upload(&self, job: UploadJob) -> anyhow::Result<()>;
}

/// Keeps every job in memory.
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    jobs: Mutex<Vec<UploadJob>>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<UploadJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<UploadJob> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Upstream for MemoryUpstream {
    fn upload(&self, job: UploadJob) -> anyhow::Result<()> {
        log::debug!(
            "Received upload job {} for {} ({} bytes)",
            job.id,
            job.name,
            job.payload.len()
        );
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}
