// ABOUTME: Persistence boundary: keyed JSON documents with full-overwrite saves
// ABOUTME: Loads never fail (missing/corrupt data yields empty); memory stores back tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cron::JobRecord;
use crate::requests::RequestRecord;

/// Schema version written to the job document for future migration
pub const JOB_STORE_VERSION: u32 = 1;

/// Dumb persistence for the request registry: load the whole keyed map,
/// save the whole keyed map. No business rules live here.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Load all persisted requests. Missing or corrupt data yields an empty
    /// map, never an error.
    async fn load(&self) -> HashMap<String, RequestRecord>;

    /// Overwrite the persisted representation with the given map.
    async fn save(&self, requests: &HashMap<String, RequestRecord>) -> Result<()>;
}

/// Dumb persistence for the cron job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self) -> HashMap<String, JobRecord>;
    async fn save(&self, jobs: &HashMap<String, JobRecord>) -> Result<()>;
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "Store file not present, starting empty");
            return None;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read store file, starting empty");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Store file is corrupt, starting empty");
            None
        }
    }
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize store document")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write store file {}", path.display()))?;
    Ok(())
}

/// JSON file store for orchestration requests: one document, ID-keyed map.
pub struct FileRequestStore {
    path: PathBuf,
}

impl FileRequestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RequestStore for FileRequestStore {
    async fn load(&self) -> HashMap<String, RequestRecord> {
        read_document(&self.path).await.unwrap_or_default()
    }

    async fn save(&self, requests: &HashMap<String, RequestRecord>) -> Result<()> {
        write_document(&self.path, requests).await
    }
}

#[derive(Serialize)]
struct JobDocumentRef<'a> {
    version: u32,
    jobs: &'a HashMap<String, JobRecord>,
}

#[derive(Deserialize)]
struct JobDocument {
    #[serde(default = "current_job_store_version")]
    version: u32,
    #[serde(default)]
    jobs: HashMap<String, JobRecord>,
}

fn current_job_store_version() -> u32 {
    JOB_STORE_VERSION
}

/// JSON file store for cron jobs: one versioned document, ID-keyed map.
pub struct FileJobStore {
    path: PathBuf,
}

impl FileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn load(&self) -> HashMap<String, JobRecord> {
        match read_document::<JobDocument>(&self.path).await {
            Some(document) => {
                if document.version != JOB_STORE_VERSION {
                    tracing::warn!(
                        found = document.version,
                        expected = JOB_STORE_VERSION,
                        "Job store version mismatch, loading as-is"
                    );
                }
                document.jobs
            }
            None => HashMap::new(),
        }
    }

    async fn save(&self, jobs: &HashMap<String, JobRecord>) -> Result<()> {
        write_document(
            &self.path,
            &JobDocumentRef {
                version: JOB_STORE_VERSION,
                jobs,
            },
        )
        .await
    }
}

/// In-memory request store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRequestStore {
    inner: Mutex<HashMap<String, RequestRecord>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store before handing it to a registry.
    pub fn with_requests(requests: HashMap<String, RequestRecord>) -> Self {
        Self {
            inner: Mutex::new(requests),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, RequestRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn load(&self) -> HashMap<String, RequestRecord> {
        self.snapshot()
    }

    async fn save(&self, requests: &HashMap<String, RequestRecord>) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *inner = requests.clone();
        Ok(())
    }
}

/// In-memory job store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: HashMap<String, JobRecord>) -> Self {
        Self {
            inner: Mutex::new(jobs),
        }
    }

    pub fn snapshot(&self) -> HashMap<String, JobRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self) -> HashMap<String, JobRecord> {
        self.snapshot()
    }

    async fn save(&self, jobs: &HashMap<String, JobRecord>) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *inner = jobs.clone();
        Ok(())
    }
}
