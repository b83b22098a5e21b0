//! File-backed metadata store.
//!
//! Every record lives under `<root>/.sce/specs/<spec>/` as JSON. Writes are
//! crash-consistent: serialize to a temp file in the same directory, fsync,
//! then rename over the target. A reader therefore sees either the prior
//! content or the new content, never a torn write.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::models::{Collaboration, LifecycleRecord, LifecycleState, LifecycleTransition};

/// Name of the collaboration metadata file within a spec directory.
pub const COLLABORATION_FILE: &str = "collaboration.json";
/// Name of the lifecycle record file within a spec directory.
pub const LIFECYCLE_FILE: &str = "lifecycle.json";

/// Default number of read-modify-write retries in [`MetadataStore::atomic_update`].
const DEFAULT_UPDATE_RETRIES: u32 = 3;
/// Base delay for the atomic-update backoff.
const UPDATE_BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Errors surfaced by the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid metadata for spec {spec:?}: {reason}")]
    InvalidMetadata { spec: String, reason: String },

    #[error("concurrent update on spec {spec:?} not resolved after {attempts} attempts")]
    ConcurrentUpdate { spec: String, attempts: u32 },

    #[error("lifecycle transition {from} -> {to} is not allowed for spec {spec:?}")]
    InvalidTransition {
        spec: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("i/o error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Durable, crash-consistent access to per-spec metadata and lifecycle
/// records under a project root.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Create a store rooted at a project directory. Nothing is touched on
    /// disk until the first read or write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The project root this store operates on.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/.sce/specs`
    pub fn specs_dir(&self) -> PathBuf {
        self.root.join(".sce").join("specs")
    }

    /// `<root>/.sce/specs/<spec>`
    pub fn spec_dir(&self, spec: &str) -> PathBuf {
        self.specs_dir().join(spec)
    }

    /// `<root>/.sce/auto`, where run-session artifacts live.
    pub fn auto_dir(&self) -> PathBuf {
        self.root.join(".sce").join("auto")
    }

    /// Whether a spec has a backing directory on disk.
    pub fn spec_exists(&self, spec: &str) -> bool {
        self.spec_dir(spec).is_dir()
    }

    // -- collaboration.json -------------------------------------------------

    /// Read a spec's collaboration metadata. Returns `None` when no record
    /// exists; malformed or invalid records are an error.
    pub async fn read(&self, spec: &str) -> Result<Option<Collaboration>, StoreError> {
        let path = self.spec_dir(spec).join(COLLABORATION_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let collab: Collaboration =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidMetadata {
                spec: spec.to_owned(),
                reason: e.to_string(),
            })?;
        validate_collaboration(spec, &collab)?;
        Ok(Some(collab))
    }

    /// Validate and atomically persist a spec's collaboration metadata.
    pub async fn write(&self, spec: &str, collab: &Collaboration) -> Result<(), StoreError> {
        validate_collaboration(spec, collab)?;
        let path = self.spec_dir(spec).join(COLLABORATION_FILE);
        self.write_atomic(&path, collab).await
    }

    /// Read-modify-write with optimistic concurrency. The closure receives
    /// the current record (created via [`Collaboration::new_sub`] when none
    /// exists) and mutates it in place. If another writer lands between our
    /// read and our write, the update is retried under exponential backoff,
    /// failing with [`StoreError::ConcurrentUpdate`] only after all retries
    /// are exhausted.
    pub async fn atomic_update<F>(&self, spec: &str, mut apply: F) -> Result<Collaboration, StoreError>
    where
        F: FnMut(&mut Collaboration),
    {
        let path = self.spec_dir(spec).join(COLLABORATION_FILE);

        for attempt in 0..=DEFAULT_UPDATE_RETRIES {
            let before = match tokio::fs::read(&path).await {
                Ok(b) => Some(b),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(StoreError::io(&path, e)),
            };

            let mut collab = match &before {
                Some(bytes) => {
                    serde_json::from_slice(bytes).map_err(|e| StoreError::InvalidMetadata {
                        spec: spec.to_owned(),
                        reason: e.to_string(),
                    })?
                }
                None => Collaboration::new_sub(),
            };

            apply(&mut collab);
            collab.status.updated_at = Utc::now();
            validate_collaboration(spec, &collab)?;

            // Re-read just before committing; a byte-level change means a
            // concurrent writer won the race for this round.
            let current = match tokio::fs::read(&path).await {
                Ok(b) => Some(b),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(StoreError::io(&path, e)),
            };

            if current == before {
                self.write_atomic(&path, &collab).await?;
                return Ok(collab);
            }

            if attempt < DEFAULT_UPDATE_RETRIES {
                let delay = UPDATE_BACKOFF_BASE * 2u32.saturating_pow(attempt);
                tokio::time::sleep(delay).await;
            }
        }

        Err(StoreError::ConcurrentUpdate {
            spec: spec.to_owned(),
            attempts: DEFAULT_UPDATE_RETRIES + 1,
        })
    }

    /// Enumerate all specs with readable collaboration metadata, sorted by
    /// name. A missing specs directory yields an empty list; specs with
    /// unreadable metadata are skipped with a warning.
    pub async fn list_all(&self) -> Result<Vec<(String, Collaboration)>, StoreError> {
        let dir = self.specs_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.read(&name).await {
                Ok(Some(collab)) => out.push((name, collab)),
                Ok(None) => {}
                Err(e) => {
                    warn!(spec = %name, error = %e, "skipping spec with unreadable metadata");
                }
            }
        }
        Ok(out)
    }

    // -- lifecycle.json -----------------------------------------------------

    /// Read a spec's lifecycle record. A missing file yields the default
    /// `planned` record; a corrupted file is replaced by the default and a
    /// warning is surfaced.
    pub async fn read_lifecycle(&self, spec: &str) -> Result<LifecycleRecord, StoreError> {
        let path = self.spec_dir(spec).join(LIFECYCLE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LifecycleRecord::planned(spec));
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(spec = %spec, error = %e, "corrupted lifecycle record, replacing with default");
                let record = LifecycleRecord::planned(spec);
                self.write_lifecycle(spec, &record).await?;
                Ok(record)
            }
        }
    }

    /// Atomically persist a spec's lifecycle record.
    pub async fn write_lifecycle(
        &self,
        spec: &str,
        record: &LifecycleRecord,
    ) -> Result<(), StoreError> {
        let path = self.spec_dir(spec).join(LIFECYCLE_FILE);
        self.write_atomic(&path, record).await
    }

    /// Apply one lifecycle transition: validate the edge against the
    /// record's current state, append it with a fresh timestamp, and persist.
    pub async fn record_transition(
        &self,
        spec: &str,
        to: LifecycleState,
    ) -> Result<LifecycleRecord, StoreError> {
        let mut record = self.read_lifecycle(spec).await?;
        let from = record.status;

        if !LifecycleState::is_valid_transition(from, to) {
            return Err(StoreError::InvalidTransition {
                spec: spec.to_owned(),
                from,
                to,
            });
        }

        record.transitions.push(LifecycleTransition {
            from,
            to,
            timestamp: Utc::now(),
        });
        record.status = to;
        self.write_lifecycle(spec, &record).await?;
        Ok(record)
    }

    // -- internals ----------------------------------------------------------

    /// Serialize a record and commit it with write-to-temp + fsync + rename.
    async fn write_atomic<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .expect("record paths always have a parent directory");
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;

        let json = serde_json::to_vec_pretty(value)
            .expect("record types serialize without error");

        let tmp = parent.join(format!(
            ".{}.tmp-{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::io(path, e))
    }
}

/// Semantic validation beyond what serde enforces.
fn validate_collaboration(spec: &str, collab: &Collaboration) -> Result<(), StoreError> {
    if collab.version.trim().is_empty() {
        return Err(StoreError::InvalidMetadata {
            spec: spec.to_owned(),
            reason: "version must be non-empty".to_owned(),
        });
    }
    for dep in &collab.dependencies {
        if dep.spec.trim().is_empty() {
            return Err(StoreError::InvalidMetadata {
                spec: spec.to_owned(),
                reason: "dependency target must be non-empty".to_owned(),
            });
        }
        if dep.spec == spec {
            return Err(StoreError::InvalidMetadata {
                spec: spec.to_owned(),
                reason: format!("spec {spec:?} depends on itself"),
            });
        }
    }
    Ok(())
}
