//! Durable gallery of enrolled identities.
//!
//! The gallery is held as an `Arc<Gallery>` behind an `RwLock`. Writers are
//! serialized, build the next gallery off to the side, commit it to the
//! key-value backend and only then swap it in, so a snapshot is always either
//! the fully pre-write or fully post-write state.

use crate::types::{Embedding, Gallery, Identity, IdentityId, IdentitySummary};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Key under which the gallery document is stored.
pub const GALLERY_KEY: &str = "faces";
/// Current version of the persisted gallery document.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("invalid key {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidKey(String),
    #[error("read {key}: {reason}")]
    Read { key: String, reason: String },
    #[error("write {key}: {reason}")]
    Write { key: String, reason: String },
}

/// Durable string key-value storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Must be durable and atomic: after `Ok`, a reader sees `value`; after
    /// `Err` or a crash, a reader sees the previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
}

/// One JSON file per key inside a directory.
///
/// Writes go to `<key>.json.tmp`, are fsynced, then renamed over `<key>.json`.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KvError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| KvError::Write {
            key: dir.display().to_string(),
            reason: format!("create directory: {e}"),
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KvError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(KvError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Read {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let path = self.path_for(key)?;
        let temp_path = path.with_extension("json.tmp");
        let write_err = |stage: &str, e: std::io::Error| KvError::Write {
            key: key.to_string(),
            reason: format!("{stage}: {e}"),
        };

        let mut file = fs::File::create(&temp_path).map_err(|e| write_err("create temp", e))?;
        file.write_all(value.as_bytes())
            .map_err(|e| write_err("write temp", e))?;
        file.sync_all().map_err(|e| write_err("sync temp", e))?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(|e| write_err("rename", e))?;

        // Persist the rename itself. Not every platform can fsync a directory.
        if let Err(e) = fs::File::open(&self.dir).and_then(|d| d.sync_all()) {
            tracing::debug!(dir = %self.dir.display(), error = %e, "directory sync skipped");
        }
        Ok(())
    }
}

/// Process-local store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("label is empty")]
    EmptyLabel,
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding from extractor {actual:?}, gallery uses {expected:?}")]
    IncompatibleEmbeddingVersion { expected: String, actual: String },
    #[error("write failure: {0}")]
    WriteFailure(KvError),
    #[error("read failure: {0}")]
    ReadFailure(KvError),
    #[error("stored gallery is unreadable: {0}")]
    Corrupt(String),
    #[error("stored gallery has unsupported schema version {0}")]
    UnsupportedSchema(u32),
}

/// How `enroll` treats a label that is already enrolled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrollMode {
    /// Always create a new identity; labels are not unique keys.
    #[default]
    NewIdentity,
    /// Append to the earliest identity with this label, creating it if unseen.
    MultiShot,
}

/// A stored entry that was dropped while loading.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    /// Position in the stored `identities` array.
    pub index: usize,
    pub reason: String,
}

/// What `open` found in the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDocument {
    schema_version: u32,
    identities: Vec<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredDocumentRef<'a> {
    schema_version: u32,
    identities: &'a [Identity],
}

pub struct EnrollmentStore {
    kv: Arc<dyn KvStore>,
    gallery: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
}

impl EnrollmentStore {
    /// Load the last committed gallery from `kv`.
    ///
    /// Malformed identities are skipped and listed in the report. An
    /// unparseable document or unknown schema version is an error.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<(Self, LoadReport), StoreError> {
        let raw = kv.get(GALLERY_KEY).map_err(StoreError::ReadFailure)?;
        let (gallery, report) = match raw {
            Some(raw) => decode_gallery(&raw)?,
            None => (Gallery::default(), LoadReport::default()),
        };

        for skipped in &report.skipped {
            tracing::warn!(index = skipped.index, reason = %skipped.reason, "skipping stored identity");
        }
        tracing::info!(
            identities = report.loaded,
            skipped = report.skipped.len(),
            "enrollment store opened"
        );

        let store = Self {
            kv,
            gallery: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
        };
        Ok((store, report))
    }

    /// Immutable point-in-time view of the gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        let guard = self.gallery.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Summaries of every identity, in insertion order.
    pub fn list(&self) -> Vec<IdentitySummary> {
        self.snapshot()
            .identities()
            .iter()
            .map(Identity::summary)
            .collect()
    }

    /// Enroll `embedding` under `label`, committing before returning.
    pub fn enroll(
        &self,
        label: &str,
        embedding: Embedding,
        mode: EnrollMode,
    ) -> Result<IdentityId, StoreError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        validate_embedding(&embedding)?;

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        check_consistent(current.first_embedding(), &embedding)?;

        let mut next = Gallery::clone(&current);
        let existing = match mode {
            EnrollMode::MultiShot => next.identities_mut().iter_mut().find(|i| i.label == label),
            EnrollMode::NewIdentity => None,
        };

        let id = match existing {
            Some(identity) => {
                identity.embeddings.push(embedding);
                tracing::info!(id = %identity.id, label, shots = identity.embeddings.len(), "appended enrollment shot");
                identity.id
            }
            None => {
                let identity = Identity {
                    id: Uuid::new_v4(),
                    label: label.to_string(),
                    created_at: Utc::now(),
                    embeddings: vec![embedding],
                };
                let id = identity.id;
                next.identities_mut().push(identity);
                tracing::info!(%id, label, "enrolled new identity");
                id
            }
        };

        self.commit(next)?;
        Ok(id)
    }

    /// Remove an identity and all of its embeddings.
    pub fn remove(&self, id: IdentityId) -> Result<(), StoreError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();
        if current.get(id).is_none() {
            return Err(StoreError::NotFound(id));
        }

        let mut next = Gallery::clone(&current);
        next.identities_mut().retain(|i| i.id != id);
        self.commit(next)?;
        tracing::info!(%id, "removed identity");
        Ok(())
    }

    /// Persist `next`, then publish it. The caller must hold the writer lock.
    fn commit(&self, next: Gallery) -> Result<(), StoreError> {
        let document = StoredDocumentRef {
            schema_version: SCHEMA_VERSION,
            identities: next.identities(),
        };
        let encoded = serde_json::to_string(&document).map_err(|e| {
            StoreError::WriteFailure(KvError::Write {
                key: GALLERY_KEY.to_string(),
                reason: format!("encode: {e}"),
            })
        })?;

        if let Err(e) = self.kv.set(GALLERY_KEY, &encoded) {
            tracing::warn!(error = %e, "gallery commit failed; keeping previous state");
            return Err(StoreError::WriteFailure(e));
        }

        let mut guard = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(next);
        tracing::debug!(bytes = encoded.len(), "gallery committed");
        Ok(())
    }
}

fn validate_embedding(embedding: &Embedding) -> Result<(), StoreError> {
    if embedding.vector.is_empty() {
        return Err(StoreError::InvalidEmbedding("vector is empty".into()));
    }
    if embedding.vector.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbedding("vector has non-finite values".into()));
    }
    Ok(())
}

fn check_consistent(reference: Option<&Embedding>, embedding: &Embedding) -> Result<(), StoreError> {
    let Some(reference) = reference else {
        return Ok(());
    };
    if reference.dimension() != embedding.dimension() {
        return Err(StoreError::DimensionMismatch {
            expected: reference.dimension(),
            actual: embedding.dimension(),
        });
    }
    if reference.extractor_version != embedding.extractor_version {
        return Err(StoreError::IncompatibleEmbeddingVersion {
            expected: reference.extractor_version.clone(),
            actual: embedding.extractor_version.clone(),
        });
    }
    Ok(())
}

fn decode_gallery(raw: &str) -> Result<(Gallery, LoadReport), StoreError> {
    let document: StoredDocument =
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if !(1..=SCHEMA_VERSION).contains(&document.schema_version) {
        return Err(StoreError::UnsupportedSchema(document.schema_version));
    }

    let mut gallery = Gallery::default();
    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for (index, value) in document.identities.into_iter().enumerate() {
        let accepted = serde_json::from_value::<Identity>(value)
            .map_err(|e| e.to_string())
            .and_then(|identity| validate_stored(identity, &gallery, &seen));
        match accepted {
            Ok(identity) => {
                seen.insert(identity.id);
                gallery.identities_mut().push(identity);
                report.loaded += 1;
            }
            Err(reason) => report.skipped.push(SkippedEntry { index, reason }),
        }
    }

    Ok((gallery, report))
}

fn validate_stored(
    identity: Identity,
    gallery: &Gallery,
    seen: &HashSet<IdentityId>,
) -> Result<Identity, String> {
    if seen.contains(&identity.id) {
        return Err(format!("duplicate id {}", identity.id));
    }
    if identity.label.trim().is_empty() {
        return Err("empty label".into());
    }
    if identity.embeddings.is_empty() {
        return Err("no embeddings".into());
    }

    // Anchor on the gallery loaded so far, or on this identity's first shot.
    let reference = gallery
        .first_embedding()
        .or(identity.embeddings.first())
        .cloned();
    for embedding in &identity.embeddings {
        validate_embedding(embedding).map_err(|e| e.to_string())?;
        check_consistent(reference.as_ref(), embedding).map_err(|e| e.to_string())?;
    }
    Ok(identity)
}
