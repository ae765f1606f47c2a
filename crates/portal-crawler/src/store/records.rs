use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::resource::Record;
use crate::store::{write_atomic, ContentHash, ContentStore};

/// Result of an upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Inserted,
    Replaced(Record),
    /// The stored record is as recent or more recent; nothing was written.
    Unchanged(Record),
}

impl Upsert {
    /// The record stored for the same id before the upsert, if any.
    pub fn previous(&self) -> Option<&Record> {
        match self {
            Self::Inserted => None,
            Self::Replaced(r) | Self::Unchanged(r) => Some(r),
        }
    }

    pub fn into_previous(self) -> Option<Record> {
        match self {
            Self::Inserted => None,
            Self::Replaced(r) | Self::Unchanged(r) => Some(r),
        }
    }

    pub fn is_written(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub id_prefix: Option<String>,
    /// Field name, expected rendering of its value
    pub fields: Vec<(String, String)>,
    pub source: Option<ContentHash>,
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !record.record_id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &record.source_content_hash != source {
                return false;
            }
        }
        self.fields.iter().all(|(name, expected)| {
            record
                .field(name)
                .map(|v| &v.to_string() == expected)
                .unwrap_or(false)
        })
    }
}

/// Records keyed by `record_id`, one JSON file each under `<root>/records`.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    content: Arc<ContentStore>,
    records: Mutex<HashMap<String, Record>>,
}

impl RecordStore {
    pub fn open(root: impl AsRef<Path>, content: Arc<ContentStore>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join("records");
        fs_err::create_dir_all(&dir)?;

        let mut records = HashMap::new();
        for entry in fs_err::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs_err::read(&path)?;
            let record: Record =
                serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
                    path: path.clone(),
                    source,
                })?;
            records.insert(record.record_id.clone(), record);
        }
        log::debug!("Opened record store {} ({} records)", dir.display(), records.len());

        Ok(Self {
            dir,
            content,
            records: Mutex::new(records),
        })
    }

    fn path_of(&self, record_id: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(record_id.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }

    /// Last-write-wins by `parsed_at`: an older or equal record is ignored
    /// and the current one is handed back.
    pub fn upsert(&self, record: Record) -> Result<Upsert, StoreError> {
        if !self.content.contains(&record.source_content_hash) {
            return Err(StoreError::DanglingPayload {
                record_id: record.record_id,
                hash: record.source_content_hash,
            });
        }

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = records.get(&record.record_id) {
            if record.parsed_at <= current.parsed_at {
                return Ok(Upsert::Unchanged(current.clone()));
            }
        }

        let path = self.path_of(&record.record_id);
        let bytes = serde_json::to_vec_pretty(&record).map_err(|source| StoreError::Serde {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes, true)?;

        Ok(match records.insert(record.record_id.clone(), record) {
            Some(previous) => Upsert::Replaced(previous),
            None => Upsert::Inserted,
        })
    }

    pub fn get(&self, record_id: &str) -> Result<Record, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("record {record_id}")))
    }

    /// Matching records ordered by id, taken from a snapshot.
    pub fn list(&self, filter: &RecordFilter) -> impl Iterator<Item = Record> {
        let snapshot: BTreeMap<String, Record> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let filter = filter.clone();
        snapshot.into_values().filter(move |r| filter.matches(r))
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
