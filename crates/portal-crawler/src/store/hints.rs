use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::store::write_atomic;

/// Last-modified hints of fully stored resources, keyed by external id.
#[derive(Debug)]
pub struct HintLedger {
    path: PathBuf,
    hints: Mutex<BTreeMap<String, String>>,
}

impl HintLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let hints = match fs_err::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Serde {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            hints: Mutex::new(hints),
        })
    }

    /// True when `hint` equals the one recorded for `external_id`.
    pub fn is_unchanged(&self, external_id: &str, hint: &str) -> bool {
        self.hints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(external_id)
            .map(|recorded| recorded == hint)
            .unwrap_or(false)
    }

    pub fn get(&self, external_id: &str) -> Option<String> {
        self.hints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(external_id)
            .cloned()
    }

    pub fn record(&self, external_id: &str, hint: &str) {
        self.hints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(external_id.to_string(), hint.to_string());
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        let hints = self.hints.lock().unwrap_or_else(|e| e.into_inner());
        let bytes = serde_json::to_vec_pretty(&*hints).map_err(|source| StoreError::Serde {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes, true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_hints_survive_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hints.json");

        let ledger = HintLedger::open(&path).unwrap();
        assert!(!ledger.is_unchanged("a", "2024-01-01"));
        ledger.record("a", "2024-01-01");
        ledger.flush().unwrap();

        let ledger = HintLedger::open(&path).unwrap();
        assert!(ledger.is_unchanged("a", "2024-01-01"));
        assert!(!ledger.is_unchanged("a", "2024-02-01"));
        assert_eq!(ledger.get("b"), None);
    }
}
