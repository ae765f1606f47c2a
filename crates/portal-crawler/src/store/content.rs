use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::store::{write_atomic, ContentHash};

/// Payload bytes keyed by their SHA-256 digest under `<root>/objects`.
#[derive(Debug)]
pub struct ContentStore {
    objects: PathBuf,
    index: Mutex<HashSet<ContentHash>>,
}

impl ContentStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let objects = root.as_ref().join("objects");
        fs_err::create_dir_all(&objects)?;

        let mut index = HashSet::new();
        for shard in fs_err::read_dir(&objects)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for object in fs_err::read_dir(shard.path())? {
                let name = object?.file_name().to_string_lossy().into_owned();
                match format!("{prefix}{name}").parse::<ContentHash>() {
                    Ok(hash) => {
                        index.insert(hash);
                    }
                    // Leftover temp files from an interrupted write
                    Err(_) => log::debug!("Ignoring stray object file {prefix}/{name}"),
                }
            }
        }
        log::debug!("Opened content store {} ({} objects)", objects.display(), index.len());

        Ok(Self {
            objects,
            index: Mutex::new(index),
        })
    }

    fn path_of(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.objects.join(&hex[..2]).join(&hex[2..])
    }

    /// Stores `bytes` and returns their hash. Storing bytes that are already
    /// present performs no write.
    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::of(bytes);
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        if index.contains(&hash) {
            return Ok(hash);
        }
        if !write_atomic(&self.path_of(&hash), bytes, false)? {
            log::debug!("Object {hash} already written by another process");
        }
        index.insert(hash);
        Ok(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, StoreError> {
        if !self.contains(hash) {
            return Err(StoreError::NotFound(format!("object {hash}")));
        }
        Ok(fs_err::read(self.path_of(hash))?)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(hash)
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
