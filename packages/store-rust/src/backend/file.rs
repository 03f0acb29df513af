//! File-per-key [`DocumentBackend`] implementation.
//!
//! [`FileBackend`] stores each document as a pretty-printed JSON object in
//! `<root>/<key>`. Writes go to a dot-prefixed temp file in the same
//! directory and are renamed over the target, so readers never observe a
//! half-written document.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use docstore_core::Document;

use crate::backend::DocumentBackend;
use crate::error::BackendError;

/// One JSON file per key directly under a root directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Opens a backend rooted at `root`, creating the directory if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory documents are stored in.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`'s document.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!(".{key}.tmp"))
    }
}

impl DocumentBackend for FileBackend {
    fn read_document(&self, key: &str) -> Result<Document, BackendError> {
        let bytes = match fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(BackendError::NotFound),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(BackendError::Decode)
    }

    fn write_document(&self, key: &str, document: &Document) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(BackendError::Encode)?;
        let tmp_path = self.temp_path_for(key);
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, self.path_for(key))?;
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Non-UTF-8 names can never have been written through the store.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        Ok(keys)
    }
}
