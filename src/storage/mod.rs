//! Persistent storage for encrypted sessions
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/
//! ├── session_<uuid>.vcb        # one encrypted blob per session id
//! └── .session_<uuid>.<n>.tmp   # in-flight write, renamed over the blob
//! ```
//!
//! Writes go to a temporary file in the same directory, are fsynced, then
//! renamed over the previous blob, so readers only ever see a complete old or
//! a complete new payload.

use crate::core::traits::SessionStore;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const BLOB_EXT: &str = "vcb";
const TMP_EXT: &str = "tmp";

/// File-per-session blob store
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// Temporary files left behind by an interrupted write are removed; the
    /// blob they were meant to replace is still intact.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        for entry in fs::read_dir(&root)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == TMP_EXT).unwrap_or(false) {
                tracing::warn!("Removing incomplete write {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> io::Result<PathBuf> {
        validate_id(id)?;
        Ok(self.root.join(format!("{}.{}", id, BLOB_EXT)))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        self.root
            .join(format!(".{}.{}.{}", id, uuid::Uuid::new_v4().simple(), TMP_EXT))
    }
}

impl SessionStore for FileBlobStore {
    fn read(&self, id: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.blob_path(id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, id: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.blob_path(id)?;
        let tmp_path = self.temp_path(id);

        let result = (|| {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(bytes)?;
            tmp_file.sync_all()?;
            drop(tmp_file);
            fs::rename(&tmp_path, &path)
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result?;

        // Persist the rename itself; not supported on every platform.
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> io::Result<()> {
        let path = self.blob_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list_ids(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == BLOB_EXT).unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if validate_id(stem).is_ok() {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Session ids become file names; only allow a conservative character set
fn validate_id(id: &str) -> io::Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid session id: {:?}", id),
        ))
    }
}
