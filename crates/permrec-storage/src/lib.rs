//! Output sink for the generated permissions script: hashing + atomic replace.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "permrec-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenOutput {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// False when the file already held exactly these bytes.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct OutputSink {
    path: PathBuf,
}

impl OutputSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Hash of the file currently on disk, or `None` when there is no file yet.
    pub fn current_hash(&self) -> Result<Option<String>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(Self::sha256_hex(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io("reading", &self.path)(err)),
        }
    }

    pub fn is_current(&self, bytes: &[u8]) -> Result<bool, StorageError> {
        let wanted = Self::sha256_hex(bytes);
        Ok(self.current_hash()?.as_deref() == Some(wanted.as_str()))
    }

    /// Replace the output with `bytes` via a sibling temp file and rename.
    pub fn write(&self, bytes: &[u8]) -> Result<WrittenOutput, StorageError> {
        let content_hash = Self::sha256_hex(bytes);
        let previous = self.current_hash()?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(StorageError::io("creating directory", parent))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));

        let result = write_temp(&temp_path, bytes).and_then(|()| {
            fs::rename(&temp_path, &self.path)
                .map_err(StorageError::io("renaming into", &self.path))
        });
        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        let changed = previous.as_deref() != Some(content_hash.as_str());
        info!(
            path = %self.path.display(),
            bytes = bytes.len(),
            changed,
            "wrote permissions script"
        );
        Ok(WrittenOutput {
            path: self.path.clone(),
            content_hash,
            byte_size: bytes.len(),
            changed,
        })
    }
}

fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(temp_path)
        .map_err(StorageError::io("opening temp file", temp_path))?;
    file.write_all(bytes)
        .map_err(StorageError::io("writing temp file", temp_path))?;
    file.flush()
        .map_err(StorageError::io("flushing temp file", temp_path))?;
    Ok(())
}
