//! JSON file persistence
//!
//! Every durable store (roll, ledger, credential) is a single small JSON
//! document loaded whole and replaced whole.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Modification time and size of a document, compared to detect external edits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// A JSON document on disk with load-all / replace-all semantics
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// Creates a handle for the document at `path`; nothing is touched on disk
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and decodes the whole document.
    ///
    /// Returns `Ok(None)` when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file cannot be read or decoded.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replaces the whole document.
    ///
    /// The value is written to a temporary sibling, flushed to disk and then
    /// renamed over the target, so readers see either the old or the new
    /// document and never a torn one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if encoding or any filesystem step fails.
    pub async fn save<T: Serialize + Sync>(&self, value: &T) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(value)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), bytes = body.len(), "Document saved");
        Ok(())
    }

    /// Change marker of the document, `None` if the file is missing.
    ///
    /// Best effort: two rewrites of equal length inside the filesystem's
    /// timestamp resolution produce the same stamp.
    pub async fn stamp(&self) -> Option<FileStamp> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{name}.tmp-{}", Uuid::new_v4().as_simple()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;

    /// Fresh directory under the OS temp dir
    pub(crate) fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("imagine-gateway-{}", Uuid::new_v4().as_simple()))
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[tokio::test]
    async fn test_missing_file_loads_as_none() {
        let file = JsonFile::new(temp_dir().join("absent.json"));
        let loaded: Option<Doc> = file.load().await.expect("load");
        assert!(loaded.is_none());
        assert!(file.stamp().await.is_none());
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_replaces_content() {
        let dir = temp_dir();
        let file = JsonFile::new(dir.join("nested").join("doc.json"));

        let first = Doc {
            name: "first".into(),
            count: 1,
        };
        file.save(&first).await.expect("save first");
        let second = Doc {
            name: "second".into(),
            count: 2,
        };
        file.save(&second).await.expect("save second");

        let loaded: Option<Doc> = file.load().await.expect("load");
        assert_eq!(loaded, Some(second));

        // No temporary siblings are left behind
        let mut entries = tokio::fs::read_dir(dir.join("nested")).await.expect("dir");
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.expect("entry") {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["doc.json".to_string()]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_fields_get_defaults() {
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");
        let path = dir.join("doc.json");
        tokio::fs::write(&path, br#"{"name":"legacy","extra":true}"#)
            .await
            .expect("write");

        let loaded: Option<Doc> = JsonFile::new(&path).load().await.expect("load");
        assert_eq!(
            loaded,
            Some(Doc {
                name: "legacy".into(),
                count: 0
            })
        );

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");
        let path = dir.join("doc.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");

        let result: Result<Option<Doc>, _> = JsonFile::new(&path).load().await;
        assert!(matches!(result, Err(StorageError::Json(_))));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
