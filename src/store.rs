//! Versioned JSON document persistence.
//!
//! Every concern (tasks, plans, runs, policies, audit, merge queue, scheduler)
//! owns exactly one document on disk. Writes go to a temp file in the same
//! directory and are renamed over the target, so readers observe either the
//! previous or the next document, never a torn one.
//!
//! Atomicity is per document, not per row: two writers that load, modify and
//! save the same document concurrently race, and the last rename wins.
//!
//! All I/O here is synchronous and every save rewrites the full document.
//! Async code that writes on every call, like the command gateway's audit
//! trail, runs it under `tokio::task::spawn_blocking`.

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::errors::StoreError;

/// Current on-disk document format version.
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    updated_at: DateTime<Utc>,
    data: T,
}

/// A single JSON document of type `T` stored at a fixed path.
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DocumentStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file yields an empty document; every other
    /// failure is returned to the caller.
    pub fn load(&self) -> Result<T, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let envelope: Envelope<T> =
            serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;

        if envelope.version > DOCUMENT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                found: envelope.version,
                supported: DOCUMENT_VERSION,
            });
        }

        Ok(envelope.data)
    }

    /// Atomically replace the document on disk.
    pub fn save(&self, data: &T) -> Result<(), StoreError> {
        let envelope = Envelope {
            version: DOCUMENT_VERSION,
            updated_at: Utc::now(),
            data,
        };
        let json =
            serde_json::to_string_pretty(&envelope).map_err(|source| StoreError::Serialize {
                path: self.path.clone(),
                source,
            })?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|source| self.write_err(source))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|source| self.write_err(source))?;
        tmp.write_all(json.as_bytes())
            .map_err(|source| self.write_err(source))?;
        tmp.as_file()
            .sync_all()
            .map_err(|source| self.write_err(source))?;
        tmp.persist(&self.path)
            .map_err(|e| self.write_err(e.error))?;

        Ok(())
    }

    /// Load, apply `f`, and save. Returns whatever `f` returns.
    pub fn update<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut T) -> Result<R, E>,
        E: From<StoreError>,
    {
        let mut doc = self.load()?;
        let out = f(&mut doc)?;
        self.save(&doc)?;
        Ok(out)
    }

    fn write_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        items: BTreeMap<String, u32>,
        note: Option<String>,
    }

    #[test]
    fn missing_file_loads_empty_document() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().unwrap(), Doc::default());
    }

    #[test]
    fn save_then_load_is_identical() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(dir.path().join("doc.json"));
        let mut doc = Doc::default();
        doc.items.insert("b".into(), 2);
        doc.items.insert("a".into(), 1);
        doc.note = Some("hello".into());

        store.save(&doc).unwrap();
        assert_eq!(store.load().unwrap(), doc);

        // The raw file parses to the same value regardless of key order.
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], DOCUMENT_VERSION);
        assert_eq!(raw["data"], serde_json::to_value(&doc).unwrap());
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(dir.path().join("doc.json"));
        store.save(&Doc::default()).unwrap();
        store.save(&Doc::default()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[test]
    fn save_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> =
            DocumentStore::new(dir.path().join("nested").join("deeper").join("doc.json"));
        store.save(&Doc::default()).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn corrupt_file_is_an_error_not_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(path);
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
    }

    #[test]
    fn newer_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z", "data": {"items": {}, "note": null}}"#,
        )
        .unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(path);
        assert!(matches!(
            store.load(),
            Err(StoreError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn update_applies_and_persists() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(dir.path().join("doc.json"));
        let len = store
            .update(|doc| {
                doc.items.insert("x".into(), 7);
                Ok::<_, StoreError>(doc.items.len())
            })
            .unwrap();
        assert_eq!(len, 1);
        assert_eq!(store.load().unwrap().items.get("x"), Some(&7));
    }

    #[test]
    fn failed_update_does_not_persist() {
        let dir = tempdir().unwrap();
        let store: DocumentStore<Doc> = DocumentStore::new(dir.path().join("doc.json"));
        let result: Result<(), StoreError> = store.update(|doc| {
            doc.items.insert("x".into(), 1);
            Err(StoreError::UnsupportedVersion {
                path: PathBuf::from("x"),
                found: 2,
                supported: 1,
            })
        });
        assert!(result.is_err());
        assert!(store.load().unwrap().items.is_empty());
    }
}
