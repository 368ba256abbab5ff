//! Watchers turn events from external sources into Inbound items.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ActionError, HitlError};
use crate::state_machine::{ItemId, ItemKind};
use crate::store::ItemStore;

/// One unit of work reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    /// Identifier the source uses; watchers never ingest the same one twice.
    pub external_id: String,
    pub kind: ItemKind,
    pub payload: Value,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<SourceEvent>, ActionError>;

    /// Called after the event became an item.
    async fn acknowledge(&self, _event: &SourceEvent) -> Result<(), ActionError> {
        Ok(())
    }
}

pub struct SourceWatcher {
    id: String,
    source: Box<dyn EventSource>,
    store: Arc<ItemStore>,
    seen: Mutex<HashSet<String>>,
}

impl SourceWatcher {
    pub fn new(id: impl Into<String>, source: Box<dyn EventSource>, store: Arc<ItemStore>) -> Self {
        Self {
            id: id.into(),
            source,
            store,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Polls the source once and creates an item per unseen event.
    pub async fn check_for_updates(&self) -> Result<Vec<ItemId>, HitlError> {
        let events = self.source.poll().await?;
        let mut created = Vec::new();

        for event in events {
            if self.already_seen(&event.external_id)? {
                continue;
            }
            let id = self.store.create(event.kind.clone(), event.payload.clone(), &self.id)?;
            self.mark_seen(&event.external_id)?;
            if let Err(e) = self.source.acknowledge(&event).await {
                tracing::warn!(watcher = %self.id, external_id = %event.external_id, "acknowledge failed: {e}");
            }
            created.push(id);
        }

        if !created.is_empty() {
            tracing::info!(watcher = %self.id, count = created.len(), "new items");
        }
        Ok(created)
    }

    fn already_seen(&self, external_id: &str) -> Result<bool, HitlError> {
        let seen = self.seen.lock().map_err(|_| HitlError::Poisoned("watcher seen-id set"))?;
        Ok(seen.contains(external_id))
    }

    fn mark_seen(&self, external_id: &str) -> Result<(), HitlError> {
        let mut seen = self.seen.lock().map_err(|_| HitlError::Poisoned("watcher seen-id set"))?;
        seen.insert(external_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DropFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: ItemKind,
    #[serde(default)]
    payload: Value,
}

/// Picks up `*.json` files dropped into a folder.
///
/// Each file holds `{"id": "...", "type": "...", "payload": {...}}`; `id`
/// defaults to the file stem. Ingested files move to `processed/`,
/// unreadable ones to `rejected/`.
pub struct DropFolderSource {
    dir: PathBuf,
    pending: Mutex<HashMap<String, PathBuf>>,
}

impl DropFolderSource {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    async fn set_aside(&self, path: &Path, folder: &str) -> Result<(), ActionError> {
        let target_dir = self.dir.join(folder);
        tokio::fs::create_dir_all(&target_dir).await.map_err(io_error)?;
        let Some(name) = path.file_name() else {
            return Ok(());
        };
        tokio::fs::rename(path, target_dir.join(name)).await.map_err(io_error)
    }
}

fn io_error(e: std::io::Error) -> ActionError {
    ActionError::Transient(format!("drop folder: {e}"))
}

#[async_trait]
impl EventSource for DropFolderSource {
    async fn poll(&self) -> Result<Vec<SourceEvent>, ActionError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut events = Vec::new();
        for path in paths {
            let raw = tokio::fs::read_to_string(&path).await.map_err(io_error)?;
            let file: DropFile = match serde_json::from_str(&raw) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "rejecting unreadable drop file: {e}");
                    self.set_aside(&path, "rejected").await?;
                    continue;
                }
            };
            let external_id = file.id.unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            self.pending
                .lock()
                .map_err(|_| ActionError::Transient("drop folder state poisoned".into()))?
                .insert(external_id.clone(), path);
            events.push(SourceEvent {
                external_id,
                kind: file.kind,
                payload: file.payload,
            });
        }
        Ok(events)
    }

    async fn acknowledge(&self, event: &SourceEvent) -> Result<(), ActionError> {
        let path = self
            .pending
            .lock()
            .map_err(|_| ActionError::Transient("drop folder state poisoned".into()))?
            .remove(&event.external_id);
        match path {
            Some(path) => self.set_aside(&path, "processed").await,
            None => Ok(()),
        }
    }
}
