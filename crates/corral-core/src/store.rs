//! Persistence of domain definitions.

use crate::domain::DomainDef;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Where persistent definitions live.
#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Write (or overwrite) a definition.
    async fn save(&self, def: &DomainDef) -> Result<()>;

    /// Remove a definition. Missing entries are not an error.
    async fn delete(&self, uuid: Uuid) -> Result<()>;

    /// Every stored definition.
    async fn load_all(&self) -> Result<Vec<DomainDef>>;
}

/// One pretty-printed JSON file per domain, named by UUID.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, uuid: Uuid) -> PathBuf {
        self.dir.join(format!("{uuid}.json"))
    }
}

#[async_trait]
impl DomainStore for JsonFileStore {
    async fn save(&self, def: &DomainDef) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(def.uuid);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(def)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(domain = %def.name, path = %path.display(), "Definition saved");
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> Result<()> {
        let path = self.path_for(uuid);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(%uuid, path = %path.display(), "Definition deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<DomainDef>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut defs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<DomainDef>(&body) {
                Ok(def) => defs.push(def),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable definition");
                }
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(count = defs.len(), dir = %self.dir.display(), "Loaded definitions");
        Ok(defs)
    }
}

/// Definitions kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    defs: Mutex<HashMap<Uuid, DomainDef>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `defs`.
    pub fn with_defs(defs: impl IntoIterator<Item = DomainDef>) -> Self {
        Self {
            defs: Mutex::new(defs.into_iter().map(|d| (d.uuid, d)).collect()),
        }
    }

    /// Whether `uuid` is stored.
    pub async fn contains(&self, uuid: Uuid) -> bool {
        self.defs.lock().await.contains_key(&uuid)
    }
}

#[async_trait]
impl DomainStore for MemoryStore {
    async fn save(&self, def: &DomainDef) -> Result<()> {
        if def.name.is_empty() {
            return Err(CoreError::Config("domain name is required".into()));
        }
        self.defs.lock().await.insert(def.uuid, def.clone());
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> Result<()> {
        self.defs.lock().await.remove(&uuid);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<DomainDef>> {
        let mut defs: Vec<DomainDef> = self.defs.lock().await.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("corral-store-{tag}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = scratch_dir("rt");
        let store = JsonFileStore::new(&dir);
        assert!(store.load_all().await.unwrap().is_empty());

        let web = DomainDef::new("web01");
        let db = DomainDef::new("db01");
        store.save(&web).await.unwrap();
        store.save(&db).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![db.clone(), web.clone()]);

        store.delete(web.uuid).await.unwrap();
        store.delete(web.uuid).await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), vec![db]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_json_store_skips_garbage() {
        let dir = scratch_dir("garbage");
        let store = JsonFileStore::new(&dir);
        store.save(&DomainDef::new("web01")).await.unwrap();
        tokio::fs::write(dir.join("broken.json"), b"{not json").await.unwrap();
        tokio::fs::write(dir.join("notes.txt"), b"ignored").await.unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 1);
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        let def = DomainDef::new("web01");
        let store = MemoryStore::with_defs([def.clone()]);
        assert!(store.contains(def.uuid).await);
        store.delete(def.uuid).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
