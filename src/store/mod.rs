// src/store/mod.rs - Durable per-guild trigger storage

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use crate::types::GuildId;

/// Per-guild engine settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    /// Run every matching trigger instead of stopping at the first
    pub allow_multiple: bool,
    /// Skip match timeout enforcement for this guild
    pub bypass: bool,
}

/// Process-wide settings shared by every guild
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Seconds a single pattern search may run
    pub trigger_timeout: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self { trigger_timeout: 1 }
    }
}

/// Everything stored for one guild. Trigger records are kept as raw JSON so
/// that one unreadable record never prevents loading the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuildDocument {
    #[serde(default)]
    pub settings: GuildSettings,
    #[serde(default)]
    pub trigger_list: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
pub trait TriggerStore: Send + Sync {
    async fn guild_ids(&self) -> Result<Vec<GuildId>>;

    async fn load_guild(&self, guild_id: GuildId) -> Result<GuildDocument>;

    /// Insert or replace records by name
    async fn save_triggers(&self, guild_id: GuildId, records: Vec<(String, serde_json::Value)>) -> Result<()>;

    async fn save_trigger(&self, guild_id: GuildId, name: &str, record: serde_json::Value) -> Result<()> {
        self.save_triggers(guild_id, vec![(name.to_string(), record)]).await
    }

    /// Returns whether a record was present
    async fn remove_trigger(&self, guild_id: GuildId, name: &str) -> Result<bool>;

    async fn save_guild_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> Result<()>;

    async fn load_global(&self) -> Result<GlobalSettings>;

    async fn save_global(&self, settings: &GlobalSettings) -> Result<()>;
}

/// JSON documents on disk: `guilds/<id>.json` plus `global.json`
pub struct FileStore {
    root: PathBuf,
    guild_locks: Mutex<HashMap<GuildId, Arc<Mutex<()>>>>,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let guilds = root.join("guilds");
        if !guilds.exists() {
            fs::create_dir_all(&guilds)
                .await
                .with_context(|| format!("Failed to create data directory: {}", guilds.display()))?;
            info!("Created trigger data directory: {}", guilds.display());
        }
        Ok(Self {
            root,
            guild_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guild_path(&self, guild_id: GuildId) -> PathBuf {
        self.root.join("guilds").join(format!("{}.json", guild_id))
    }

    async fn guild_lock(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        Arc::clone(self.guild_locks.lock().await.entry(guild_id).or_default())
    }

    async fn read_document(&self, guild_id: GuildId) -> Result<GuildDocument> {
        let path = self.guild_path(guild_id);
        if !path.exists() {
            return Ok(GuildDocument::default());
        }
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read guild document: {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse guild document: {}", path.display()))
    }

    async fn write_document(&self, guild_id: GuildId, document: &GuildDocument) -> Result<()> {
        let path = self.guild_path(guild_id);
        write_atomically(&path, serde_json::to_vec_pretty(document)?).await
    }

    /// Update one guild document under its lock
    async fn modify<F, T>(&self, guild_id: GuildId, change: F) -> Result<T>
    where
        F: FnOnce(&mut GuildDocument) -> T + Send,
        T: Send,
    {
        let lock = self.guild_lock(guild_id).await;
        let _guard = lock.lock().await;
        let mut document = self.read_document(guild_id).await?;
        let result = change(&mut document);
        self.write_document(guild_id, &document).await?;
        Ok(result)
    }

    /// Create a compressed backup of every stored document
    pub async fn create_backup(&self) -> Result<PathBuf> {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup_dir = self.root.join("backups");

        if !backup_dir.exists() {
            fs::create_dir_all(&backup_dir).await?;
        }

        let backup_path = backup_dir.join(format!("triggers_backup_{}.tar.gz", timestamp));
        let root = self.root.clone();
        let target = backup_path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::fs::File;
            use tar::Builder;

            let backup_file = File::create(&target)?;
            let encoder = GzEncoder::new(backup_file, Compression::default());
            let mut archive = Builder::new(encoder);

            let global = root.join("global.json");
            if global.is_file() {
                archive.append_path_with_name(&global, "global.json")?;
            }
            let guilds = root.join("guilds");
            if guilds.is_dir() {
                archive.append_dir_all("guilds", &guilds)?;
            }

            archive.into_inner()?.finish()?;
            Ok(())
        })
        .await
        .context("Backup task panicked")??;

        info!("Created trigger backup: {}", backup_path.display());
        Ok(backup_path)
    }
}

async fn write_atomically(path: &Path, content: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl TriggerStore for FileStore {
    async fn guild_ids(&self) -> Result<Vec<GuildId>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.root.join("guilds")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                match path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
                    Some(id) => ids.push(id),
                    None => debug!("Ignoring unexpected file in data directory: {}", path.display()),
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load_guild(&self, guild_id: GuildId) -> Result<GuildDocument> {
        let lock = self.guild_lock(guild_id).await;
        let _guard = lock.lock().await;
        self.read_document(guild_id).await
    }

    async fn save_triggers(&self, guild_id: GuildId, records: Vec<(String, serde_json::Value)>) -> Result<()> {
        let count = records.len();
        self.modify(guild_id, move |document| {
            document.trigger_list.extend(records);
        })
        .await?;
        debug!("Saved {} trigger records for guild {}", count, guild_id);
        Ok(())
    }

    async fn remove_trigger(&self, guild_id: GuildId, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.modify(guild_id, move |document| document.trigger_list.remove(&name).is_some())
            .await
    }

    async fn save_guild_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> Result<()> {
        let settings = settings.clone();
        self.modify(guild_id, move |document| document.settings = settings).await
    }

    async fn load_global(&self) -> Result<GlobalSettings> {
        let path = self.root.join("global.json");
        if !path.exists() {
            return Ok(GlobalSettings::default());
        }
        let content = fs::read_to_string(&path).await?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    async fn save_global(&self, settings: &GlobalSettings) -> Result<()> {
        write_atomically(&self.root.join("global.json"), serde_json::to_vec_pretty(settings)?).await
    }
}

/// In-memory store for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    guilds: RwLock<HashMap<GuildId, GuildDocument>>,
    global: RwLock<GlobalSettings>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched back
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insert a raw record, bypassing validation
    pub async fn insert_raw(&self, guild_id: GuildId, name: &str, record: serde_json::Value) {
        self.guilds
            .write()
            .await
            .entry(guild_id)
            .or_default()
            .trigger_list
            .insert(name.to_string(), record);
    }

    pub async fn raw_record(&self, guild_id: GuildId, name: &str) -> Option<serde_json::Value> {
        self.guilds.read().await.get(&guild_id)?.trigger_list.get(name).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TriggerStore for MemoryStore {
    async fn guild_ids(&self) -> Result<Vec<GuildId>> {
        let mut ids: Vec<GuildId> = self.guilds.read().await.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn load_guild(&self, guild_id: GuildId) -> Result<GuildDocument> {
        Ok(self.guilds.read().await.get(&guild_id).cloned().unwrap_or_default())
    }

    async fn save_triggers(&self, guild_id: GuildId, records: Vec<(String, serde_json::Value)>) -> Result<()> {
        self.check_writable()?;
        self.guilds
            .write()
            .await
            .entry(guild_id)
            .or_default()
            .trigger_list
            .extend(records);
        Ok(())
    }

    async fn remove_trigger(&self, guild_id: GuildId, name: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self
            .guilds
            .write()
            .await
            .get_mut(&guild_id)
            .map_or(false, |doc| doc.trigger_list.remove(name).is_some()))
    }

    async fn save_guild_settings(&self, guild_id: GuildId, settings: &GuildSettings) -> Result<()> {
        self.check_writable()?;
        self.guilds.write().await.entry(guild_id).or_default().settings = settings.clone();
        Ok(())
    }

    async fn load_global(&self) -> Result<GlobalSettings> {
        Ok(self.global.read().await.clone())
    }

    async fn save_global(&self, settings: &GlobalSettings) -> Result<()> {
        self.check_writable()?;
        *self.global.write().await = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_crud() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();

        assert!(store.guild_ids().await.unwrap().is_empty());
        assert_eq!(store.load_guild(5).await.unwrap(), GuildDocument::default());

        store
            .save_trigger(5, "hello", serde_json::json!({"name": "hello"}))
            .await
            .unwrap();
        store
            .save_guild_settings(5, &GuildSettings { allow_multiple: true, bypass: false })
            .await
            .unwrap();

        let document = store.load_guild(5).await.unwrap();
        assert!(document.settings.allow_multiple);
        assert_eq!(document.trigger_list["hello"]["name"], "hello");
        assert_eq!(store.guild_ids().await.unwrap(), vec![5]);

        assert!(store.remove_trigger(5, "hello").await.unwrap());
        assert!(!store.remove_trigger(5, "hello").await.unwrap());
        assert!(store.load_guild(5).await.unwrap().trigger_list.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_global_defaults_and_updates() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();

        assert_eq!(store.load_global().await.unwrap().trigger_timeout, 1);
        store.save_global(&GlobalSettings { trigger_timeout: 4 }).await.unwrap();
        assert_eq!(store.load_global().await.unwrap().trigger_timeout, 4);
    }

    #[tokio::test]
    async fn test_backup_creation() {
        let temp_dir = tempdir().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        store.save_trigger(1, "a", serde_json::json!({})).await.unwrap();

        let backup_path = store.create_backup().await.unwrap();
        assert!(backup_path.exists());
        assert!(backup_path.extension().unwrap() == "gz");
    }

    #[tokio::test]
    async fn test_memory_store_write_failures() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.save_trigger(1, "a", serde_json::json!({})).await.is_err());
        store.set_fail_writes(false);
        assert!(store.save_trigger(1, "a", serde_json::json!({})).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }
}
