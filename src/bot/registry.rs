// src/bot/registry.rs - Write-through trigger cache over the durable store

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::bot::cooldown::CooldownLedger;
use crate::bot::pattern::PatternCompiler;
use crate::bot::trigger::{NewTrigger, StoredTrigger, Trigger, TriggerEdit};
use crate::error::TriggerError;
use crate::store::{GuildSettings, TriggerStore};
use crate::types::{GuildId, UserId};

/// Who is asking to change a trigger
#[derive(Debug, Clone, Copy)]
pub struct Editor {
    pub id: UserId,
    /// Guild administrators may change any trigger
    pub administrator: bool,
}

impl Editor {
    fn may_edit(&self, trigger: &Trigger) -> bool {
        self.administrator || self.id == trigger.author_id
    }
}

/// A stored record that could not be loaded. It stays in the store untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedRecord {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub guilds: usize,
    pub loaded: usize,
    pub quarantined: usize,
    /// Guilds whose document could not be read; their files are left as found
    pub failed_guilds: Vec<GuildId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub removed: usize,
    pub failed_guilds: usize,
}

#[derive(Default)]
struct GuildState {
    triggers: BTreeMap<String, Arc<Trigger>>,
    settings: GuildSettings,
    quarantined: Vec<QuarantinedRecord>,
    /// Removals that reached memory but not yet the store
    pending_removals: BTreeSet<String>,
}

#[derive(Default)]
struct GuildEntry {
    state: RwLock<GuildState>,
    /// Serializes store writes for the guild so the latest record always lands last
    persist: Mutex<()>,
}

/// In-memory index of every guild's triggers.
///
/// Memory is authoritative: a failed store write is logged and retried by
/// the next [`flush`](Self::flush). The index can be rebuilt at any time with
/// [`load_from_store`](Self::load_from_store).
pub struct TriggerRegistry {
    store: Arc<dyn TriggerStore>,
    ledger: Arc<CooldownLedger>,
    compiler: PatternCompiler,
    guilds: RwLock<HashMap<GuildId, Arc<GuildEntry>>>,
}

impl TriggerRegistry {
    pub fn new(store: Arc<dyn TriggerStore>, ledger: Arc<CooldownLedger>, compiler: PatternCompiler) -> Self {
        Self {
            store,
            ledger,
            compiler,
            guilds: RwLock::new(HashMap::new()),
        }
    }

    pub fn compiler(&self) -> &PatternCompiler {
        &self.compiler
    }

    pub fn ledger(&self) -> &Arc<CooldownLedger> {
        &self.ledger
    }

    async fn entry(&self, guild_id: GuildId) -> Arc<GuildEntry> {
        if let Some(entry) = self.guilds.read().await.get(&guild_id) {
            return Arc::clone(entry);
        }
        Arc::clone(self.guilds.write().await.entry(guild_id).or_default())
    }

    async fn existing_entry(&self, guild_id: GuildId) -> Option<Arc<GuildEntry>> {
        self.guilds.read().await.get(&guild_id).cloned()
    }

    /// Rebuild the whole index from the store.
    ///
    /// A guild whose document cannot be read is skipped and reported in
    /// [`LoadSummary::failed_guilds`]; every other guild still loads.
    pub async fn load_from_store(&self) -> Result<LoadSummary, TriggerError> {
        let mut summary = LoadSummary::default();
        for guild_id in self.store.guild_ids().await? {
            match self.load_guild(guild_id).await {
                Ok((loaded, quarantined)) => {
                    summary.guilds += 1;
                    summary.loaded += loaded;
                    summary.quarantined += quarantined;
                }
                Err(e) => {
                    error!("Skipping guild {}: {}", guild_id, e);
                    summary.failed_guilds.push(guild_id);
                }
            }
        }
        info!(
            "Loaded {} triggers across {} guilds ({} quarantined, {} guilds unreadable)",
            summary.loaded,
            summary.guilds,
            summary.quarantined,
            summary.failed_guilds.len()
        );
        Ok(summary)
    }

    /// Rebuild one guild from the store, returning (loaded, quarantined)
    pub async fn load_guild(&self, guild_id: GuildId) -> Result<(usize, usize), TriggerError> {
        let document = self.store.load_guild(guild_id).await?;
        let entry = self.entry(guild_id).await;
        let _persist = entry.persist.lock().await;

        let mut fresh = GuildState {
            settings: document.settings,
            ..GuildState::default()
        };

        self.ledger.purge_guild(guild_id).await;
        for (key, raw) in document.trigger_list {
            let parsed = serde_json::from_value::<StoredTrigger>(raw)
                .map_err(|e| e.to_string())
                .and_then(|stored| {
                    if stored.name != key {
                        return Err(format!("record is stored under `{}` but named `{}`", key, stored.name));
                    }
                    Trigger::from_stored(stored, &self.compiler).map_err(|e| e.to_string())
                });

            match parsed {
                Ok((trigger, state)) => {
                    self.ledger.seed(guild_id, &trigger.name, state).await;
                    fresh.triggers.insert(key, Arc::new(trigger));
                }
                Err(reason) => {
                    error!("Quarantined trigger record '{}' in guild {}: {}", key, guild_id, reason);
                    fresh.quarantined.push(QuarantinedRecord { key, reason });
                }
            }
        }

        let counts = (fresh.triggers.len(), fresh.quarantined.len());
        *entry.state.write().await = fresh;
        debug!("Guild {} loaded with {} triggers", guild_id, counts.0);
        Ok(counts)
    }

    pub async fn quarantined(&self, guild_id: GuildId) -> Vec<QuarantinedRecord> {
        match self.existing_entry(guild_id).await {
            Some(entry) => entry.state.read().await.quarantined.clone(),
            None => Vec::new(),
        }
    }

    pub async fn create(&self, guild_id: GuildId, new: NewTrigger) -> Result<Arc<Trigger>, TriggerError> {
        let trigger = Arc::new(Trigger::build(new, &self.compiler)?);
        let entry = self.entry(guild_id).await;
        {
            let mut state = entry.state.write().await;
            let taken = state.triggers.contains_key(&trigger.name)
                || state.quarantined.iter().any(|q| q.key == trigger.name);
            if taken {
                return Err(TriggerError::DuplicateName {
                    name: trigger.name.clone(),
                });
            }
            state.pending_removals.remove(&trigger.name);
            state.triggers.insert(trigger.name.clone(), Arc::clone(&trigger));
        }

        info!(
            "Created {} trigger '{}' in guild {} by {}",
            trigger.kind(),
            trigger.name,
            guild_id,
            trigger.author_id
        );
        self.write_through(guild_id, &entry, &trigger.name).await;
        Ok(trigger)
    }

    /// Replace one field of a trigger on behalf of `editor`
    pub async fn edit(
        &self,
        guild_id: GuildId,
        name: &str,
        editor: Editor,
        edit: TriggerEdit,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let entry = self.existing_entry(guild_id).await.ok_or_else(|| not_found(name))?;
        let resets_cooldown = matches!(edit, TriggerEdit::Cooldown { .. });

        let updated = {
            let mut state = entry.state.write().await;
            let current = state.triggers.get(name).ok_or_else(|| not_found(name))?;
            authorize(editor, current)?;
            let updated = Arc::new(current.apply_edit(edit, &self.compiler)?);
            state.triggers.insert(name.to_string(), Arc::clone(&updated));
            updated
        };

        if resets_cooldown {
            self.ledger.clear_cooldown(guild_id, name).await;
        }
        debug!("Edited trigger '{}' in guild {}", name, guild_id);
        self.write_through(guild_id, &entry, name).await;
        Ok(updated)
    }

    pub async fn remove(&self, guild_id: GuildId, name: &str, editor: Editor) -> Result<Arc<Trigger>, TriggerError> {
        let entry = self.existing_entry(guild_id).await.ok_or_else(|| not_found(name))?;
        let removed = {
            let mut state = entry.state.write().await;
            let current = state.triggers.get(name).ok_or_else(|| not_found(name))?;
            authorize(editor, current)?;
            let removed = state.triggers.remove(name).ok_or_else(|| not_found(name))?;
            state.pending_removals.insert(name.to_string());
            removed
        };

        self.ledger.purge(guild_id, name).await;
        info!("Removed trigger '{}' from guild {}", name, guild_id);
        self.write_through(guild_id, &entry, name).await;
        Ok(removed)
    }

    /// Remove every trigger created by `author_id`, returning their names
    pub async fn remove_all_by_author(&self, guild_id: GuildId, author_id: UserId) -> Vec<String> {
        let Some(entry) = self.existing_entry(guild_id).await else {
            return Vec::new();
        };
        let names: Vec<String> = {
            let mut state = entry.state.write().await;
            let names: Vec<String> = state
                .triggers
                .values()
                .filter(|t| t.author_id == author_id)
                .map(|t| t.name.clone())
                .collect();
            for name in &names {
                state.triggers.remove(name);
                state.pending_removals.insert(name.clone());
            }
            names
        };

        for name in &names {
            self.ledger.purge(guild_id, name).await;
            self.write_through(guild_id, &entry, name).await;
        }
        if !names.is_empty() {
            info!("Removed {} triggers by user {} from guild {}", names.len(), author_id, guild_id);
        }
        names
    }

    pub async fn get(&self, guild_id: GuildId, name: &str) -> Option<Arc<Trigger>> {
        let entry = self.existing_entry(guild_id).await?;
        let state = entry.state.read().await;
        state.triggers.get(name).cloned()
    }

    /// All triggers of a guild in evaluation order
    pub async fn list(&self, guild_id: GuildId) -> Vec<Arc<Trigger>> {
        let Some(entry) = self.existing_entry(guild_id).await else {
            return Vec::new();
        };
        let mut triggers: Vec<Arc<Trigger>> = entry.state.read().await.triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        triggers
    }

    pub async fn guild_ids(&self) -> Vec<GuildId> {
        let mut ids: Vec<GuildId> = self.guilds.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        match self.existing_entry(guild_id).await {
            Some(entry) => entry.state.read().await.settings.clone(),
            None => GuildSettings::default(),
        }
    }

    pub async fn update_guild_settings<F>(&self, guild_id: GuildId, change: F) -> GuildSettings
    where
        F: FnOnce(&mut GuildSettings),
    {
        let entry = self.entry(guild_id).await;
        let settings = {
            let mut state = entry.state.write().await;
            change(&mut state.settings);
            state.settings.clone()
        };

        let _persist = entry.persist.lock().await;
        if let Err(e) = self.store.save_guild_settings(guild_id, &settings).await {
            error!("Failed to save settings for guild {}: {:#}; retrying on next flush", guild_id, e);
        }
        settings
    }

    /// Persist the current in-memory form of one record (or its removal)
    async fn write_through(&self, guild_id: GuildId, entry: &GuildEntry, name: &str) {
        let _persist = entry.persist.lock().await;
        let current = entry.state.read().await.triggers.get(name).cloned();

        let result = match current {
            Some(trigger) => match self.stored_value(guild_id, &trigger).await {
                Ok(record) => self.store.save_trigger(guild_id, name, record).await,
                Err(e) => Err(e),
            },
            None => self.store.remove_trigger(guild_id, name).await.map(|_| ()),
        };

        match result {
            Ok(()) => {
                entry.state.write().await.pending_removals.remove(name);
            }
            Err(e) => error!(
                "Failed to persist trigger '{}' in guild {}: {:#}; retrying on next flush",
                name, guild_id, e
            ),
        }
    }

    async fn stored_value(&self, guild_id: GuildId, trigger: &Trigger) -> anyhow::Result<serde_json::Value> {
        let state = self.ledger.snapshot(guild_id, &trigger.name).await;
        Ok(serde_json::to_value(trigger.to_stored(state.as_ref()))?)
    }

    /// Write every trigger's current record, including cooldown and counter
    /// state, and retry removals that failed earlier. Event handling is
    /// never blocked: records are snapshotted per guild under a read lock.
    pub async fn flush(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();
        let entries: Vec<(GuildId, Arc<GuildEntry>)> = self
            .guilds
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        for (guild_id, entry) in entries {
            let _persist = entry.persist.lock().await;
            let (triggers, settings, removals) = {
                let state = entry.state.read().await;
                let triggers: Vec<Arc<Trigger>> = state.triggers.values().cloned().collect();
                let removals: Vec<String> = state.pending_removals.iter().cloned().collect();
                (triggers, state.settings.clone(), removals)
            };

            let mut failed = false;
            let mut records = Vec::with_capacity(triggers.len());
            for trigger in &triggers {
                match self.stored_value(guild_id, trigger).await {
                    Ok(record) => records.push((trigger.name.clone(), record)),
                    Err(e) => {
                        error!("Failed to serialize trigger '{}': {:#}", trigger.name, e);
                        failed = true;
                    }
                }
            }

            let written = records.len();
            if let Err(e) = self.store.save_triggers(guild_id, records).await {
                error!("Failed to flush guild {}: {:#}", guild_id, e);
                failed = true;
            } else {
                summary.written += written;
            }

            if let Err(e) = self.store.save_guild_settings(guild_id, &settings).await {
                error!("Failed to flush settings of guild {}: {:#}", guild_id, e);
                failed = true;
            }

            for name in removals {
                match self.store.remove_trigger(guild_id, &name).await {
                    Ok(_) => {
                        entry.state.write().await.pending_removals.remove(&name);
                        summary.removed += 1;
                    }
                    Err(e) => {
                        warn!("Removal of '{}' in guild {} still failing: {:#}", name, guild_id, e);
                        failed = true;
                    }
                }
            }

            if failed {
                summary.failed_guilds += 1;
            }
        }

        debug!(
            "Flushed {} trigger records ({} removals, {} guilds failed)",
            summary.written, summary.removed, summary.failed_guilds
        );
        summary
    }
}

fn not_found(name: &str) -> TriggerError {
    TriggerError::TriggerNotFound { name: name.to_string() }
}

fn authorize(editor: Editor, trigger: &Trigger) -> Result<(), TriggerError> {
    if editor.may_edit(trigger) {
        Ok(())
    } else {
        Err(TriggerError::AuthorizationDenied {
            trigger: trigger.name.clone(),
            reason: "only the trigger author or an administrator may change it".to_string(),
        })
    }
}
