// src/bot/cooldown.rs - Per-trigger cooldown ledger and fire counters

use chrono::{DateTime, Utc};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::bot::trigger::{CooldownSpec, StoredState, Trigger};
use crate::types::{CooldownStyle, GuildId, TriggerEvent};

#[derive(Debug, Default)]
struct LedgerEntry {
    /// Last fire per bucket; guild style uses the guild id as its only bucket
    last: BTreeMap<u64, DateTime<Utc>>,
    fires: u64,
}

impl LedgerEntry {
    fn prune(&mut self, spec: &CooldownSpec, now: DateTime<Utc>) {
        let window = spec.duration();
        self.last.retain(|_, last| now.signed_duration_since(*last) < window);
    }

    fn allows(&self, scope_key: u64, spec: &CooldownSpec, now: DateTime<Utc>) -> bool {
        match self.last.get(&scope_key) {
            Some(last) => now.signed_duration_since(*last) >= spec.duration(),
            None => true,
        }
    }

    fn stamp(&mut self, scope_key: u64, now: DateTime<Utc>) {
        let slot = self.last.entry(scope_key).or_insert(now);
        if now > *slot {
            *slot = now;
        }
    }
}

/// Rate limiter state for every trigger, keyed by (guild, trigger name).
///
/// The outer map is only locked long enough to find or create an entry;
/// check-and-consume runs under the entry's own lock, so unrelated triggers
/// never wait on each other.
#[derive(Default)]
pub struct CooldownLedger {
    entries: RwLock<HashMap<(GuildId, String), Arc<Mutex<LedgerEntry>>>>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket an event falls into for the given cooldown style
    pub fn scope_key(style: CooldownStyle, event: &TriggerEvent) -> u64 {
        match style {
            CooldownStyle::Guild => event.guild_id,
            CooldownStyle::Channel => event.channel_id,
            CooldownStyle::Author => event.author.id,
        }
    }

    async fn entry(&self, guild_id: GuildId, name: &str) -> Arc<Mutex<LedgerEntry>> {
        let key = (guild_id, name.to_string());
        if let Some(entry) = self.entries.read().await.get(&key) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write().await;
        Arc::clone(entries.entry(key).or_default())
    }

    /// Whether the trigger may fire for `scope_key` at `now`
    pub async fn allow(&self, guild_id: GuildId, trigger: &Trigger, scope_key: u64, now: DateTime<Utc>) -> bool {
        let Some(spec) = trigger.cooldown else {
            return true;
        };
        let key = (guild_id, trigger.name.clone());
        let Some(entry) = self.entries.read().await.get(&key).cloned() else {
            return true;
        };
        let mut entry = entry.lock().await;
        entry.prune(&spec, now);
        entry.allows(scope_key, &spec, now)
    }

    /// Mark the bucket as used at `now` without checking it
    pub async fn consume(&self, guild_id: GuildId, trigger: &Trigger, scope_key: u64, now: DateTime<Utc>) {
        let Some(spec) = trigger.cooldown else {
            return;
        };
        let entry = self.entry(guild_id, &trigger.name).await;
        let mut entry = entry.lock().await;
        entry.prune(&spec, now);
        entry.stamp(scope_key, now);
    }

    /// Atomically check and consume; counts the fire on success
    pub async fn try_consume(&self, guild_id: GuildId, trigger: &Trigger, scope_key: u64, now: DateTime<Utc>) -> bool {
        let entry = self.entry(guild_id, &trigger.name).await;
        let mut entry = entry.lock().await;

        if let Some(spec) = trigger.cooldown {
            entry.prune(&spec, now);
            if !entry.allows(scope_key, &spec, now) {
                debug!("Trigger '{}' on cooldown for bucket {}", trigger.name, scope_key);
                return false;
            }
            entry.stamp(scope_key, now);
        }
        entry.fires += 1;
        true
    }

    /// Restore persisted state after a reload
    pub async fn seed(&self, guild_id: GuildId, name: &str, state: StoredState) {
        let entry = self.entry(guild_id, name).await;
        let mut entry = entry.lock().await;
        entry.last = state.last;
        entry.fires = state.count;
    }

    pub async fn snapshot(&self, guild_id: GuildId, name: &str) -> Option<StoredState> {
        let entry = self.entries.read().await.get(&(guild_id, name.to_string())).cloned()?;
        let entry = entry.lock().await;
        Some(StoredState {
            last: entry.last.clone(),
            count: entry.fires,
        })
    }

    /// Number of live cooldown buckets for a trigger
    pub async fn bucket_count(&self, guild_id: GuildId, name: &str) -> usize {
        match self.entries.read().await.get(&(guild_id, name.to_string())).cloned() {
            Some(entry) => entry.lock().await.last.len(),
            None => 0,
        }
    }

    /// Drop cooldown timestamps but keep the fire counter
    pub async fn clear_cooldown(&self, guild_id: GuildId, name: &str) {
        if let Some(entry) = self.entries.read().await.get(&(guild_id, name.to_string())).cloned() {
            entry.lock().await.last.clear();
        }
    }

    /// Forget everything about a removed trigger
    pub async fn purge(&self, guild_id: GuildId, name: &str) {
        if self.entries.write().await.remove(&(guild_id, name.to_string())).is_some() {
            debug!("Purged cooldown state for trigger '{}' in guild {}", name, guild_id);
        }
    }

    pub async fn purge_guild(&self, guild_id: GuildId) {
        self.entries.write().await.retain(|(guild, _), _| *guild != guild_id);
    }
}
