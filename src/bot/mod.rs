use log::{debug, error, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::error::TriggerError;
use crate::platforms::{ActionSurface, ImageProcessor};
use crate::store::{GlobalSettings, GuildSettings, TriggerStore};
use crate::types::{Action, GuildId, TriggerEvent, UserId};

pub mod cooldown;
pub mod dispatcher;
pub mod matcher;
pub mod pattern;
pub mod registry;
pub mod selector;
pub mod shutdown;
pub mod trigger;
pub mod worker;

use cooldown::CooldownLedger;
use dispatcher::{ActionDispatcher, DispatchReport};
use matcher::{BoundedMatcher, MatchLimit};
use pattern::PatternCompiler;
use registry::{FlushSummary, LoadSummary, TriggerRegistry};
use selector::{SelectOptions, TriggerSelector};
use shutdown::{GracefulShutdown, ShutdownPhase};
use trigger::{NewTrigger, Trigger};

/// Longest allowed per-match timeout; beyond this bypass mode is the answer
pub const MAX_TRIGGER_TIMEOUT_SECS: u64 = 10;

/// Whether the moderator has acknowledged a safety warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Unconfirmed,
    Confirmed,
}

/// Collaborators the engine is assembled from
pub struct EngineParts {
    pub store: Arc<dyn TriggerStore>,
    pub matcher: Arc<dyn BoundedMatcher>,
    pub surface: Arc<dyn ActionSurface>,
    pub images: Arc<dyn ImageProcessor>,
    pub compiler: PatternCompiler,
    pub shutdown: Arc<GracefulShutdown>,
}

#[derive(Debug, Default)]
struct EngineCounters {
    events: AtomicU64,
    fired: AtomicU64,
    failed_actions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub events: u64,
    pub fired: u64,
    pub failed_actions: u64,
}

/// Evaluates inbound events against every guild's triggers and dispatches
/// the actions of those that fire
pub struct TriggerEngine {
    registry: Arc<TriggerRegistry>,
    selector: TriggerSelector,
    dispatcher: ActionDispatcher,
    matcher: Arc<dyn BoundedMatcher>,
    store: Arc<dyn TriggerStore>,
    global: RwLock<GlobalSettings>,
    shutdown: Arc<GracefulShutdown>,
    last_created: AtomicU64,
    counters: EngineCounters,
}

impl TriggerEngine {
    pub fn new(parts: EngineParts) -> Self {
        let ledger = Arc::new(CooldownLedger::new());
        let registry = Arc::new(TriggerRegistry::new(
            Arc::clone(&parts.store),
            Arc::clone(&ledger),
            parts.compiler,
        ));

        Self {
            registry,
            selector: TriggerSelector::new(Arc::clone(&parts.matcher), ledger, Arc::clone(&parts.images)),
            dispatcher: ActionDispatcher::new(parts.surface, parts.images),
            matcher: parts.matcher,
            store: parts.store,
            global: RwLock::new(GlobalSettings::default()),
            shutdown: parts.shutdown,
            last_created: AtomicU64::new(0),
            counters: EngineCounters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Load global settings and rebuild the trigger index from the store
    pub async fn start(&self) -> Result<LoadSummary, TriggerError> {
        let global = self.store.load_global().await?;
        info!("Trigger timeout is {}s", global.trigger_timeout);
        *self.global.write().await = global;
        let summary = self.registry.load_from_store().await?;

        // New triggers must sort after everything already stored, even when
        // the stored stamps run ahead of this host's clock
        let mut newest = 0;
        for guild_id in self.registry.guild_ids().await {
            for trigger in self.registry.list(guild_id).await {
                newest = newest.max(trigger.created_at);
            }
        }
        self.last_created.fetch_max(newest, Ordering::SeqCst);
        Ok(summary)
    }

    /// Evaluate one event. Returns one report per trigger that fired.
    pub async fn handle_event(&self, event: &TriggerEvent) -> Result<Vec<DispatchReport>, TriggerError> {
        let _permit = self
            .shutdown
            .acquire_operation_permit()
            .await
            .ok_or(TriggerError::ShuttingDown)?;
        self.counters.events.fetch_add(1, Ordering::Relaxed);

        if event.author.bot {
            return Ok(Vec::new());
        }

        let triggers = self.registry.list(event.guild_id).await;
        if triggers.is_empty() {
            return Ok(Vec::new());
        }

        let settings = self.registry.guild_settings(event.guild_id).await;
        let options = SelectOptions {
            allow_multiple: settings.allow_multiple,
            limit: self.match_limit(&settings).await,
        };

        let selected = self.selector.select(event, &triggers, options).await;
        let mut reports = Vec::with_capacity(selected.len());
        for found in selected {
            let report = self.dispatcher.execute(&found.trigger, &found.result, event).await;
            self.counters.fired.fetch_add(1, Ordering::Relaxed);
            self.counters
                .failed_actions
                .fetch_add(report.failures().count() as u64, Ordering::Relaxed);
            reports.push(report);
        }
        Ok(reports)
    }

    async fn match_limit(&self, settings: &GuildSettings) -> MatchLimit {
        if settings.bypass {
            MatchLimit::Unbounded
        } else {
            MatchLimit::Timeout(self.trigger_timeout().await)
        }
    }

    /// Creation stamps are strictly increasing so evaluation order is stable
    fn next_created_at(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_created.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_created
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub async fn create_trigger(
        &self,
        guild_id: GuildId,
        name: &str,
        pattern: &str,
        actions: Vec<Action>,
        author_id: UserId,
    ) -> Result<Arc<Trigger>, TriggerError> {
        let new = NewTrigger {
            name: name.to_string(),
            pattern: pattern.to_string(),
            actions,
            author_id,
            created_at: self.next_created_at(),
        };
        self.registry.create(guild_id, new).await
    }

    pub async fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.global.read().await.trigger_timeout.max(1))
    }

    /// Change the global match timeout. Values below 1 become 1; values above
    /// the maximum are refused; anything above 1 needs confirmation.
    pub async fn set_trigger_timeout(&self, seconds: i64, confirmation: Confirmation) -> Result<u64, TriggerError> {
        let seconds = seconds.max(1) as u64;
        if seconds > MAX_TRIGGER_TIMEOUT_SECS {
            return Err(TriggerError::InvalidSetting(format!(
                "trigger timeout cannot exceed {} seconds; enable bypass mode for guilds that need longer searches",
                MAX_TRIGGER_TIMEOUT_SECS
            )));
        }
        if seconds > 1 && confirmation == Confirmation::Unconfirmed {
            return Err(TriggerError::ConfirmationRequired {
                setting: "trigger_timeout".to_string(),
                warning: format!(
                    "a {}s timeout lets one bad pattern hold a match worker that long for every message",
                    seconds
                ),
            });
        }

        let settings = {
            let mut global = self.global.write().await;
            global.trigger_timeout = seconds;
            global.clone()
        };
        info!("Trigger timeout set to {}s", seconds);
        if let Err(e) = self.store.save_global(&settings).await {
            error!("Failed to save global settings: {:#}; retrying on next flush", e);
        }
        Ok(seconds)
    }

    /// Enabling bypass removes timeout enforcement for the guild and needs confirmation
    pub async fn set_bypass(
        &self,
        guild_id: GuildId,
        enabled: bool,
        confirmation: Confirmation,
    ) -> Result<GuildSettings, TriggerError> {
        if enabled && confirmation == Confirmation::Unconfirmed {
            return Err(TriggerError::ConfirmationRequired {
                setting: "bypass".to_string(),
                warning: "patterns in this guild will run without a timeout and can stall the bot".to_string(),
            });
        }
        let settings = self
            .registry
            .update_guild_settings(guild_id, |s| s.bypass = enabled)
            .await;
        info!("Bypass mode {} for guild {}", if enabled { "enabled" } else { "disabled" }, guild_id);
        Ok(settings)
    }

    pub async fn set_allow_multiple(&self, guild_id: GuildId, enabled: bool) -> GuildSettings {
        let settings = self
            .registry
            .update_guild_settings(guild_id, |s| s.allow_multiple = enabled)
            .await;
        info!("Multiple triggers per message {} for guild {}", enabled, guild_id);
        settings
    }

    /// Write all trigger records and global settings
    pub async fn flush(&self) -> FlushSummary {
        let mut summary = self.registry.flush().await;
        let global = self.global.read().await.clone();
        if let Err(e) = self.store.save_global(&global).await {
            error!("Failed to flush global settings: {:#}", e);
            summary.failed_guilds += 1;
        }
        summary
    }

    /// Flush every `interval` until shutdown begins
    pub fn spawn_save_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut phases = self.shutdown.subscribe_to_shutdown();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = engine.flush().await;
                        debug!("Periodic save wrote {} records", summary.written);
                    }
                    phase = phases.recv() => {
                        match phase {
                            Ok(ShutdownPhase::Running) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            _ => break,
                        }
                    }
                }
            }
            debug!("Periodic save loop stopped");
        })
    }

    /// Release matcher workers and pending deletions
    pub async fn stop(&self) {
        self.matcher.shutdown().await;
        self.dispatcher.deletions().cancel_all().await;
        info!("Trigger engine stopped");
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            events: self.counters.events.load(Ordering::Relaxed),
            fired: self.counters.fired.load(Ordering::Relaxed),
            failed_actions: self.counters.failed_actions.load(Ordering::Relaxed),
        }
    }
}
