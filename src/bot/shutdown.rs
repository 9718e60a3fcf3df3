// src/bot/shutdown.rs - Graceful shutdown management

use anyhow::Result;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, RwLock, Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::bot::TriggerEngine;
use crate::store::FileStore;

/// Shutdown phases for orderly termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// No new events are accepted; in-flight events finish
    Draining,
    /// Components are being stopped
    Terminating,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for in-flight events before stopping components
    pub graceful_timeout_seconds: u64,
    /// Time allowed for each component to stop
    pub component_timeout_seconds: u64,
    /// Whether the backup component runs
    pub create_backup: bool,
    /// Upper bound on concurrently handled events
    pub max_operations: u32,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_seconds: 30,
            component_timeout_seconds: 10,
            create_backup: true,
            max_operations: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownStats {
    pub phase: ShutdownPhase,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<f64>,
    pub components_shutdown: Vec<String>,
    pub failed_components: Vec<(String, String)>,
    pub forced_termination: bool,
}

impl Default for ShutdownStats {
    fn default() -> Self {
        Self {
            phase: ShutdownPhase::Running,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            components_shutdown: Vec::new(),
            failed_components: Vec::new(),
            forced_termination: false,
        }
    }
}

/// Component that can be gracefully shut down
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<()>;

    /// Called if graceful shutdown fails or times out
    async fn force_shutdown(&self) -> Result<()> {
        self.shutdown().await
    }
}

/// Coordinates draining in-flight events and stopping components in order
pub struct GracefulShutdown {
    config: ShutdownConfig,
    phase: Arc<RwLock<ShutdownPhase>>,
    stats: Arc<RwLock<ShutdownStats>>,
    shutdown_notifier: broadcast::Sender<ShutdownPhase>,
    components: RwLock<Vec<Box<dyn ShutdownComponent>>>,
    active_operations: Semaphore,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(10);
        let permits = config.max_operations as usize;

        Self {
            config,
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            stats: Arc::new(RwLock::new(ShutdownStats::default())),
            shutdown_notifier: shutdown_tx,
            components: RwLock::new(Vec::new()),
            active_operations: Semaphore::new(permits),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Components stop in registration order
    pub async fn register_component(&self, component: Box<dyn ShutdownComponent>) {
        let name = component.name().to_string();
        self.components.write().await.push(component);
        debug!("Registered shutdown component: {}", name);
    }

    /// Move to draining when Ctrl+C or SIGTERM arrives
    pub fn start_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating graceful shutdown...");
                    manager.trigger_shutdown().await;
                }
                Err(err) => error!("Failed to listen for Ctrl+C signal: {}", err),
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM signal, initiating graceful shutdown...");
                        manager.trigger_shutdown().await;
                    }
                    Err(err) => error!("Failed to register SIGTERM handler: {}", err),
                }
            });
        }

        info!("Shutdown signal handlers started");
    }

    /// Wait until shutdown is requested, then run it
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut phases = self.subscribe_to_shutdown();
        while self.get_phase().await == ShutdownPhase::Running {
            match phases.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        info!("Shutdown requested, beginning graceful shutdown process...");
        self.perform_shutdown().await
    }

    pub async fn perform_shutdown(&self) -> Result<()> {
        let start_time = chrono::Utc::now();
        {
            let mut stats = self.stats.write().await;
            stats.started_at = Some(start_time);
            stats.phase = ShutdownPhase::Draining;
        }

        info!("Phase 1: Draining - no new events accepted...");
        self.set_phase(ShutdownPhase::Draining).await;

        let drain_timeout = Duration::from_secs(self.config.graceful_timeout_seconds);
        match timeout(drain_timeout, self.wait_for_operations_completion()).await {
            Ok(_) => info!("All in-flight events completed"),
            Err(_) => {
                warn!("Timeout waiting for in-flight events, proceeding with shutdown");
                self.stats.write().await.forced_termination = true;
            }
        }

        info!("Phase 2: Terminating - shutting down components...");
        self.set_phase(ShutdownPhase::Terminating).await;
        self.shutdown_all_components().await;

        let end_time = chrono::Utc::now();
        let duration = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
        {
            let mut stats = self.stats.write().await;
            stats.completed_at = Some(end_time);
            stats.duration_seconds = Some(duration);
            stats.phase = ShutdownPhase::Stopped;
        }
        self.set_phase(ShutdownPhase::Stopped).await;

        info!("Graceful shutdown completed in {:.2} seconds", duration);
        Ok(())
    }

    async fn set_phase(&self, phase: ShutdownPhase) {
        *self.phase.write().await = phase;
        let _ = self.shutdown_notifier.send(phase);
    }

    async fn wait_for_operations_completion(&self) {
        // Holding every permit means no event is being handled
        match self.active_operations.acquire_many(self.config.max_operations).await {
            Ok(_permits) => debug!("All active operations have completed"),
            Err(e) => warn!("Operation semaphore closed while draining: {}", e),
        }
    }

    async fn shutdown_all_components(&self) {
        let components = self.components.read().await;
        let component_timeout = Duration::from_secs(self.config.component_timeout_seconds);

        info!("Shutting down {} components...", components.len());

        for component in components.iter() {
            let name = component.name().to_string();
            let failure = match timeout(component_timeout, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Component '{}' shut down gracefully", name);
                    self.stats.write().await.components_shutdown.push(name);
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => "shutdown timed out".to_string(),
            };

            warn!("Component '{}' failed to shut down ({}), forcing", name, failure);
            match timeout(component_timeout, component.force_shutdown()).await {
                Ok(Ok(())) => {
                    warn!("Component '{}' force shutdown successful", name);
                    self.stats.write().await.components_shutdown.push(name);
                }
                Ok(Err(e)) => {
                    error!("Component '{}' force shutdown failed: {:#}", name, e);
                    self.stats.write().await.failed_components.push((name, e.to_string()));
                }
                Err(_) => {
                    error!("Component '{}' could not be shut down", name);
                    self.stats.write().await.failed_components.push((name, failure));
                }
            }
        }
    }

    pub async fn get_phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    pub async fn get_stats(&self) -> ShutdownStats {
        self.stats.read().await.clone()
    }

    pub async fn is_shutdown_requested(&self) -> bool {
        self.get_phase().await != ShutdownPhase::Running
    }

    pub fn subscribe_to_shutdown(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.shutdown_notifier.subscribe()
    }

    /// Request shutdown programmatically (end of input, tests)
    pub async fn trigger_shutdown(&self) {
        let mut phase = self.phase.write().await;
        if *phase == ShutdownPhase::Running {
            info!("Shutdown triggered");
            *phase = ShutdownPhase::Draining;
            let _ = self.shutdown_notifier.send(ShutdownPhase::Draining);
        }
    }

    /// Permit to handle one event; `None` once shutdown has begun
    pub async fn acquire_operation_permit(&self) -> Option<SemaphorePermit<'_>> {
        if *self.phase.read().await == ShutdownPhase::Running {
            self.active_operations.acquire().await.ok()
        } else {
            None
        }
    }
}

/// Stops the matcher pool, cancels pending deletions and writes a final flush
pub struct EngineShutdownComponent {
    engine: Arc<TriggerEngine>,
}

impl EngineShutdownComponent {
    pub fn new(engine: Arc<TriggerEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for EngineShutdownComponent {
    fn name(&self) -> &str {
        "TriggerEngine"
    }

    async fn shutdown(&self) -> Result<()> {
        self.engine.stop().await;
        let summary = self.engine.flush().await;
        if summary.failed_guilds > 0 {
            anyhow::bail!("final flush failed for {} guilds", summary.failed_guilds);
        }
        Ok(())
    }

    async fn force_shutdown(&self) -> Result<()> {
        // Workers are already gone; one more flush attempt is all that is left
        let summary = self.engine.flush().await;
        if summary.failed_guilds > 0 {
            anyhow::bail!("trigger data for {} guilds was not saved", summary.failed_guilds);
        }
        Ok(())
    }
}

/// Archives the data directory once everything else has stopped
pub struct BackupShutdownComponent {
    store: Arc<FileStore>,
}

impl BackupShutdownComponent {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for BackupShutdownComponent {
    fn name(&self) -> &str {
        "Backup"
    }

    async fn shutdown(&self) -> Result<()> {
        let path = self.store.create_backup().await?;
        info!("Shutdown backup written to {}", path.display());
        Ok(())
    }
}

/// Register the engine (and optionally the backup) and start listening for signals
pub async fn register_engine_components(
    manager: &Arc<GracefulShutdown>,
    engine: Arc<TriggerEngine>,
    backup_store: Option<Arc<FileStore>>,
) {
    manager
        .register_component(Box::new(EngineShutdownComponent::new(engine)))
        .await;
    match backup_store {
        Some(store) if manager.config().create_backup => {
            manager
                .register_component(Box::new(BackupShutdownComponent::new(store)))
                .await
        }
        _ => debug!("Shutdown backup disabled"),
    }

    manager.start_signal_handlers();
    info!("Graceful shutdown system initialized");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestComponent {
        name: String,
        shutdown_called: Arc<AtomicBool>,
        should_fail: bool,
        order: Arc<AtomicUsize>,
        position: Arc<AtomicUsize>,
    }

    impl TestComponent {
        fn new(name: &str, should_fail: bool, order: Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                shutdown_called: Arc::new(AtomicBool::new(false)),
                should_fail,
                order,
                position: Arc::new(AtomicUsize::new(usize::MAX)),
            }
        }
    }

    #[async_trait::async_trait]
    impl ShutdownComponent for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdown_called.store(true, Ordering::Relaxed);
            self.position
                .store(self.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            if self.should_fail {
                Err(anyhow::anyhow!("Test component shutdown failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_phases() {
        let shutdown_manager = GracefulShutdown::with_default_config();
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Running);

        shutdown_manager.trigger_shutdown().await;
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Draining);
        assert!(shutdown_manager.is_shutdown_requested().await);

        shutdown_manager.wait_for_shutdown().await.unwrap();
        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Stopped);
    }

    #[tokio::test]
    async fn test_components_stop_in_order_and_failures_recorded() {
        let shutdown_manager = GracefulShutdown::with_default_config();
        let order = Arc::new(AtomicUsize::new(0));

        let first = TestComponent::new("first", false, Arc::clone(&order));
        let second = TestComponent::new("second", true, Arc::clone(&order));
        let (first_called, first_pos) = (first.shutdown_called.clone(), first.position.clone());
        let second_pos = second.position.clone();

        shutdown_manager.register_component(Box::new(first)).await;
        shutdown_manager.register_component(Box::new(second)).await;
        shutdown_manager.perform_shutdown().await.unwrap();

        assert!(first_called.load(Ordering::Relaxed));
        assert_eq!(first_pos.load(Ordering::SeqCst), 0);
        // the forced attempt calls shutdown again
        assert_eq!(second_pos.load(Ordering::SeqCst), 2);

        let stats = shutdown_manager.get_stats().await;
        assert_eq!(stats.components_shutdown, vec!["first".to_string()]);
        assert_eq!(stats.failed_components.len(), 1);
        assert!(!stats.forced_termination);
    }

    #[tokio::test]
    async fn test_operation_permits_during_shutdown() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        let permit = shutdown_manager.acquire_operation_permit().await;
        assert!(permit.is_some());
        drop(permit);

        shutdown_manager.trigger_shutdown().await;
        assert!(shutdown_manager.acquire_operation_permit().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_when_operation_hangs() {
        let shutdown_manager = GracefulShutdown::new(ShutdownConfig {
            graceful_timeout_seconds: 1,
            ..ShutdownConfig::default()
        });
        let _held = shutdown_manager.acquire_operation_permit().await.unwrap();

        shutdown_manager.perform_shutdown().await.unwrap();
        assert!(shutdown_manager.get_stats().await.forced_termination);
    }
}
