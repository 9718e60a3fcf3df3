// src/bot/matcher.rs - Time-bounded pattern matching on an isolated worker pool

use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex, Semaphore};

use crate::bot::pattern::Pattern;
use crate::bot::worker::{WorkerReply, WorkerRequest};
use crate::error::TriggerError;
use crate::types::MatchResult;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("pattern search timed out after {0:?}")]
    TimedOut(Duration),

    #[error("match worker failure: {0}")]
    Worker(String),

    #[error("matcher is shut down")]
    ShuttingDown,
}

impl From<MatchError> for TriggerError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::TimedOut(limit) => TriggerError::MatchTimeout(limit),
            MatchError::Worker(reason) => TriggerError::Matcher(reason),
            MatchError::ShuttingDown => TriggerError::ShuttingDown,
        }
    }
}

/// How long a single match may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchLimit {
    Timeout(Duration),
    /// Bypass mode: no enforcement at all
    Unbounded,
}

/// Executes patterns without letting a runaway match stall the caller
#[async_trait]
pub trait BoundedMatcher: Send + Sync {
    /// `Ok(None)` is a normal non-match; timeouts and worker faults are errors
    async fn find(&self, pattern: &Pattern, text: &str, limit: MatchLimit) -> Result<Option<MatchResult>, MatchError>;

    /// Stop accepting work and release isolation resources
    async fn shutdown(&self) {}
}

async fn find_on_blocking_thread(pattern: &Pattern, text: &str) -> Result<Option<MatchResult>, MatchError> {
    let pattern = pattern.clone();
    let text = text.to_string();
    tokio::task::spawn_blocking(move || pattern.find(&text))
        .await
        .map_err(|e| MatchError::Worker(format!("match thread panicked: {}", e)))?
        .map_err(|e| MatchError::Worker(e.to_string()))
}

/// Runs matches on the blocking thread pool.
///
/// A timed-out search is abandoned, not stopped: the thread keeps running
/// until the regex engine gives up on its own. Only suitable where patterns
/// are trusted or the backtrack limit is set; production use goes through
/// [`WorkerPool`].
#[derive(Debug, Default)]
pub struct InlineMatcher;

#[async_trait]
impl BoundedMatcher for InlineMatcher {
    async fn find(&self, pattern: &Pattern, text: &str, limit: MatchLimit) -> Result<Option<MatchResult>, MatchError> {
        match limit {
            MatchLimit::Unbounded => find_on_blocking_thread(pattern, text).await,
            MatchLimit::Timeout(timeout) => tokio::time::timeout(timeout, find_on_blocking_thread(pattern, text))
                .await
                .map_err(|_| MatchError::TimedOut(timeout))?,
        }
    }
}

/// Configuration for the match worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on concurrently running matches (and live workers)
    pub size: usize,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub backtrack_limit: usize,
}

impl WorkerPoolConfig {
    /// Workers are this executable re-launched in `match-worker` mode
    pub fn current_exe(size: usize) -> std::io::Result<Self> {
        Ok(Self {
            size,
            program: std::env::current_exe()?,
            args: vec!["match-worker".to_string()],
            backtrack_limit: usize::MAX,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub size: usize,
    pub idle_workers: usize,
    pub workers_spawned: u64,
    pub requests: u64,
    pub matches: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub average_match_ms: f64,
}

/// A live worker process with its pipes
struct MatchWorker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    spawned_at: Instant,
    use_count: u64,
}

impl MatchWorker {
    async fn spawn(config: &WorkerPoolConfig) -> Result<Self, MatchError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MatchError::Worker(format!("failed to spawn {}: {}", config.program.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MatchError::Worker("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MatchError::Worker("worker stdout unavailable".to_string()))?;

        debug!("Spawned match worker pid {:?}", child.id());
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            spawned_at: Instant::now(),
            use_count: 0,
        })
    }

    async fn roundtrip(&mut self, request: &WorkerRequest) -> Result<WorkerReply, MatchError> {
        let mut line = serde_json::to_vec(request).map_err(|e| MatchError::Worker(e.to_string()))?;
        line.push(b'\n');

        self.stdin
            .write_all(&line)
            .await
            .map_err(|e| MatchError::Worker(format!("write to worker failed: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| MatchError::Worker(format!("write to worker failed: {}", e)))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|e| MatchError::Worker(format!("read from worker failed: {}", e)))?;
        if read == 0 {
            return Err(MatchError::Worker("worker exited unexpectedly".to_string()));
        }

        self.use_count += 1;
        serde_json::from_str(&reply).map_err(|e| MatchError::Worker(format!("bad worker reply: {}", e)))
    }

    /// Hard stop. The regex engine is never asked to cooperate.
    async fn terminate(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Worker already gone: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap match worker: {}", e);
        }
        debug!(
            "Terminated match worker after {} requests ({:.1}s old)",
            self.use_count,
            self.spawned_at.elapsed().as_secs_f64()
        );
    }
}

/// Fixed-size pool of match worker processes.
///
/// A semaphore bounds concurrent matches; callers beyond the bound queue.
/// Workers that time out or misbehave are killed and replaced lazily by the
/// next request, so one pathological pattern never poisons later matches.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<MatchWorker>>,
    stats: Mutex<PoolStats>,
    next_request: AtomicU64,
    closed: AtomicBool,
    /// Flipped once on shutdown; wakes requests holding a busy worker
    closing: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let size = config.size.max(1);
        info!("Match worker pool configured with {} workers ({})", size, config.program.display());
        Self {
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            stats: Mutex::new(PoolStats {
                size,
                ..PoolStats::default()
            }),
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closing: watch::channel(false).0,
            config,
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().await.clone();
        stats.idle_workers = self.idle.lock().await.len();
        stats
    }

    /// Spawn workers up front so the first events do not pay for it
    pub async fn warm_up(&self, count: usize) -> Result<(), MatchError> {
        let count = count.min(self.config.size.max(1));
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            spawned.push(MatchWorker::spawn(&self.config).await?);
        }
        self.stats.lock().await.workers_spawned += count as u64;
        self.idle.lock().await.extend(spawned);
        Ok(())
    }

    async fn checkout(&self) -> Result<MatchWorker, MatchError> {
        if let Some(worker) = self.idle.lock().await.pop() {
            return Ok(worker);
        }
        let worker = MatchWorker::spawn(&self.config).await?;
        self.stats.lock().await.workers_spawned += 1;
        Ok(worker)
    }

    async fn checkin(&self, worker: MatchWorker) {
        if self.closed.load(Ordering::SeqCst) {
            worker.terminate().await;
        } else {
            self.idle.lock().await.push(worker);
        }
    }

    async fn run(&self, pattern: &str, text: &str, limit: MatchLimit) -> Result<Option<MatchResult>, MatchError> {
        // Subscribe before checking the flag so a concurrent shutdown is never missed
        let mut closing = self.closing.subscribe();
        if self.closed.load(Ordering::SeqCst) {
            return Err(MatchError::ShuttingDown);
        }
        let _permit = self.permits.acquire().await.map_err(|_| MatchError::ShuttingDown)?;

        let mut worker = self.checkout().await?;
        let request = WorkerRequest {
            id: self.next_request.fetch_add(1, Ordering::Relaxed),
            pattern: pattern.to_string(),
            text: text.to_string(),
            backtrack_limit: self.config.backtrack_limit,
        };

        let started = Instant::now();
        let search = async {
            match limit {
                MatchLimit::Timeout(timeout) => tokio::time::timeout(timeout, worker.roundtrip(&request))
                    .await
                    .unwrap_or(Err(MatchError::TimedOut(timeout))),
                MatchLimit::Unbounded => worker.roundtrip(&request).await,
            }
        };
        let outcome = tokio::select! {
            outcome = search => outcome,
            _ = closing.changed() => Err(MatchError::ShuttingDown),
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(reply) if reply.id() == request.id => {
                self.checkin(worker).await;
                match reply {
                    WorkerReply::Matched { result, .. } => Ok(Some(result)),
                    WorkerReply::NoMatch { .. } => Ok(None),
                    WorkerReply::Failed { error, .. } => Err(MatchError::Worker(error)),
                }
            }
            Ok(reply) => {
                error!("Match worker answered request {} with id {}", request.id, reply.id());
                worker.terminate().await;
                Err(MatchError::Worker("worker reply out of sequence".to_string()))
            }
            Err(e) => {
                match &e {
                    MatchError::TimedOut(timeout) => {
                        warn!("Pattern `{}` exceeded {:?}, killing its worker", pattern, timeout)
                    }
                    MatchError::ShuttingDown => debug!("Killing busy match worker for shutdown"),
                    MatchError::Worker(_) => {}
                }
                worker.terminate().await;
                Err(e)
            }
        };

        let mut stats = self.stats.lock().await;
        stats.requests += 1;
        match &result {
            Ok(Some(_)) => stats.matches += 1,
            Ok(None) => {}
            Err(MatchError::TimedOut(_)) => stats.timeouts += 1,
            Err(_) => stats.failures += 1,
        }
        // Simple moving average
        let alpha = 0.1;
        stats.average_match_ms = if stats.requests == 1 {
            elapsed_ms
        } else {
            alpha * elapsed_ms + (1.0 - alpha) * stats.average_match_ms
        };

        result
    }
}

#[async_trait]
impl BoundedMatcher for WorkerPool {
    /// Bypass requests skip the timeout but still hold a pool permit, so the
    /// pool size bounds every concurrent evaluation
    async fn find(&self, pattern: &Pattern, text: &str, limit: MatchLimit) -> Result<Option<MatchResult>, MatchError> {
        self.run(pattern.expanded(), text, limit).await
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closing.send_replace(true);
        self.permits.close();

        let workers: Vec<MatchWorker> = self.idle.lock().await.drain(..).collect();
        let count = workers.len();
        for worker in workers {
            worker.terminate().await;
        }
        info!("Match worker pool shut down ({} idle workers stopped)", count);
    }
}
