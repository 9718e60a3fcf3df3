//! # ReTrigger
//!
//! Regex-driven chat triggers for moderation bots. Moderators define named
//! triggers binding a pattern to one or more actions; the engine evaluates
//! every inbound message against them without letting a pathological
//! pattern stall the host.
//!
//! ## Features
//!
//! - **Isolated Matching**: patterns run in a pool of worker processes with a
//!   hard timeout; a runaway search costs one killed worker, nothing more
//! - **Backtracking Dialect**: lookaround and backreferences via `fancy-regex`
//! - **Cooldowns**: per guild, channel or author, checked and consumed atomically
//! - **Multi-Action Triggers**: every action runs and reports independently
//! - **Durable Storage**: write-through JSON documents with periodic flushes
//!   and quarantine for records that fail to load
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retrigger::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let shutdown = Arc::new(GracefulShutdown::with_default_config());
//!     let engine = TriggerEngine::new(EngineParts {
//!         store: Arc::new(MemoryStore::new()),
//!         matcher: Arc::new(WorkerPool::new(WorkerPoolConfig::current_exe(4)?)),
//!         surface: Arc::new(DryRunSurface::new()),
//!         images: Arc::new(PassthroughImages),
//!         compiler: PatternCompiler::new("!"),
//!         shutdown,
//!     });
//!     engine.start().await?;
//!
//!     engine
//!         .create_trigger(1, "greet", r"(?i)\bhello\b", vec![Action::Text { text: "Hi $(user)!".into() }], 42)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod config;
pub mod error;
pub mod platforms;
pub mod store;
pub mod types;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::dispatcher::{ActionOutcome, DispatchReport};
    pub use crate::bot::matcher::{BoundedMatcher, InlineMatcher, MatchError, MatchLimit, WorkerPool, WorkerPoolConfig};
    pub use crate::bot::pattern::{Pattern, PatternCompiler};
    pub use crate::bot::registry::{Editor, TriggerRegistry};
    pub use crate::bot::shutdown::{GracefulShutdown, ShutdownConfig};
    pub use crate::bot::trigger::{FlagEdit, Trigger, TriggerEdit};
    pub use crate::bot::{Confirmation, EngineParts, TriggerEngine};
    pub use crate::config::EngineConfig;
    pub use crate::error::TriggerError;
    pub use crate::platforms::console::{DryRunSurface, PassthroughImages};
    pub use crate::platforms::{ActionSurface, ImageProcessor};
    pub use crate::store::{FileStore, MemoryStore, TriggerStore};
    pub use crate::types::{Action, ActionKind, Attachment, Author, CooldownStyle, MatchResult, TriggerEvent};
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
