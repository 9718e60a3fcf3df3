// Matching through real worker processes spawned from the built binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use retrigger::prelude::*;

const CATASTROPHIC: &str = r"^(?:a|(?=a)a)+$";

fn pool(size: usize) -> WorkerPool {
    WorkerPool::new(WorkerPoolConfig {
        size,
        program: PathBuf::from(env!("CARGO_BIN_EXE_retrigger")),
        args: vec!["match-worker".to_string()],
        backtrack_limit: usize::MAX,
    })
}

fn hostile_input() -> String {
    format!("{}!", "a".repeat(40))
}

#[test_log::test(tokio::test)]
async fn test_matches_in_worker() {
    let pool = pool(2);
    let pattern = PatternCompiler::new("!").compile(r"(\w+)@(\w+)\.com").unwrap();

    let found = pool
        .find(&pattern, "mail me at joe@example.com", MatchLimit::Timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.matched, "joe@example.com");
    assert_eq!(found.groups, vec![Some("joe".to_string()), Some("example".to_string())]);

    let missed = pool
        .find(&pattern, "nothing here", MatchLimit::Timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(missed.is_none());

    pool.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_catastrophic_pattern_times_out_and_pool_recovers() {
    let pool = pool(1);
    let compiler = PatternCompiler::new("!");
    let hostile = compiler.compile(CATASTROPHIC).unwrap();
    pool.warm_up(1).await.unwrap();

    let limit = Duration::from_secs(1);
    let started = Instant::now();
    let result = pool.find(&hostile, &hostile_input(), MatchLimit::Timeout(limit)).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(MatchError::TimedOut(limit)));
    assert!(elapsed >= limit);
    assert!(elapsed < limit + Duration::from_secs(3), "timeout took {:?}", elapsed);

    // The killed worker is replaced on demand
    let simple = compiler.compile(r"\bhello\b").unwrap();
    let found = pool
        .find(&simple, "well hello there", MatchLimit::Timeout(limit))
        .await
        .unwrap();
    assert!(found.is_some());

    let stats = pool.stats().await;
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.workers_spawned, 2);

    pool.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_unbounded_matches_share_the_pool_bound() {
    let pool = Arc::new(pool(1));
    let compiler = PatternCompiler::new("!");
    let hostile = compiler.compile(CATASTROPHIC).unwrap();

    let busy = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.find(&hostile, &hostile_input(), MatchLimit::Unbounded).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The only worker is stuck, so a second unbounded search has to queue
    let simple = compiler.compile(r"\bhello\b").unwrap();
    let queued = tokio::time::timeout(
        Duration::from_millis(500),
        pool.find(&simple, "hello", MatchLimit::Unbounded),
    )
    .await;
    assert!(queued.is_err(), "second search ran beside the first: {:?}", queued);
    assert_eq!(pool.stats().await.workers_spawned, 1);

    // Shutdown kills the busy worker instead of waiting on it
    pool.shutdown().await;
    let stopped = tokio::time::timeout(Duration::from_secs(5), busy)
        .await
        .expect("busy search was not interrupted")
        .unwrap();
    assert_eq!(stopped, Err(MatchError::ShuttingDown));
    assert_eq!(pool.stats().await.failures, 1);
}

#[test_log::test(tokio::test)]
async fn test_shut_down_pool_refuses_work() {
    let pool = pool(1);
    let pattern = PatternCompiler::new("!").compile("x").unwrap();
    pool.shutdown().await;

    let result = pool.find(&pattern, "x", MatchLimit::Timeout(Duration::from_secs(1))).await;
    assert_eq!(result, Err(MatchError::ShuttingDown));
}
