// Engine lifecycle over the on-disk store

use std::path::Path;
use std::sync::Arc;

use retrigger::platforms::console::SurfaceCall;
use retrigger::prelude::*;
use serde_json::json;
use tempfile::tempdir;

const GUILD: u64 = 1;

struct Harness {
    engine: TriggerEngine,
    surface: Arc<DryRunSurface>,
}

async fn engine_at(root: &Path) -> Harness {
    let store = Arc::new(FileStore::open(root).await.unwrap());
    let surface = Arc::new(DryRunSurface::recording());
    let engine = TriggerEngine::new(EngineParts {
        store,
        matcher: Arc::new(InlineMatcher),
        surface: surface.clone(),
        images: Arc::new(PassthroughImages),
        compiler: PatternCompiler::new("!"),
        shutdown: Arc::new(GracefulShutdown::with_default_config()),
    });
    Harness { engine, surface }
}

fn message(id: u64, content: &str) -> TriggerEvent {
    TriggerEvent {
        guild_id: GUILD,
        message_id: id,
        channel_id: 10,
        channel_nsfw: false,
        author: Author {
            id: 500,
            name: "joe".to_string(),
            ..Author::default()
        },
        content: content.to_string(),
        attachments: Vec::new(),
        is_edit: false,
        is_command: false,
        timestamp: chrono::Utc::now(),
    }
}

#[test_log::test(tokio::test)]
async fn test_triggers_and_counts_survive_restart() {
    let temp_dir = tempdir().unwrap();

    let first = engine_at(temp_dir.path()).await;
    first.engine.start().await.unwrap();
    first
        .engine
        .create_trigger(GUILD, "greet", r"(?i)\bhello\b", vec![Action::Text { text: "Hi $(user)!".into() }], 42)
        .await
        .unwrap();

    let reports = first.engine.handle_event(&message(1, "Hello everyone")).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].all_succeeded());

    let sent: Vec<_> = first
        .surface
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            SurfaceCall::Send { message, .. } => message.content,
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec!["Hi joe!".to_string()]);

    let flushed = first.engine.flush().await;
    assert_eq!(flushed.failed_guilds, 0);
    first.engine.stop().await;

    let second = engine_at(temp_dir.path()).await;
    let summary = second.engine.start().await.unwrap();
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.quarantined, 0);

    let trigger = second.engine.registry().get(GUILD, "greet").await.unwrap();
    assert_eq!(trigger.author_id, 42);
    let state = second.engine.registry().ledger().snapshot(GUILD, "greet").await.unwrap();
    assert_eq!(state.count, 1);
}

#[test_log::test(tokio::test)]
async fn test_bad_records_are_quarantined_and_preserved() {
    let temp_dir = tempdir().unwrap();
    let guilds = temp_dir.path().join("guilds");
    std::fs::create_dir_all(&guilds).unwrap();

    let bad_record = json!({
        "name": "broken",
        "regex": "(unclosed",
        "actions": [{ "kind": "delete" }],
        "author": 7
    });
    let document = json!({
        "settings": { "allow_multiple": false, "bypass": false },
        "trigger_list": {
            "good": {
                "name": "good",
                "regex": "\\bspam\\b",
                "actions": [{ "kind": "delete" }],
                "author": 7,
                "created_at": 5
            },
            "broken": bad_record
        }
    });
    std::fs::write(guilds.join(format!("{}.json", GUILD)), serde_json::to_vec_pretty(&document).unwrap()).unwrap();

    let harness = engine_at(temp_dir.path()).await;
    let summary = harness.engine.start().await.unwrap();
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.quarantined, 1);

    let quarantined = harness.engine.registry().quarantined(GUILD).await;
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].key, "broken");

    // The key stays reserved while its record is quarantined
    let err = harness
        .engine
        .create_trigger(GUILD, "broken", "fine", vec![Action::Delete], 7)
        .await
        .unwrap_err();
    assert!(matches!(err, TriggerError::DuplicateName { .. }));

    let reports = harness.engine.handle_event(&message(2, "buy spam now")).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(harness
        .surface
        .calls()
        .contains(&SurfaceCall::Delete { channel_id: 10, message_id: 2 }));

    harness.engine.flush().await;
    let stored: serde_json::Value =
        serde_json::from_slice(&std::fs::read(guilds.join(format!("{}.json", GUILD))).unwrap()).unwrap();
    assert_eq!(stored["trigger_list"]["broken"], bad_record);
    assert_eq!(stored["trigger_list"]["good"]["count"], 1);
}

#[test_log::test(tokio::test)]
async fn test_unreadable_guild_document_is_skipped_and_left_alone() {
    let temp_dir = tempdir().unwrap();
    let guilds = temp_dir.path().join("guilds");
    std::fs::create_dir_all(&guilds).unwrap();

    let good = json!({
        "trigger_list": {
            "spam": {
                "name": "spam",
                "regex": "\\bspam\\b",
                "actions": [{ "kind": "delete" }],
                "author": 7,
                "created_at": 5
            }
        }
    });
    std::fs::write(guilds.join(format!("{}.json", GUILD)), serde_json::to_vec_pretty(&good).unwrap()).unwrap();
    let truncated = br#"{"settings": {"allow_multiple": true}, "trigger_list": {"#;
    let broken_path = guilds.join("2.json");
    std::fs::write(&broken_path, truncated).unwrap();

    let harness = engine_at(temp_dir.path()).await;
    let summary = harness.engine.start().await.unwrap();
    assert_eq!(summary.guilds, 1);
    assert_eq!(summary.loaded, 1);
    assert_eq!(summary.failed_guilds, vec![2]);
    assert!(harness.engine.registry().get(GUILD, "spam").await.is_some());

    let reports = harness.engine.handle_event(&message(3, "spam again")).await.unwrap();
    assert_eq!(reports.len(), 1);

    // Writes aimed at the unreadable guild fail instead of replacing its file
    harness
        .engine
        .create_trigger(2, "fresh", "hello", vec![Action::Delete], 7)
        .await
        .unwrap();
    let flushed = harness.engine.flush().await;
    assert_eq!(flushed.failed_guilds, 1);
    assert_eq!(std::fs::read(&broken_path).unwrap(), truncated.to_vec());
}

#[test_log::test(tokio::test)]
async fn test_timeout_setting_persists() {
    let temp_dir = tempdir().unwrap();

    let first = engine_at(temp_dir.path()).await;
    first.engine.start().await.unwrap();
    assert_eq!(first.engine.set_trigger_timeout(4, Confirmation::Confirmed).await.unwrap(), 4);
    first.engine.flush().await;

    let second = engine_at(temp_dir.path()).await;
    second.engine.start().await.unwrap();
    assert_eq!(second.engine.trigger_timeout().await, std::time::Duration::from_secs(4));
}
