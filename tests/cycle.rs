// tests/cycle.rs
//
// One-cycle behaviour of the orchestrator: diffing, delivery, failure
// isolation and what ends up on disk.

mod common;

use std::sync::Arc;

use common::{build_monitor, test_config, RecordingNotifier, ScriptedFetcher, Step};
use watch_monitor::error::{DeliveryError, FetchError};
use watch_monitor::memory::ScriptedProbe;
use watch_monitor::monitor::Phase;
use watch_monitor::store::{PersistenceStore, SeenLedger};

fn probe() -> Arc<ScriptedProbe> {
    Arc::new(ScriptedProbe::fixed(100.0))
}

fn seed_ledger(cfg: &watch_monitor::MonitorConfig, tag: &str, keys: &[&str]) {
    let store = PersistenceStore::from_config(cfg);
    let mut ledger = SeenLedger::new();
    ledger.absorb(tag, keys.iter().copied(), 100);
    store.save_ledger(&ledger).unwrap();
}

#[tokio::test]
async fn only_unseen_items_are_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &["siteA"]);
    seed_ledger(&cfg, "siteA", &["w1", "w2"]);

    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1", "w2", "w3"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(cfg, fetcher, notifier.clone(), probe());

    let summary = monitor.run_cycle().await;

    assert_eq!(notifier.batches(), vec![("siteA".to_string(), vec!["w3".to_string()])]);
    assert_eq!(monitor.ledger().keys("siteA"), vec!["w1", "w2", "w3"]);
    let s = &summary.sources["siteA"];
    assert_eq!((s.items_seen, s.items_new, s.notified), (3, 1, 1));
    assert_eq!(monitor.phase(), Phase::Idle);

    // Persisted once per cycle, after diffing.
    let on_disk = monitor.store().load_ledger().unwrap();
    assert_eq!(on_disk.keys("siteA"), vec!["w1", "w2", "w3"]);
}

#[tokio::test]
async fn second_cycle_with_same_items_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1", "w2"]);
    fetcher.push_keys("siteA", &["w2", "w1"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(test_config(dir.path(), &["siteA"]), fetcher, notifier.clone(), probe());

    monitor.run_cycle().await;
    let second = monitor.run_cycle().await;

    assert_eq!(notifier.batches().len(), 1);
    assert_eq!(second.items_new(), 0);
    assert_eq!(monitor.history().len(), 2);
}

#[tokio::test]
async fn one_failing_source_does_not_touch_the_other() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &["good", "bad"]);
    seed_ledger(&cfg, "bad", &["old"]);

    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("good", &["g1", "g2"]);
    fetcher.push("bad", Step::Fail(FetchError::Parse("markup changed".into())));
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(cfg, fetcher, notifier.clone(), probe());

    let summary = monitor.run_cycle().await;

    assert_eq!(summary.fetch_errors(), 1);
    assert_eq!(summary.sources["bad"].fetch_errors, 1);
    assert!(summary.sources["bad"].error.as_deref().unwrap().contains("markup changed"));
    assert_eq!(summary.sources["good"].items_new, 2);
    assert_eq!(monitor.ledger().keys("bad"), vec!["old"]);
    assert_eq!(monitor.ledger().keys("good"), vec!["g1", "g2"]);
    assert!(notifier.keys_for("bad").is_empty());
}

#[tokio::test]
async fn delivery_failure_still_marks_items_seen() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1", "w2"]);
    fetcher.push_keys("siteA", &["w1", "w2"]);
    let notifier = RecordingNotifier::failing(DeliveryError::Rejected {
        channel: "discord",
        status: 500,
    });
    let mut monitor = build_monitor(test_config(dir.path(), &["siteA"]), fetcher, notifier.clone(), probe());

    let first = monitor.run_cycle().await;
    assert_eq!(first.sources["siteA"].delivery_errors, 2);
    assert_eq!(first.sources["siteA"].notified, 0);
    assert_eq!(monitor.ledger().len("siteA"), 2);

    let second = monitor.run_cycle().await;
    assert_eq!(second.items_new(), 0);
    assert_eq!(notifier.batches().len(), 1);
}

#[tokio::test]
async fn partial_delivery_is_split_into_counts() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["a", "b", "c"]);
    let notifier = RecordingNotifier::failing(DeliveryError::Partial { failed: 1, total: 3 });
    let mut monitor = build_monitor(test_config(dir.path(), &["siteA"]), fetcher, notifier, probe());

    let s = monitor.run_cycle().await;
    assert_eq!(s.sources["siteA"].notified, 2);
    assert_eq!(s.sources["siteA"].delivery_errors, 1);
}

#[tokio::test]
async fn batches_keep_fetch_order_per_source() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("a", &["a3", "a1", "a2"]);
    fetcher.push_keys("b", &["b2", "b1"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(test_config(dir.path(), &["a", "b"]), fetcher, notifier.clone(), probe());

    monitor.run_cycle().await;

    let batches = notifier.batches();
    assert_eq!(batches.len(), 2, "one batch per source");
    assert_eq!(notifier.keys_for("a"), vec!["a3", "a1", "a2"]);
    assert_eq!(notifier.keys_for("b"), vec!["b2", "b1"]);
}

#[tokio::test]
async fn disabled_notifications_still_update_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["siteA"]);
    cfg.notifications_enabled = false;
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(cfg, fetcher, notifier.clone(), probe());

    let s = monitor.run_cycle().await;
    assert_eq!(s.items_new(), 1);
    assert_eq!(s.notified(), 0);
    assert!(notifier.batches().is_empty());
    assert!(monitor.ledger().contains("siteA", "w1"));
}

#[tokio::test]
async fn disabled_sources_are_not_fetched() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["on", "off"]);
    cfg.sources[1].enabled = false;
    let fetcher = ScriptedFetcher::new();
    let mut monitor = build_monitor(cfg, fetcher.clone(), RecordingNotifier::new(), probe());

    let s = monitor.run_cycle().await;
    assert_eq!(fetcher.calls(), 1);
    assert!(s.sources.contains_key("on"));
    assert!(!s.sources.contains_key("off"));
}

#[tokio::test]
async fn per_source_cap_applies_during_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["siteA"]);
    cfg.max_items_per_source = 3;
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["a", "b"]);
    fetcher.push_keys("siteA", &["c", "d"]);
    let mut monitor = build_monitor(cfg, fetcher, RecordingNotifier::new(), probe());

    monitor.run_cycle().await;
    monitor.run_cycle().await;
    assert_eq!(monitor.ledger().keys("siteA"), vec!["b", "c", "d"]);
}

#[tokio::test]
async fn summary_records_memory_samples() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(ScriptedProbe::new([Some(100.0), Some(112.5)]));
    let mut monitor = build_monitor(
        test_config(dir.path(), &["siteA"]),
        ScriptedFetcher::new(),
        RecordingNotifier::new(),
        probe,
    );

    let s = monitor.run_cycle().await;
    assert_eq!(s.memory_start_mb, Some(100.0));
    assert_eq!(s.memory_end_mb, Some(112.5));
    assert_eq!(s.memory_delta_mb, Some(12.5));
    assert!(s.ended_at >= s.started_at);
}

#[tokio::test]
async fn unreadable_memory_does_not_stop_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(ScriptedProbe::new([None]));
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1"]);
    let mut monitor = build_monitor(test_config(dir.path(), &["siteA"]), fetcher, RecordingNotifier::new(), probe);

    let s = monitor.run_cycle().await;
    assert_eq!(s.memory_delta_mb, None);
    assert_eq!(s.items_new(), 1);
}

#[tokio::test]
async fn reset_seen_clears_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &["a", "b"]);
    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("a", &["1", "2"]);
    fetcher.push_keys("b", &["3"]);
    fetcher.push_keys("a", &["1", "2"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(cfg, fetcher, notifier.clone(), probe());

    monitor.run_cycle().await;
    let removed = monitor.reset_seen(&["a".to_string()]).unwrap();
    assert_eq!(removed["a"], 2);
    assert_eq!(monitor.store().load_ledger().unwrap().len("a"), 0);
    assert_eq!(monitor.store().load_ledger().unwrap().len("b"), 1);

    // Items come back as new after a reset.
    monitor.run_cycle().await;
    assert_eq!(notifier.keys_for("a"), vec!["1", "2", "1", "2"]);
}

#[tokio::test]
async fn corrupt_ledger_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &["siteA"]);
    std::fs::write(&cfg.seen_items_file, "not json").unwrap();

    let res = watch_monitor::Monitor::new(
        Arc::new(cfg),
        common::registry_with(ScriptedFetcher::new()),
        RecordingNotifier::new(),
        probe(),
    );
    assert!(matches!(res, Err(watch_monitor::LoadError::Corrupt { .. })));
}

#[tokio::test]
async fn oversized_state_is_trimmed_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &["siteA"]);
    seed_ledger(&cfg, "siteA", &["a", "b", "c", "d", "e"]);
    cfg.max_items_per_source = 2;

    let monitor = build_monitor(cfg, ScriptedFetcher::new(), RecordingNotifier::new(), probe());
    assert_eq!(monitor.ledger().keys("siteA"), vec!["d", "e"]);
}

#[tokio::test]
async fn failed_save_keeps_state_and_next_cycle_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &["siteA"]);
    seed_ledger(&cfg, "siteA", &["w1"]);

    let fetcher = ScriptedFetcher::new();
    fetcher.push_keys("siteA", &["w1", "w2"]);
    fetcher.push_keys("siteA", &["w1", "w2", "w3"]);
    let notifier = RecordingNotifier::new();
    let mut monitor = build_monitor(cfg, fetcher, notifier.clone(), probe());

    // A directory squatting on the tmp path makes the ledger write fail.
    let blocker = dir.path().join("seen_items.json.tmp");
    std::fs::create_dir(&blocker).unwrap();

    let first = monitor.run_cycle().await;
    assert_eq!(first.items_new(), 1);
    assert_eq!(monitor.ledger().keys("siteA"), vec!["w1", "w2"]);
    assert_eq!(monitor.store().load_ledger().unwrap().keys("siteA"), vec!["w1"]);
    assert_eq!(monitor.store().load_history().unwrap().len(), 1);

    std::fs::remove_dir(&blocker).unwrap();
    let second = monitor.run_cycle().await;

    // w2 is not announced twice even though the first save was lost.
    assert_eq!(second.items_new(), 1);
    assert_eq!(notifier.keys_for("siteA"), vec!["w2", "w3"]);
    let on_disk = monitor.store().load_ledger().unwrap();
    assert_eq!(&on_disk, monitor.ledger());
    assert_eq!(on_disk.keys("siteA"), vec!["w1", "w2", "w3"]);
    assert!(!blocker.exists());
}
