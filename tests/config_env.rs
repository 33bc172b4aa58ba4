// tests/config_env.rs
//
// Config file resolution against the real process env. Serialized because
// it changes the env and the working directory.

use std::{env, fs};

use watch_monitor::config::{MonitorConfig, ENV_CONFIG_PATH};
use watch_monitor::fetch::FetcherRegistry;
use watch_monitor::validate::validate;

const SAMPLE: &str = r#"
check_interval_secs = 90
seen_items_file = "state/seen.json"

[[source]]
tag = "dealer"
kind = "fixture"
location = "items.json"
webhook_env = "DEALER_WEBHOOK_URL_FOR_TEST"
"#;

#[serial_test::serial]
#[test]
fn resolution_order_then_env_overrides() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var(ENV_CONFIG_PATH);
    env::remove_var("CHECK_INTERVAL_SECONDS");

    // 1) Nothing on disk: defaults.
    let cfg = MonitorConfig::load(None).unwrap();
    assert_eq!(cfg.check_interval_secs, 300);
    assert!(cfg.sources.is_empty());

    // 2) ./config/monitor.toml
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(tmp.path().join("config/monitor.toml"), SAMPLE).unwrap();
    let cfg = MonitorConfig::load(None).unwrap();
    assert_eq!(cfg.check_interval_secs, 90);
    assert_eq!(cfg.sources[0].tag, "dealer");

    // 3) Env path beats the default location.
    let other = tmp.path().join("other.toml");
    fs::write(&other, "check_interval_secs = 45\n").unwrap();
    env::set_var(ENV_CONFIG_PATH, other.display().to_string());
    assert_eq!(MonitorConfig::load(None).unwrap().check_interval_secs, 45);

    // 4) Explicit path beats both, env overrides beat the file.
    env::set_var("CHECK_INTERVAL_SECONDS", "15");
    let explicit = tmp.path().join("config/monitor.toml");
    let cfg = MonitorConfig::load(Some(&explicit)).unwrap();
    assert_eq!(cfg.check_interval_secs, 15);
    assert_eq!(cfg.sources.len(), 1);

    env::remove_var("CHECK_INTERVAL_SECONDS");
    env::remove_var(ENV_CONFIG_PATH);
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn missing_explicit_file_is_an_error() {
    env::remove_var(ENV_CONFIG_PATH);
    let tmp = tempfile::tempdir().unwrap();
    let err = MonitorConfig::load(Some(&tmp.path().join("absent.toml"))).unwrap_err();
    assert!(err.to_string().contains("absent.toml"), "{err}");
}

#[serial_test::serial]
#[test]
fn validation_warns_on_unset_webhook_and_passes() {
    env::remove_var("DEALER_WEBHOOK_URL_FOR_TEST");
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg: MonitorConfig = toml::from_str(SAMPLE).unwrap();
    cfg.seen_items_file = tmp.path().join("state/seen.json");
    cfg.session_history_file = tmp.path().join("state/history.json");

    let registry = FetcherRegistry::with_defaults(&cfg).unwrap();
    let report = validate(&cfg, &registry);
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("DEALER_WEBHOOK_URL_FOR_TEST")));

    env::set_var("DEALER_WEBHOOK_URL_FOR_TEST", "https://discord.test/api/webhooks/1/x");
    let report = validate(&cfg, &registry);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    env::remove_var("DEALER_WEBHOOK_URL_FOR_TEST");
}
