use std::fs;
use std::path::PathBuf;

use xsmq::config::{load_config, ConfigError};
use xsmq::Config;

fn temp_config(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("xsmq-{}-{name}.toml", std::process::id()));
    fs::write(&path, body).expect("failed to write temp config");
    path
}

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("xsmq.toml").expect("failed to load config");

    assert_eq!(cfg.store.namespace.as_deref(), Some("xsmq"));
    assert_eq!(cfg.store.redis_url, "redis://127.0.0.1:6379");
    assert_eq!(cfg.queue.htimeout, 30);
    assert_eq!(cfg.queue.etimeout, -1);
    assert_eq!(cfg.queue.plimit, -1);
    assert_eq!(cfg.engine.claim_attempts, 5);
    assert_eq!(cfg.engine.reap_batch, 128);
    assert_eq!(cfg.engine.worker_id, None);
}

#[test]
fn load_config_reports_missing_file_and_bad_toml() {
    assert!(load_config("does-not-exist.toml").is_err());

    let path = temp_config("broken", "[queue\nhtimeout = 5\n");
    assert!(load_config(&path).is_err());
    fs::remove_file(path).ok();
}

// The only test that touches XSMQ_* variables; the others must not read them.
#[test]
fn env_overrides_file_values() {
    let path = temp_config("env", "[queue]\nhtimeout = 5\n\n[engine]\nclaim_attempts = 2\n");
    let path_str = path.to_str().unwrap();

    let from_file = Config::load(Some(path_str)).unwrap();
    assert_eq!(from_file.queue.htimeout, 5);
    assert_eq!(from_file.engine.claim_attempts, 2);

    std::env::set_var("XSMQ_HTIMEOUT", "9");
    std::env::set_var("XSMQ_NAMESPACE", "tenant");
    let overridden = Config::load(Some(path_str)).unwrap();
    assert_eq!(overridden.queue.htimeout, 9);
    assert_eq!(overridden.store.namespace.as_deref(), Some("tenant"));
    assert_eq!(overridden.engine.claim_attempts, 2);

    std::env::set_var("XSMQ_CLAIM_ATTEMPTS", "lots");
    match Config::load(Some(path_str)) {
        Err(ConfigError::Parse(msg)) => assert!(msg.contains("XSMQ_CLAIM_ATTEMPTS")),
        other => panic!("expected parse error, got {other:?}"),
    }

    std::env::set_var("XSMQ_CLAIM_ATTEMPTS", "3");
    std::env::set_var("XSMQ_HTIMEOUT", "-4");
    assert!(matches!(Config::load(Some(path_str)), Err(ConfigError::Parse(_))));

    for var in ["XSMQ_HTIMEOUT", "XSMQ_NAMESPACE", "XSMQ_CLAIM_ATTEMPTS"] {
        std::env::remove_var(var);
    }
    fs::remove_file(path).ok();
}
