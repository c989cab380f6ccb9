use std::io::Write;
use std::time::Duration;

use crawlnode::config::secrets::ExposeSecret;
use crawlnode::config::{Config, NodeConfig};
use crawlnode::model::JobClass;

// Env vars are process-wide, so every env case runs in this one test.
#[test]
fn config_from_env_requires_dispatcher_and_node() {
    unsafe {
        std::env::remove_var("DISPATCHER_URL");
        std::env::remove_var("NODE_ID");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("DISPATCHER_URL", "wss://dispatch.example.com/ws");
        std::env::set_var("NODE_ID", "node-7");
        std::env::set_var("DISPATCHER_TOKEN", "tok-123");
        std::env::remove_var("DATABASE_URL");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.dispatcher_url, "wss://dispatch.example.com/ws");
    assert_eq!(config.node_id, "node-7");
    assert_eq!(
        config.dispatcher_token.as_ref().map(|t| t.expose_secret().to_string()),
        Some("tok-123".to_string())
    );
    assert!(config.database_url.is_none());
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::remove_var("DISPATCHER_URL");
        std::env::remove_var("NODE_ID");
        std::env::remove_var("DISPATCHER_TOKEN");
    }
}

#[test]
fn node_config_defaults() {
    let config = NodeConfig::default();
    assert_eq!(config.queue_capacity, 24);
    assert_eq!(config.ceiling(JobClass::Interactive), 4);
    assert_eq!(config.ceiling(JobClass::Batch), 4);
    assert_eq!(config.daily_cap, 500);
    assert_eq!(config.refresh_interval(), Duration::from_secs(86_400));
    assert_eq!(config.base_lifespan(), Duration::from_millis(90_000));
    assert_eq!(config.drain_recheck(), Duration::from_secs(15));
    assert_eq!(config.process_timeout(), Duration::from_secs(10));
}

#[test]
fn node_config_toml_overrides_only_named_keys() {
    let config = NodeConfig::from_toml(
        r#"
        batch_ceiling = 2
        daily_cap = 50
        "#,
    )
    .unwrap();
    assert_eq!(config.ceiling(JobClass::Batch), 2);
    assert_eq!(config.daily_cap, 50);
    assert_eq!(config.queue_capacity, 24);
}

#[test]
fn node_config_rejects_unknown_keys_and_zero_limits() {
    assert!(NodeConfig::from_toml("queue_capcity = 10").is_err());
    assert!(NodeConfig::from_toml("queue_capacity = 0").is_err());
    assert!(NodeConfig::from_toml("interactive_ceiling = 0").is_err());
}

#[test]
fn node_config_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "queue_capacity = 8\nbase_lifespan_ms = 1000").unwrap();

    let config = NodeConfig::load(file.path()).unwrap();
    assert_eq!(config.queue_capacity, 8);
    assert_eq!(config.base_lifespan(), Duration::from_secs(1));

    assert!(NodeConfig::load(std::path::Path::new("/nonexistent/crawlnode.toml")).is_err());
}
