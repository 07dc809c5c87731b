//! Coordinator wiring smoke tests.
//!
//! Backend launches need real agent binaries, so these tests exercise the
//! wiring around them: construction, config validation, the session store
//! path, and idempotent deletion.

use std::sync::Arc;

use bc_broker::runtime::coordinator::SessionCoordinator;
use bc_domain::config::BrokerConfig;

fn config_in(dir: &tempfile::TempDir) -> Arc<BrokerConfig> {
    let mut config = BrokerConfig::default();
    config.server.state_path = dir.path().to_path_buf();
    Arc::new(config)
}

#[tokio::test]
async fn construction_registers_all_adapters_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = SessionCoordinator::new(config_in(&dir), None, None, None).unwrap();

    assert!(coordinator.list_sessions().is_empty());
    assert!(coordinator.get_session("nope").is_none());
    assert!(dir.path().join("sessions").exists());
}

#[tokio::test]
async fn invalid_config_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BrokerConfig::default();
    config.server.state_path = dir.path().to_path_buf();
    config.rate_limit.burst_size = 0;
    assert!(SessionCoordinator::new(Arc::new(config), None, None, None).is_err());
}

#[tokio::test]
async fn delete_unknown_session_is_false() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = SessionCoordinator::new(config_in(&dir), None, None, None).unwrap();
    assert!(!coordinator.delete_session("ghost").await);
}

#[tokio::test]
async fn create_session_with_unknown_adapter_fails() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = SessionCoordinator::new(config_in(&dir), None, None, None).unwrap();
    let err = coordinator
        .create_session(bc_broker::runtime::coordinator::CreateSessionParams {
            adapter_name: Some("not-real".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown adapter"));
}

#[tokio::test]
async fn stop_is_safe_when_empty() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = SessionCoordinator::new(config_in(&dir), None, None, None).unwrap();
    coordinator.stop().await;
}
