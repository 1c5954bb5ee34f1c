use sigma_prometheus_listener::logging;

#[test]
fn test_init_installs_once() -> anyhow::Result<()> {
    assert!(logging::init(true));
    assert!(!logging::init(false));
    tracing::info!(component = "listener", "subscriber installed");
    Ok(())
}
