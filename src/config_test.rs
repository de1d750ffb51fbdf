use super::*;

#[test]
fn defaults_match_engine_timings() {
    let config = ClientConfig::default();
    assert_eq!(config.connect_timeout, Duration::from_secs(30));
    assert_eq!(config.error_grace_period, Duration::from_secs(1));
    assert_eq!(config.reconnect_delay, Duration::from_millis(500));
    assert_eq!(config.retry_delay, Duration::from_secs(5));
    assert_eq!(config.keepalive_interval, Duration::from_secs(28));
    assert_eq!(config.recent_frames, 100);
    assert!(config.auto_reconnect);
    assert!(!config.static_preview);
}

#[test]
fn env_parse_falls_back_on_missing_key() {
    assert_eq!(env_parse("NOTEBOOK_TEST_KEY_THAT_IS_NEVER_SET", 17_u64), 17);
}
