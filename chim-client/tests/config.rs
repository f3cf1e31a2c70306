use std::net::Ipv4Addr;

use chim_client::config::{
    MAX_CONFIG_BYTES, SavedClientConfig, load_saved_config_from_path, save_saved_config_to_path,
};

#[test]
fn config_roundtrip_save_load() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    let cfg = SavedClientConfig {
        identity: "192.168.1.44".to_owned(),
        group: Ipv4Addr::new(239, 0, 0, 9),
        port: 5008,
    };

    save_saved_config_to_path(&path, &cfg).expect("save config");
    let loaded = load_saved_config_from_path(&path).expect("load config");
    assert_eq!(loaded, Some(cfg));
}

#[test]
fn missing_config_is_not_an_error() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let loaded = load_saved_config_from_path(&dir.path().join("config.json")).expect("load");
    assert!(loaded.is_none());
}

#[test]
fn invalid_config_is_refused_on_save_and_load() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");

    let bad = SavedClientConfig::new("has:colon");
    assert!(save_saved_config_to_path(&path, &bad).is_err());
    assert!(!path.exists());

    std::fs::write(&path, r#"{"identity":"","group":"224.1.1.1","port":5007}"#)
        .expect("write config");
    let err = load_saved_config_from_path(&path).expect_err("empty identity rejected");
    assert!(err.contains("Identity is invalid"), "{err}");
}

#[test]
fn oversized_config_is_refused() {
    let dir = tempfile::tempdir().expect("create tempdir");
    let path = dir.path().join("config.json");
    std::fs::write(&path, vec![b' '; MAX_CONFIG_BYTES as usize + 1]).expect("write config");

    let err = load_saved_config_from_path(&path).expect_err("oversized config rejected");
    assert!(err.contains("too large"), "{err}");
}
