//! Loading configuration files from disk.

use std::fs;

use tempfile::TempDir;

use storage_proxy_server::config::{ByteSize, Config, LogFormat};

const SAMPLE: &str = include_str!("../../../storage-proxy.sample.toml");

#[test]
fn sample_config_is_valid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("storage-proxy.toml");
    fs::write(&path, SAMPLE).unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.storage_proxy.node_id, "i-storage-01");

    assert_eq!(config.storage_proxy.max_upload_size, ByteSize(100 << 30));
    assert_eq!(config.logging.format, LogFormat::Text);
    assert_eq!(
        config.volume.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["local", "quota-enabled"]
    );
    assert_eq!(config.volume["quota-enabled"].root().to_str(), Some("/vfroot/shared/tenant-a"));
}

#[test]
fn load_reports_path_on_failure() {
    let dir = TempDir::new().unwrap();

    let missing = dir.path().join("absent.toml");
    let err = Config::load(&missing).unwrap_err();
    assert!(format!("{err:#}").contains("absent.toml"));

    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, SAMPLE.replace("num-proc = 1", "num-proc = 0")).unwrap();
    let err = Config::load(&invalid).unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("Invalid configuration"), "{msg}");
    assert!(msg.contains("num-proc"), "{msg}");
}
