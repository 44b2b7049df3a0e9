//! Integration tests for loading configuration files.

mod common;

use common::*;
use std::io::Write;
use tempfile::NamedTempFile;
use voice_relay::config::load_from;

async fn config_from(contents: &str) -> Config {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    load_from(file.path()).await.unwrap()
}

#[tokio::test]
async fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[sources]]
name = "music"
provider = "stream"
command = "music-decoder"
args = ["{{track}}"]
"#
    )
    .unwrap();

    let config: Config = load_from(file.path()).await.unwrap();

    assert!(config.enable_voice);
    assert_eq!(config.sources.len(), 1);
    assert_eq!(config.sources[0].args, vec!["{track}".to_string()]);
}

#[tokio::test]
async fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Config.toml");

    let err = load_from(&path).await.unwrap_err();
    assert!(err.to_string().contains("Config.toml"));
}

#[tokio::test]
async fn test_invalid_toml() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "sources = 42").unwrap();

    assert!(load_from(file.path()).await.is_err());
}

/// Config sources feed straight into discovery.
#[tokio::test]
async fn test_config_drives_discovery() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[sources]]
name = "quiet"
provider = "silence"

[[sources]]
name = "music"
provider = "stream"
"#
    )
    .unwrap();

    let config = load_from(file.path()).await.unwrap();
    let ctx = ProviderContext {
        bus: EventBus::new(),
    };
    let registry = SourceRegistry::discover(&config.sources, &builtin_providers(), &ctx);

    // `music` has no decoder command and is skipped
    assert_eq!(registry.names(), vec!["quiet".to_string()]);
}

/// Disabling voice leaves the registry empty even with sources configured.
#[tokio::test]
async fn test_voice_disabled_registry_is_empty() {
    let sources = r#"
[[sources]]
name = "quiet"
provider = "silence"
"#;
    let ctx = ProviderContext {
        bus: EventBus::new(),
    };

    let disabled = config_from(&format!("enable_voice = false\n{sources}")).await;
    let registry = SourceRegistry::from_config(&disabled, &ctx).unwrap();
    assert!(registry.is_empty());

    let enabled = config_from(sources).await;
    let registry = SourceRegistry::from_config(&enabled, &ctx).unwrap();
    assert_eq!(registry.names(), vec!["quiet".to_string()]);
}
