use crate::backend::ProcessConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs::read_to_string;

const CONFIG_FILE: &str = "Config.toml";

/// One named audio source and the provider that builds it.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SourceConfig {
    /// Name users pass to `attach`
    pub name: String,

    /// Entry in the provider catalogue (`stream`, `silence`)
    pub provider: String,

    /// Decoder executable for streaming providers
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Opaque credential material handed to the provider
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl SourceConfig {
    pub fn process_config(&self) -> Result<ProcessConfig> {
        let command = self
            .command
            .clone()
            .with_context(|| format!("source `{}` has no decoder command", self.name))?;

        Ok(ProcessConfig {
            command,
            args: self.args.clone(),
            env: self.credentials.clone(),
        })
    }
}

#[cfg(feature = "discord")]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscordConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Guild (server) ID for registering slash commands, global if unset
    pub discord_guild_id: Option<u64>,

    /// Prefix for text commands
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[cfg(feature = "discord")]
fn default_prefix() -> String {
    "!".to_string()
}

fn default_enable_voice() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Gates the audio pipeline. The bot keeps running without it, minus
    /// sources and voice connections
    #[serde(default = "default_enable_voice")]
    pub enable_voice: bool,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[cfg(feature = "discord")]
    pub discord: Option<DiscordConfig>,
}

pub async fn load() -> Result<Config> {
    load_from(CONFIG_FILE).await
}

pub async fn load_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config = read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config = toml::from_str(&config)?;

    Ok(config)
}
