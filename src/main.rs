#[macro_use]
extern crate log;

use anyhow::Result;
use std::sync::Arc;
use voice_relay::{
    config, event,
    event::EventBus,
    registry::{ProviderContext, SourceRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "voice_relay=debug,warn");
    }
    pretty_env_logger::init();

    let config = config::load().await?;

    let bus = EventBus::new();
    event::debug(&bus);

    let ctx = ProviderContext { bus: bus.clone() };
    let registry = Arc::new(SourceRegistry::from_config(&config, &ctx)?);

    #[cfg(feature = "discord")]
    let sessions = match &config.discord {
        Some(discord_config) => {
            Some(voice_relay::discord::init(
                discord_config,
                registry.clone(),
                &bus,
                config.enable_voice,
            )
            .await?)
        }
        None => {
            warn!("No [discord] section in config, voice transport not started");
            None
        }
    };

    #[cfg(not(feature = "discord"))]
    warn!("Built without a voice transport, enable the `discord` feature");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    #[cfg(feature = "discord")]
    if let Some(sessions) = sessions {
        sessions.leave_all().await;
    }

    Ok(())
}
