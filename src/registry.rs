//! Maps source names to factories for guild-bound audio sources.
//!
//! The registry is assembled once at startup from the configured sources and
//! a static catalogue of providers, then shared read-only.

use crate::{
    backend::ProcessBackend,
    config::{Config, SourceConfig},
    error::{VoiceError, VoiceResult},
    event::EventBus,
    ids::GuildId,
    resample,
    sources::{silence::SilenceSource, stream::StreamingSource, AudioSource},
};
use anyhow::Result;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// A provider's control adapter: builds sources bound to a guild.
pub trait ControlAdapter: Send + Sync {
    fn spawn_source(&self, guild: GuildId) -> Result<Box<dyn AudioSource>>;
}

pub type SourceFactory = Arc<dyn Fn(GuildId) -> Result<Box<dyn AudioSource>> + Send + Sync>;

/// Shared with every provider loader.
#[derive(Clone)]
pub struct ProviderContext {
    pub bus: EventBus,
}

/// Loads a provider and returns the control adapters it exposes. A valid
/// provider exposes exactly one.
pub type ProviderLoader =
    fn(&ProviderContext, &SourceConfig) -> Result<Vec<Arc<dyn ControlAdapter>>>;

/// Providers compiled into the binary, keyed by the name used in the
/// `provider` field of a source's config.
pub fn builtin_providers() -> HashMap<&'static str, ProviderLoader> {
    let mut providers: HashMap<&'static str, ProviderLoader> = HashMap::new();
    providers.insert("stream", load_stream_provider);
    providers.insert("silence", load_silence_provider);
    providers
}

#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry to run with. Empty when voice is disabled, the resampler
    /// is pre-warmed and the configured sources discovered otherwise.
    pub fn from_config(config: &Config, ctx: &ProviderContext) -> Result<Self> {
        if !config.enable_voice {
            info!("Voice disabled in config, running without audio sources");
            return Ok(SourceRegistry::new());
        }

        // Build the FFT plan up front so the first attach doesn't stall
        resample::prewarm()?;

        let registry = Self::discover(&config.sources, &builtin_providers(), ctx);
        info!("{} source(s) available: {:?}", registry.len(), registry.names());
        Ok(registry)
    }

    /// Builds the registry from the configured sources. A provider that fails
    /// to load is logged and skipped, the rest are still registered.
    pub fn discover(
        sources: &[SourceConfig],
        catalogue: &HashMap<&'static str, ProviderLoader>,
        ctx: &ProviderContext,
    ) -> Self {
        let mut registry = SourceRegistry::new();

        for source_config in sources {
            let name = &source_config.name;
            let adapter = match load_adapter(catalogue, ctx, name, source_config) {
                Ok(adapter) => adapter,
                Err(e) => {
                    error!("Failed to load source `{name}`: {e:#}");
                    continue;
                }
            };

            let factory: SourceFactory = Arc::new(move |guild: GuildId| adapter.spawn_source(guild));
            match registry.register(name, factory) {
                Ok(()) => info!(
                    "Registered source `{name}` (provider `{}`)",
                    source_config.provider
                ),
                Err(e) => error!("Skipping source `{name}`: {e}"),
            }
        }

        registry
    }

    pub fn register(&mut self, name: &str, factory: SourceFactory) -> VoiceResult<()> {
        if self.factories.contains_key(name) {
            return Err(VoiceError::DuplicateSource(name.to_string()));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> VoiceResult<SourceFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| VoiceError::UnknownSource(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

fn load_adapter(
    catalogue: &HashMap<&'static str, ProviderLoader>,
    ctx: &ProviderContext,
    name: &str,
    source_config: &SourceConfig,
) -> Result<Arc<dyn ControlAdapter>> {
    let loader = catalogue
        .get(source_config.provider.as_str())
        .ok_or_else(|| anyhow::anyhow!("unknown provider `{}`", source_config.provider))?;

    let mut adapters = loader(ctx, source_config)?;
    if adapters.len() != 1 {
        anyhow::bail!(
            "provider `{}` for `{name}` exposes {} control adapters, expected exactly one",
            source_config.provider,
            adapters.len()
        );
    }

    Ok(adapters.remove(0))
}

struct StreamControl {
    backend: ProcessBackend,
    bus: EventBus,
}

impl ControlAdapter for StreamControl {
    fn spawn_source(&self, guild: GuildId) -> Result<Box<dyn AudioSource>> {
        let source = StreamingSource::spawn(&self.backend, self.bus.clone(), guild)?;
        Ok(Box::new(source))
    }
}

fn load_stream_provider(
    ctx: &ProviderContext,
    source_config: &SourceConfig,
) -> Result<Vec<Arc<dyn ControlAdapter>>> {
    let process = source_config.process_config()?;
    let adapter: Arc<dyn ControlAdapter> = Arc::new(StreamControl {
        backend: ProcessBackend::new(process),
        bus: ctx.bus.clone(),
    });
    Ok(vec![adapter])
}

struct SilenceControl;

impl ControlAdapter for SilenceControl {
    fn spawn_source(&self, _guild: GuildId) -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(SilenceSource))
    }
}

fn load_silence_provider(
    _ctx: &ProviderContext,
    _source_config: &SourceConfig,
) -> Result<Vec<Arc<dyn ControlAdapter>>> {
    let adapter: Arc<dyn ControlAdapter> = Arc::new(SilenceControl);
    Ok(vec![adapter])
}
