//! Discord integration: songbird as the voice transport and poise commands
//! forwarding to [`VoiceCommands`].

use crate::{
    commands::{CommandContext, VoiceChannel, VoiceCommands},
    config::DiscordConfig,
    constants::{CHANNELS, OUTPUT_SAMPLE_RATE, SAMPLE_SIZE},
    error::{VoiceError, VoiceResult},
    event::EventBus,
    ids::{ChannelId, GuildId},
    registry::SourceRegistry,
    session::{SessionTable, SourceFeed, VoiceConnection, VoiceConnector},
    sources::Frame,
};
use anyhow::Result;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use poise::serenity_prelude as serenity;
use songbird::{
    input::{Input, RawAdapter},
    tracks::{Track, TrackHandle},
    SerenityInit, Songbird,
};
use std::{
    io::{Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::io::MediaSource;

type Context<'a> = poise::Context<'a, VoiceCommands, anyhow::Error>;

// ============================================================================
// Voice Audio Source
// ============================================================================

/// Pull-based reader over a session's feed. Songbird's mixer calls
/// `Read::read()`, which pulls 20ms frames and converts them to f32.
struct FeedReader {
    feed: SourceFeed,
    frame: Vec<u8>,
    position: usize,
}

impl FeedReader {
    fn new(feed: SourceFeed) -> Self {
        Self {
            feed,
            frame: Vec::new(),
            position: 0,
        }
    }

    fn next_sample(&mut self) -> i16 {
        if self.position >= self.frame.len() {
            self.frame = match self.feed.read() {
                // Keep the track alive, songbird would end it on EOF
                Frame::End => Frame::Silence.into_bytes(),
                frame => frame.into_bytes(),
            };
            self.position = 0;
        }

        let sample = LittleEndian::read_i16(&self.frame[self.position..]);
        self.position += SAMPLE_SIZE;
        sample
    }
}

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // f32 samples, 4 bytes each
        let samples_needed = buf.len() / 4;

        for i in 0..samples_needed {
            let value = self.next_sample() as f32 / 32768.0;
            buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }

        // Pad with silence if needed
        buf[samples_needed * 4..].fill(0);

        Ok(buf.len())
    }
}

impl Seek for FeedReader {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        // Live audio source doesn't support seeking
        Ok(0)
    }
}

impl MediaSource for FeedReader {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

fn create_voice_input(feed: SourceFeed) -> Input {
    if feed.is_compressed_format() {
        warn!("Attached source produces compressed frames, songbird expects raw PCM");
    }
    let adapter = RawAdapter::new(FeedReader::new(feed), OUTPUT_SAMPLE_RATE, CHANNELS as u32);

    adapter.into()
}

// ============================================================================
// Voice transport
// ============================================================================

fn transport_error(e: impl std::fmt::Display) -> VoiceError {
    VoiceError::Transport(e.to_string())
}

pub struct SongbirdConnector {
    manager: Arc<Songbird>,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        feed: SourceFeed,
    ) -> VoiceResult<Box<dyn VoiceConnection>> {
        let guild_id = serenity::GuildId::new(guild.0);

        if let Some(call) = self.manager.get(guild_id) {
            if call.lock().await.current_channel().is_some() {
                return Err(VoiceError::AlreadyConnected);
            }
        }

        let call = self
            .manager
            .join(guild_id, serenity::ChannelId::new(channel.0))
            .await
            .map_err(transport_error)?;

        // The send loop starts paused until the session is played
        let track = Track::new(create_voice_input(feed)).pause();
        let track = call.lock().await.play_only(track);

        Ok(Box::new(SongbirdConnection {
            manager: self.manager.clone(),
            guild: guild_id,
            channel,
            track,
        }))
    }
}

struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild: serenity::GuildId,
    channel: ChannelId,
    track: TrackHandle,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    async fn move_to(&mut self, channel: ChannelId) -> VoiceResult<()> {
        // Joining with an existing call moves it
        self.manager
            .join(self.guild, serenity::ChannelId::new(channel.0))
            .await
            .map_err(transport_error)?;
        self.channel = channel;
        Ok(())
    }

    async fn pause(&mut self) -> VoiceResult<()> {
        self.track.pause().map_err(transport_error)
    }

    async fn resume(&mut self) -> VoiceResult<()> {
        self.track.play().map_err(transport_error)
    }

    async fn disconnect(&mut self) -> VoiceResult<()> {
        self.manager.remove(self.guild).await.map_err(transport_error)
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Snapshot of the invoking guild from the cache.
fn command_context(ctx: Context<'_>) -> Result<CommandContext> {
    let guild = ctx
        .guild()
        .ok_or_else(|| anyhow::anyhow!("Could not get guild"))?;

    let author_channel = guild
        .voice_states
        .get(&ctx.author().id)
        .and_then(|state| state.channel_id)
        .map(|id| ChannelId(id.get()));

    let voice_channels = guild
        .channels
        .values()
        .filter(|channel| channel.kind == serenity::ChannelType::Voice)
        .map(|channel| VoiceChannel {
            id: ChannelId(channel.id.get()),
            name: channel.name.clone(),
        })
        .collect();

    Ok(CommandContext {
        guild: GuildId(guild.id.get()),
        author_channel,
        voice_channels,
    })
}

/// Joins a voice channel.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn join(
    ctx: Context<'_>,
    #[description = "Voice channel name"]
    #[rest]
    channel: String,
) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().join(&command_ctx, &channel).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Summons the bot to join your voice channel.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn summon(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().summon(&command_ctx).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Stops playing and leaves the voice channel.
#[poise::command(prefix_command, slash_command, guild_only, aliases("stop"))]
async fn leave(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().leave(&command_ctx).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Attaches an audio source to the voice session.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn attach(
    ctx: Context<'_>,
    #[description = "Source name"] source: String,
) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().attach(&command_ctx, &source).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Starts or resumes playback.
#[poise::command(prefix_command, slash_command, guild_only, aliases("resume"))]
async fn play(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().play(&command_ctx).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Pauses playback.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn pause(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().pause(&command_ctx).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Queues a track, e.g. `track:4uLU6hMCjMI75M1A2tKUQC`.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn queue(
    ctx: Context<'_>,
    #[description = "Track reference"]
    #[rest]
    item: String,
) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().queue(&command_ctx, &item).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Skips tracks.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn skip(
    ctx: Context<'_>,
    #[description = "Number of tracks"] amount: Option<usize>,
) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().skip(&command_ctx, amount.unwrap_or(1)).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Goes back to previous tracks.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn previous(
    ctx: Context<'_>,
    #[description = "Number of tracks"] amount: Option<usize>,
) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().previous(&command_ctx, amount.unwrap_or(1)).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Shows info about the currently played song.
#[poise::command(prefix_command, slash_command, guild_only)]
async fn playing(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let command_ctx = command_context(ctx)?;
    let reply = ctx.data().playing(&command_ctx).await;
    ctx.say(reply).await?;
    Ok(())
}

/// Lists the sources that can be attached.
#[poise::command(prefix_command, slash_command)]
async fn sources(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let reply = ctx.data().sources();
    ctx.say(reply).await?;
    Ok(())
}

/// Initialize the Discord bot. Returns the session table so the caller can
/// leave all voice channels on shutdown.
///
/// With `enable_voice` unset the bot still runs, but songbird is not
/// registered and only the commands that don't touch a voice connection are
/// offered.
pub async fn init(
    discord_config: &DiscordConfig,
    registry: Arc<SourceRegistry>,
    bus: &EventBus,
    enable_voice: bool,
) -> Result<Arc<SessionTable>> {
    let manager = Songbird::serenity();
    let connector = Arc::new(SongbirdConnector::new(manager.clone()));
    let sessions = Arc::new(SessionTable::new(connector, registry, bus.clone()));
    let voice_commands = VoiceCommands::new(sessions.clone());

    let guild_id = discord_config.discord_guild_id.map(serenity::GuildId::new);
    let token = discord_config.discord_token.clone();

    let commands = if enable_voice {
        vec![
            join(),
            summon(),
            leave(),
            attach(),
            play(),
            pause(),
            queue(),
            skip(),
            previous(),
            playing(),
            sources(),
        ]
    } else {
        vec![sources()]
    };

    // Build the poise framework with prefix and slash commands
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands,
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(discord_config.prefix.clone()),
                ..Default::default()
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            let voice_commands = voice_commands.clone();
            Box::pin(async move {
                match guild_id {
                    // Register commands for the specific guild (faster updates during development)
                    Some(guild_id) => {
                        poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            guild_id,
                        )
                        .await?
                    }
                    None => {
                        poise::builtins::register_globally(ctx, &framework.options().commands)
                            .await?
                    }
                }

                info!("Ready: {} (ID: {})", ready.user.name, ready.user.id);
                Ok(voice_commands)
            })
        })
        .build();

    let intents = serenity::GatewayIntents::GUILDS
        | serenity::GatewayIntents::GUILD_MESSAGES
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_VOICE_STATES;

    let mut builder = serenity::ClientBuilder::new(&token, intents).framework(framework);
    if enable_voice {
        builder = builder.register_songbird_with(manager);
    }
    let client = builder.await?;

    // Spawn the Discord client in a separate task
    tokio::spawn(async move {
        let mut client = client;
        if let Err(e) = client.start().await {
            error!("Discord client error: {:?}", e);
        }
    });

    Ok(sessions)
}
