//! User-facing voice commands.
//!
//! Every command returns the text to reply with; errors are rendered here
//! and never propagate to the chat layer.

use crate::{
    error::{VoiceError, VoiceResult},
    ids::{ChannelId, GuildId},
    session::{JoinOutcome, SessionTable},
};
use deunicode::deunicode;
use std::sync::Arc;

/// A voice channel visible in the invoking guild.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoiceChannel {
    pub id: ChannelId,
    pub name: String,
}

/// What the chat layer knows about the invocation.
#[derive(Clone, Debug)]
pub struct CommandContext {
    pub guild: GuildId,

    /// Voice channel the author is currently in
    pub author_channel: Option<ChannelId>,

    pub voice_channels: Vec<VoiceChannel>,
}

impl CommandContext {
    /// First voice channel whose name, transliterated to ASCII, starts with
    /// `query`.
    pub fn find_channel(&self, query: &str) -> Option<&VoiceChannel> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        self.voice_channels
            .iter()
            .find(|channel| deunicode(&channel.name).trim().starts_with(query))
    }

    fn channel_name(&self, id: ChannelId) -> String {
        self.voice_channels
            .iter()
            .find(|channel| channel.id == id)
            .map(|channel| channel.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

#[derive(Clone)]
pub struct VoiceCommands {
    sessions: Arc<SessionTable>,
}

fn reply(result: VoiceResult<String>) -> String {
    match result {
        Ok(text) => text,
        Err(e) => {
            debug!("Voice command failed: {e}");
            e.user_message()
        }
    }
}

impl VoiceCommands {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    async fn connect(&self, ctx: &CommandContext, channel: ChannelId) -> VoiceResult<String> {
        let name = ctx.channel_name(channel);
        let text = match self.sessions.create_or_move(ctx.guild, channel).await? {
            JoinOutcome::Connected => format!("Joined {name}."),
            JoinOutcome::Moved => format!("Moved to {name}."),
            JoinOutcome::AlreadyThere => format!("Already in {name}."),
        };
        Ok(text)
    }

    /// Joins the voice channel whose name starts with `channel_name`.
    pub async fn join(&self, ctx: &CommandContext, channel_name: &str) -> String {
        let result = async {
            let channel = ctx
                .find_channel(channel_name)
                .ok_or_else(|| VoiceError::InvalidTarget(channel_name.to_string()))?;
            self.connect(ctx, channel.id).await
        };
        reply(result.await)
    }

    /// Joins (or moves to) the author's voice channel.
    pub async fn summon(&self, ctx: &CommandContext) -> String {
        match ctx.author_channel {
            Some(channel) => reply(self.connect(ctx, channel).await),
            None => "You are not in a voice channel.".to_string(),
        }
    }

    pub async fn leave(&self, ctx: &CommandContext) -> String {
        reply(
            self.sessions
                .leave(ctx.guild)
                .await
                .map(|()| "Left the voice channel.".to_string()),
        )
    }

    pub async fn attach(&self, ctx: &CommandContext, source_name: &str) -> String {
        reply(
            self.sessions
                .attach(ctx.guild, source_name.trim())
                .await
                .map(|()| format!("Attached `{}`.", source_name.trim())),
        )
    }

    pub async fn play(&self, ctx: &CommandContext) -> String {
        reply(
            self.sessions
                .play(ctx.guild)
                .await
                .map(|()| "Playing.".to_string()),
        )
    }

    pub async fn pause(&self, ctx: &CommandContext) -> String {
        reply(
            self.sessions
                .pause(ctx.guild)
                .await
                .map(|()| "Paused.".to_string()),
        )
    }

    pub async fn queue(&self, ctx: &CommandContext, item: &str) -> String {
        reply(
            self.sessions
                .queue(ctx.guild, item)
                .await
                .map(|()| format!("Queued {}.", item.trim())),
        )
    }

    pub async fn skip(&self, ctx: &CommandContext, amount: usize) -> String {
        reply(
            self.sessions
                .skip(ctx.guild, amount)
                .await
                .map(|()| format!("Skipped {amount}.")),
        )
    }

    pub async fn previous(&self, ctx: &CommandContext, amount: usize) -> String {
        reply(
            self.sessions
                .previous(ctx.guild, amount)
                .await
                .map(|()| format!("Went back {amount}.")),
        )
    }

    /// Describes what is currently playing.
    pub async fn playing(&self, ctx: &CommandContext) -> String {
        match self.sessions.playing(ctx.guild).await {
            Ok(Some(current)) => format!("Currently playing: {current}"),
            Ok(None) | Err(VoiceError::NoVoiceState) => "Not playing anything.".to_string(),
            Err(e) => e.user_message(),
        }
    }

    /// Lists the registered source names.
    pub fn sources(&self) -> String {
        let names = self.sessions.registry().names();
        if names.is_empty() {
            "No sources available.".to_string()
        } else {
            format!("Available sources: {}", names.join(", "))
        }
    }
}
