//! Per-guild voice sessions and the table that owns them.
//!
//! A session owns at most one transport connection and one attached audio
//! source. The transport itself is external: it is handed a [`SourceFeed`] on
//! connect and pulls frames from it on its own send loop.

use crate::{
    error::{VoiceError, VoiceResult},
    event::{EventBus, VoiceEvent},
    ids::{ChannelId, GuildId},
    lock::PoisonlessLock,
    registry::SourceRegistry,
    sources::{silence::SilenceSource, AudioSource, Frame},
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Opens voice connections. Implemented by the voice transport client.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Connect to `channel`. The transport's send loop should start paused
    /// and pull frames from `feed` once resumed.
    ///
    /// Returns `AlreadyConnected` if the transport already holds a
    /// connection for the guild.
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        feed: SourceFeed,
    ) -> VoiceResult<Box<dyn VoiceConnection>>;
}

/// An open voice connection.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    fn channel(&self) -> ChannelId;

    async fn move_to(&mut self, channel: ChannelId) -> VoiceResult<()>;

    /// Stop the send loop (nothing is transmitted).
    async fn pause(&mut self) -> VoiceResult<()>;

    async fn resume(&mut self) -> VoiceResult<()>;

    async fn disconnect(&mut self) -> VoiceResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ConnectedNoSource,
    ConnectedWithSource { playing: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A new connection was opened
    Connected,

    /// The existing connection was moved
    Moved,

    /// Already connected to that channel, nothing done
    AlreadyThere,
}

struct Slot {
    /// Registry name of the attached source, `None` for the placeholder
    name: Option<String>,
    source: Box<dyn AudioSource>,
}

/// Shared handle to a session's current source. This is what the voice
/// transport reads frames from.
#[derive(Clone)]
pub struct SourceFeed {
    guild: GuildId,
    slot: Arc<Mutex<Slot>>,
    bus: EventBus,
}

impl SourceFeed {
    fn new(guild: GuildId, bus: EventBus) -> Self {
        Self {
            guild,
            slot: Arc::new(Mutex::new(Slot {
                name: None,
                source: Box::new(SilenceSource),
            })),
            bus,
        }
    }

    /// Pulls one frame from the attached source.
    ///
    /// A source that terminated on its own is swapped for the placeholder
    /// here, so the session falls back to having no source.
    pub fn read(&self) -> Frame {
        let mut slot = self.slot.plock();
        let frame = slot.source.read();

        if slot.source.is_terminated() {
            let name = slot.name.take().unwrap_or_default();
            let dead = std::mem::replace(&mut slot.source, Box::new(SilenceSource));
            drop(slot);

            drop(dead);
            warn!("Source `{name}` in guild {} stopped", self.guild);
            self.bus.send(VoiceEvent::SourceStopped {
                guild: self.guild,
                source: name,
            });
        }

        frame
    }

    pub fn is_compressed_format(&self) -> bool {
        self.slot.plock().source.is_compressed_format()
    }

    /// Name of the attached source, `None` while only the placeholder is in.
    pub fn attached(&self) -> Option<String> {
        self.slot.plock().name.clone()
    }

    /// Installs a new source and returns the previous one.
    fn install(&self, name: Option<String>, source: Box<dyn AudioSource>) -> Box<dyn AudioSource> {
        let mut slot = self.slot.plock();
        slot.name = name;
        std::mem::replace(&mut slot.source, source)
    }

    fn with_source<T>(&self, f: impl FnOnce(&mut dyn AudioSource) -> T) -> T {
        let mut slot = self.slot.plock();
        f(slot.source.as_mut())
    }
}

pub struct VoiceSession {
    guild: GuildId,
    connector: Arc<dyn VoiceConnector>,
    registry: Arc<SourceRegistry>,
    bus: EventBus,
    connection: Option<Box<dyn VoiceConnection>>,
    feed: SourceFeed,
    playing: bool,
    /// Set by `leave`; the table no longer owns this session
    closed: bool,
}

impl VoiceSession {
    pub fn new(
        guild: GuildId,
        connector: Arc<dyn VoiceConnector>,
        registry: Arc<SourceRegistry>,
        bus: EventBus,
    ) -> Self {
        VoiceSession {
            guild,
            connector,
            registry,
            feed: SourceFeed::new(guild, bus.clone()),
            bus,
            connection: None,
            playing: false,
            closed: false,
        }
    }

    pub fn guild(&self) -> GuildId {
        self.guild
    }

    pub fn state(&self) -> SessionState {
        match (&self.connection, self.feed.attached()) {
            (None, _) => SessionState::Disconnected,
            (Some(_), None) => SessionState::ConnectedNoSource,
            (Some(_), Some(_)) => SessionState::ConnectedWithSource {
                playing: self.playing,
            },
        }
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.connection.as_ref().map(|conn| conn.channel())
    }

    pub fn feed(&self) -> SourceFeed {
        self.feed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn create_or_move(&mut self, channel: ChannelId) -> VoiceResult<JoinOutcome> {
        match &mut self.connection {
            Some(conn) if conn.channel() == channel => Ok(JoinOutcome::AlreadyThere),
            Some(conn) => {
                conn.move_to(channel).await?;
                info!("Moved voice connection in guild {} to {channel}", self.guild);
                self.bus.send(VoiceEvent::Moved {
                    guild: self.guild,
                    channel,
                });
                Ok(JoinOutcome::Moved)
            }
            None => {
                drop(self.feed.install(None, Box::new(SilenceSource)));

                let conn = self
                    .connector
                    .connect(self.guild, channel, self.feed.clone())
                    .await?;
                self.connection = Some(conn);
                self.playing = false;

                info!("Connected to voice channel {channel} in guild {}", self.guild);
                self.bus.send(VoiceEvent::Joined {
                    guild: self.guild,
                    channel,
                });
                Ok(JoinOutcome::Connected)
            }
        }
    }

    /// Replaces the attached source with a fresh one from the registry.
    ///
    /// The new source starts paused even if the session was playing; the
    /// playing flag is kept and the caller resumes explicitly.
    pub async fn attach(&mut self, name: &str) -> VoiceResult<()> {
        if self.connection.is_none() {
            return Err(VoiceError::NoVoiceState);
        }

        let factory = self.registry.resolve(name)?;
        let source = factory(self.guild).map_err(|e| {
            error!("Failed to spawn source `{name}` for guild {}: {e:#}", self.guild);
            VoiceError::Backend(format!("{e:#}"))
        })?;

        drop(self.feed.install(Some(name.to_string()), source));

        info!("Attached source `{name}` in guild {}", self.guild);
        self.bus.send(VoiceEvent::SourceAttached {
            guild: self.guild,
            source: name.to_string(),
        });

        Ok(())
    }

    fn ensure_source(&self) -> VoiceResult<()> {
        if self.connection.is_none() {
            return Err(VoiceError::NoVoiceState);
        }
        if self.feed.attached().is_none() {
            return Err(VoiceError::NothingAttached);
        }
        Ok(())
    }

    fn connection_mut(&mut self) -> VoiceResult<&mut Box<dyn VoiceConnection>> {
        self.connection.as_mut().ok_or(VoiceError::NoVoiceState)
    }

    /// Resumes both the source and the transport's send loop.
    pub async fn play(&mut self) -> VoiceResult<()> {
        self.ensure_source()?;
        self.feed.with_source(|source| source.resume());
        self.connection_mut()?.resume().await?;
        self.playing = true;
        Ok(())
    }

    pub async fn pause(&mut self) -> VoiceResult<()> {
        self.ensure_source()?;
        self.feed.with_source(|source| source.pause());
        self.connection_mut()?.pause().await?;
        self.playing = false;
        Ok(())
    }

    pub fn queue(&mut self, item: &str) -> VoiceResult<()> {
        self.ensure_source()?;
        self.feed.with_source(|source| source.queue(item));
        Ok(())
    }

    pub fn skip(&mut self, amount: usize) -> VoiceResult<()> {
        self.ensure_source()?;
        self.feed.with_source(|source| source.skip(amount));
        Ok(())
    }

    pub fn previous(&mut self, amount: usize) -> VoiceResult<()> {
        self.ensure_source()?;
        self.feed.with_source(|source| source.previous(amount));
        Ok(())
    }

    /// What the attached source is playing, if anything.
    pub fn playing(&self) -> Option<String> {
        self.feed.with_source(|source| source.current())
    }

    /// Stops the source and disconnects. Disconnect errors are logged and
    /// ignored, the session is closed regardless.
    pub async fn leave(&mut self) {
        drop(self.feed.install(None, Box::new(SilenceSource)));

        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = conn.disconnect().await {
                warn!("Ignoring disconnect error in guild {}: {e}", self.guild);
            }
        }

        self.playing = false;
        self.closed = true;

        info!("Left voice in guild {}", self.guild);
        self.bus.send(VoiceEvent::Left { guild: self.guild });
    }
}

type SessionEntry = Arc<AsyncMutex<VoiceSession>>;

/// Process-wide guild -> session mapping. At most one session per guild.
///
/// Every operation takes the guild's session lock, so concurrent commands
/// for one guild run one after another while other guilds are unaffected.
pub struct SessionTable {
    sessions: Mutex<HashMap<GuildId, SessionEntry>>,
    connector: Arc<dyn VoiceConnector>,
    registry: Arc<SourceRegistry>,
    bus: EventBus,
}

impl SessionTable {
    pub fn new(
        connector: Arc<dyn VoiceConnector>,
        registry: Arc<SourceRegistry>,
        bus: EventBus,
    ) -> Self {
        SessionTable {
            sessions: Mutex::new(HashMap::new()),
            connector,
            registry,
            bus,
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn contains(&self, guild: GuildId) -> bool {
        self.sessions.plock().contains_key(&guild)
    }

    pub fn len(&self) -> usize {
        self.sessions.plock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.plock().is_empty()
    }

    fn entry(&self, guild: GuildId) -> Option<SessionEntry> {
        self.sessions.plock().get(&guild).cloned()
    }

    fn remove(&self, guild: GuildId, entry: &SessionEntry) {
        let mut sessions = self.sessions.plock();
        if sessions
            .get(&guild)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            sessions.remove(&guild);
        }
    }

    /// Locks the guild's live session.
    async fn session(&self, guild: GuildId) -> VoiceResult<OwnedMutexGuard<VoiceSession>> {
        let entry = self.entry(guild).ok_or(VoiceError::NoVoiceState)?;
        let session = entry.lock_owned().await;
        if session.is_closed() {
            return Err(VoiceError::NoVoiceState);
        }
        Ok(session)
    }

    /// Creates the guild's session on first use and connects or moves it.
    pub async fn create_or_move(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> VoiceResult<JoinOutcome> {
        loop {
            let entry = self
                .sessions
                .plock()
                .entry(guild)
                .or_insert_with(|| {
                    Arc::new(AsyncMutex::new(VoiceSession::new(
                        guild,
                        self.connector.clone(),
                        self.registry.clone(),
                        self.bus.clone(),
                    )))
                })
                .clone();

            let mut session = entry.lock().await;
            if session.is_closed() {
                // Lost a race with `leave`, the table has moved on
                continue;
            }

            let result = session.create_or_move(channel).await;
            if result.is_err() && session.state() == SessionState::Disconnected {
                session.closed = true;
                self.remove(guild, &entry);
            }
            return result;
        }
    }

    pub async fn attach(&self, guild: GuildId, name: &str) -> VoiceResult<()> {
        self.session(guild).await?.attach(name).await
    }

    pub async fn play(&self, guild: GuildId) -> VoiceResult<()> {
        self.session(guild).await?.play().await
    }

    pub async fn pause(&self, guild: GuildId) -> VoiceResult<()> {
        self.session(guild).await?.pause().await
    }

    pub async fn queue(&self, guild: GuildId, item: &str) -> VoiceResult<()> {
        self.session(guild).await?.queue(item)
    }

    pub async fn skip(&self, guild: GuildId, amount: usize) -> VoiceResult<()> {
        self.session(guild).await?.skip(amount)
    }

    pub async fn previous(&self, guild: GuildId, amount: usize) -> VoiceResult<()> {
        self.session(guild).await?.previous(amount)
    }

    pub async fn playing(&self, guild: GuildId) -> VoiceResult<Option<String>> {
        Ok(self.session(guild).await?.playing())
    }

    pub async fn state(&self, guild: GuildId) -> SessionState {
        match self.session(guild).await {
            Ok(session) => session.state(),
            Err(_) => SessionState::Disconnected,
        }
    }

    pub async fn channel(&self, guild: GuildId) -> Option<ChannelId> {
        self.session(guild).await.ok()?.channel()
    }

    /// The feed the transport pulls from, for the guild's live session.
    pub async fn feed(&self, guild: GuildId) -> VoiceResult<SourceFeed> {
        Ok(self.session(guild).await?.feed())
    }

    /// Tears the session down and removes it from the table.
    pub async fn leave(&self, guild: GuildId) -> VoiceResult<()> {
        let entry = self.entry(guild).ok_or(VoiceError::NoVoiceState)?;
        let mut session = entry.lock().await;
        if session.is_closed() {
            return Err(VoiceError::NoVoiceState);
        }

        session.leave().await;
        self.remove(guild, &entry);
        Ok(())
    }

    /// Leaves every guild, used on shutdown.
    pub async fn leave_all(&self) {
        let guilds: Vec<GuildId> = self.sessions.plock().keys().copied().collect();
        let results = futures::future::join_all(guilds.iter().map(|guild| self.leave(*guild))).await;
        let left = results.iter().filter(|result| result.is_ok()).count();
        info!("Left {left} voice session(s)");
    }
}
