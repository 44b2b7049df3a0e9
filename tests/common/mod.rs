//! Test infrastructure for voice-relay integration tests.
//!
//! Provides a recording voice transport, an in-memory decode backend and
//! helpers for pulling frames the way a transport's send loop would.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

// Re-export key types from the main crate
pub use voice_relay::backend::{
    BackendEvent, BackendEvents, DecodeBackend, DecodeSession, Feeder, LoadId, ProcessBackend,
    ProcessConfig, TrackHandle,
};
pub use voice_relay::commands::{CommandContext, VoiceChannel, VoiceCommands};
pub use voice_relay::config::{Config, SourceConfig};
pub use voice_relay::constants::{INPUT_FRAME_BYTES, OUTPUT_FRAME_BYTES};
pub use voice_relay::error::{VoiceError, VoiceResult};
pub use voice_relay::event::{EventBus, Subscriber, VoiceEvent};
pub use voice_relay::ids::{ChannelId, GuildId};
pub use voice_relay::pipe::{PipeRead, PipeWriter};
pub use voice_relay::registry::{
    builtin_providers, ControlAdapter, ProviderContext, ProviderLoader, SourceFactory,
    SourceRegistry,
};
pub use voice_relay::session::{
    JoinOutcome, SessionState, SessionTable, SourceFeed, VoiceConnection, VoiceConnector,
};
pub use voice_relay::sources::{
    silence::SilenceSource,
    stream::{PlayerState, StreamingSource},
    AudioSource, Frame,
};

pub const GUILD: GuildId = GuildId(1000);
pub const GENERAL: ChannelId = ChannelId(1);
pub const MUSIC_ROOM: ChannelId = ChannelId(2);

// ============================================================================
// Voice transport
// ============================================================================

/// Everything the transport was asked to do, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Connect(GuildId, ChannelId),
    Move(GuildId, ChannelId),
    Pause(GuildId),
    Resume(GuildId),
    Disconnect(GuildId),
}

/// A voice transport that records calls instead of talking to a server.
#[derive(Clone, Default)]
pub struct MockConnector {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    /// Guilds with an open connection, used to report `AlreadyConnected`
    open: Arc<Mutex<HashSet<GuildId>>>,
    feeds: Arc<Mutex<HashMap<GuildId, SourceFeed>>>,
    fail_connect: bool,
    fail_disconnect: bool,
    connect_delay: Option<Duration>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect is refused.
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Disconnects report an error (after disconnecting).
    pub fn failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, TransportCall::Connect(..)))
            .count()
    }

    /// The feed handed over on the guild's last connect.
    pub fn feed(&self, guild: GuildId) -> Option<SourceFeed> {
        self.feeds.lock().unwrap().get(&guild).cloned()
    }

    /// Pretend the transport already holds a connection for `guild`.
    pub fn mark_open(&self, guild: GuildId) {
        self.open.lock().unwrap().insert(guild);
    }
}

#[async_trait]
impl VoiceConnector for MockConnector {
    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        feed: SourceFeed,
    ) -> VoiceResult<Box<dyn VoiceConnection>> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect {
            return Err(VoiceError::Transport("connection refused".to_string()));
        }
        if !self.open.lock().unwrap().insert(guild) {
            return Err(VoiceError::AlreadyConnected);
        }

        self.calls
            .lock()
            .unwrap()
            .push(TransportCall::Connect(guild, channel));
        self.feeds.lock().unwrap().insert(guild, feed);

        Ok(Box::new(MockConnection {
            guild,
            channel,
            calls: self.calls.clone(),
            open: self.open.clone(),
            fail_disconnect: self.fail_disconnect,
        }))
    }
}

struct MockConnection {
    guild: GuildId,
    channel: ChannelId,
    calls: Arc<Mutex<Vec<TransportCall>>>,
    open: Arc<Mutex<HashSet<GuildId>>>,
    fail_disconnect: bool,
}

impl MockConnection {
    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl VoiceConnection for MockConnection {
    fn channel(&self) -> ChannelId {
        self.channel
    }

    async fn move_to(&mut self, channel: ChannelId) -> VoiceResult<()> {
        self.record(TransportCall::Move(self.guild, channel));
        self.channel = channel;
        Ok(())
    }

    async fn pause(&mut self) -> VoiceResult<()> {
        self.record(TransportCall::Pause(self.guild));
        Ok(())
    }

    async fn resume(&mut self) -> VoiceResult<()> {
        self.record(TransportCall::Resume(self.guild));
        Ok(())
    }

    async fn disconnect(&mut self) -> VoiceResult<()> {
        self.record(TransportCall::Disconnect(self.guild));
        self.open.lock().unwrap().remove(&self.guild);
        if self.fail_disconnect {
            return Err(VoiceError::Transport("gateway gone".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Decode backend
// ============================================================================

/// Decodes every track into `frames_per_track` frames of a loud sine.
#[derive(Clone)]
pub struct MemoryBackend {
    pub frames_per_track: usize,
    /// Loading this track id fails
    pub failing_track: Option<String>,
    /// Starting a session fails
    pub fail_start: bool,
    loads: Arc<Mutex<Vec<String>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new(frames_per_track: usize) -> Self {
        Self {
            frames_per_track,
            failing_track: None,
            fail_start: false,
            loads: Default::default(),
            shutdowns: Default::default(),
        }
    }

    pub fn failing_on(mut self, track: &str) -> Self {
        self.failing_track = Some(track.to_string());
        self
    }

    /// Track ids in the order they were loaded.
    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    /// Number of decode sessions torn down so far.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl DecodeBackend for MemoryBackend {
    fn start(&self, writer: PipeWriter, events: BackendEvents) -> Result<Box<dyn DecodeSession>> {
        if self.fail_start {
            anyhow::bail!("decoder unavailable");
        }
        let (paused, _) = watch::channel(true);

        Ok(Box::new(MemorySession {
            backend: self.clone(),
            writer,
            events,
            paused,
            current: None,
        }))
    }
}

struct MemorySession {
    backend: MemoryBackend,
    writer: PipeWriter,
    events: BackendEvents,
    paused: watch::Sender<bool>,
    current: Option<Feeder>,
}

#[async_trait]
impl DecodeSession for MemorySession {
    async fn load(&mut self, track: &TrackHandle, load: LoadId) -> Result<()> {
        self.stop().await?;
        if self.backend.failing_track.as_deref() == Some(track.id.as_str()) {
            anyhow::bail!("track {track} is not available");
        }
        self.backend.loads.lock().unwrap().push(track.id.clone());

        let token = CancellationToken::new();
        let cancelled = token.clone();

        let frames = self.backend.frames_per_track;
        let writer = self.writer.clone();
        let events = self.events.clone();
        let mut paused = self.paused.subscribe();
        let track = track.clone();

        let task = async move {
            let frame = sine_frame();
            for _ in 0..frames {
                loop {
                    let is_paused = *paused.borrow_and_update();
                    if !is_paused {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = cancelled.cancelled() => return,
                        changed = paused.changed() => if changed.is_err() { return },
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => return,
                    written = writer.write_all(&frame) => if written.is_err() { return },
                }
            }
            let _ = events.send(BackendEvent::TrackFinished { track, load });
        };
        self.current = Some(Feeder::spawn(token, task));

        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        self.paused.send_replace(false);
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        self.paused.send_replace(true);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(feeder) = self.current.take() {
            feeder.abort().await;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.backend.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.writer.close();
        if let Some(feeder) = self.current.take() {
            feeder.abort().await;
        }
    }
}

/// One input frame of a 440Hz sine at half scale.
pub fn sine_frame() -> Vec<u8> {
    let samples: Vec<i16> = (0..INPUT_FRAME_BYTES / 4)
        .flat_map(|i| {
            let t = i as f64 / 44100.0;
            let value = (16000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16;
            [value, value]
        })
        .collect();

    let mut bytes = vec![0u8; INPUT_FRAME_BYTES];
    LittleEndian::write_i16_into(&samples, &mut bytes);
    bytes
}

// ============================================================================
// Helpers
// ============================================================================

/// Registry with a streaming source named `music` over `backend` and a
/// silence source named `silence`.
pub fn test_registry(backend: MemoryBackend, bus: &EventBus) -> Arc<SourceRegistry> {
    let mut registry = SourceRegistry::new();

    let stream_bus = bus.clone();
    let music: SourceFactory =
        Arc::new(move |guild: GuildId| -> Result<Box<dyn AudioSource>> {
            let source = StreamingSource::spawn(&backend, stream_bus.clone(), guild)?;
            Ok(Box::new(source))
        });
    registry.register("music", music).unwrap();

    let silence: SourceFactory = Arc::new(|_guild: GuildId| -> Result<Box<dyn AudioSource>> {
        Ok(Box::new(SilenceSource))
    });
    registry.register("silence", silence).unwrap();

    Arc::new(registry)
}

/// A session table over a mock transport and a memory backend.
pub fn test_table(connector: MockConnector, backend: MemoryBackend) -> (Arc<SessionTable>, EventBus) {
    let bus = EventBus::new();
    let registry = test_registry(backend, &bus);
    let table = Arc::new(SessionTable::new(Arc::new(connector), registry, bus.clone()));
    (table, bus)
}

/// Calls `read` every few milliseconds until a frame matches, giving the
/// control loop time to run in between. Returns every frame read.
pub async fn read_until(mut read: impl FnMut() -> Frame, done: impl Fn(&Frame) -> bool) -> Vec<Frame> {
    let mut frames = Vec::new();
    for _ in 0..400 {
        let frame = read();
        let finished = done(&frame);
        frames.push(frame);
        if finished {
            return frames;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no matching frame after {} reads", frames.len());
}

/// Polls `condition` until it holds or a second has passed.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// Events currently waiting on the subscriber.
pub fn drain_events(subscriber: &mut Subscriber) -> Vec<VoiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = subscriber.try_recv() {
        events.push(event);
    }
    events
}

pub fn command_context(author_channel: Option<ChannelId>) -> CommandContext {
    CommandContext {
        guild: GUILD,
        author_channel,
        voice_channels: vec![
            VoiceChannel {
                id: GENERAL,
                name: "General".to_string(),
            },
            VoiceChannel {
                id: MUSIC_ROOM,
                name: "Music Room".to_string(),
            },
        ],
    }
}
