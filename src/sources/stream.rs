//! Streaming audio source fed by an external decode session.
//!
//! Decoded 44.1kHz PCM arrives through a pipe, `read` takes one frame at a
//! time and resamples it to 48kHz. Playlist handling runs in a separate
//! control loop that reacts to "track finished" events from the backend, so
//! the transport's send loop never waits on the decoder or on a load.

use super::{AudioSource, Frame};
use crate::{
    backend::{BackendEvent, DecodeBackend, DecodeSession, LoadId, TrackHandle},
    constants::{INPUT_FRAME_BYTES, PIPE_CAPACITY},
    event::{EventBus, VoiceEvent},
    ids::GuildId,
    lock::PoisonlessLock,
    pipe::{self, PipeRead, PipeReader},
    resample::Resampler,
};
use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

lazy_static! {
    /// `track:<id>`, optionally prefixed with a service name
    /// (`musicsvc:track:<id>`).
    static ref TRACK_REF_RE: Regex =
        Regex::new(r"^(?:[A-Za-z][A-Za-z0-9_-]*:)?track:([A-Za-z0-9]+)$").unwrap();
}

/// Parses a typed track reference. Anything else is not understood yet.
pub fn parse_track_ref(item: &str) -> Option<TrackHandle> {
    TRACK_REF_RE
        .captures(item.trim())
        .and_then(|caps| caps.get(1))
        .map(|id| TrackHandle::new(id.as_str()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    /// Nothing loaded, `read` returns silence
    Idle,

    /// A track is loaded and being decoded
    Loaded,

    /// Last track finished decoding and the playlist is empty; the buffered
    /// tail is still being played out
    Draining,

    /// The backend died, the source is unusable
    Failed,

    /// `stop` was called
    Stopped,
}

struct Player {
    state: PlayerState,
    loaded: Option<TrackHandle>,
    playlist: VecDeque<TrackHandle>,
    history: Vec<TrackHandle>,
    paused: bool,
}

impl Default for Player {
    fn default() -> Self {
        Player {
            state: PlayerState::Idle,
            loaded: None,
            playlist: VecDeque::new(),
            history: Vec::new(),
            // Fresh sources wait for an explicit resume
            paused: true,
        }
    }
}

impl Player {
    fn is_finished(&self) -> bool {
        matches!(self.state, PlayerState::Failed | PlayerState::Stopped)
    }

    /// Moves the loaded track (if any) to the played history.
    fn unload(&mut self) {
        if let Some(track) = self.loaded.take() {
            self.history.push(track);
        }
    }
}

type SharedPlayer = Arc<Mutex<Player>>;

#[derive(Debug)]
enum Control {
    Resume,
    Pause,
    Queued,
    Skip(usize),
    Previous(usize),
}

pub struct StreamingSource {
    player: SharedPlayer,
    pipe: PipeReader,
    resampler: Resampler,
    control: mpsc::UnboundedSender<Control>,
    shutdown: CancellationToken,
}

impl StreamingSource {
    /// Opens a pipe, starts a decode session writing into it and starts the
    /// control loop. Must be called from within a tokio runtime.
    pub fn spawn(backend: &dyn DecodeBackend, bus: EventBus, guild: GuildId) -> Result<Self> {
        let (writer, reader) = pipe::channel(PIPE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = backend.start(writer, events_tx)?;
        let resampler = Resampler::new()?;

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let player: SharedPlayer = Default::default();
        let shutdown = CancellationToken::new();

        let control_loop = ControlLoop {
            guild,
            bus,
            player: player.clone(),
            pipe: reader.clone(),
            session,
            last_load: 0,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(control_loop.run(control_rx, events_rx));

        debug!("Streaming source created for guild {guild}");

        Ok(StreamingSource {
            player,
            pipe: reader,
            resampler,
            control: control_tx,
            shutdown,
        })
    }

    pub fn player_state(&self) -> PlayerState {
        self.player.plock().state
    }

    pub fn queued(&self) -> Vec<TrackHandle> {
        self.player.plock().playlist.iter().cloned().collect()
    }

    pub fn loaded(&self) -> Option<TrackHandle> {
        self.player.plock().loaded.clone()
    }

    fn send(&self, control: Control) {
        if let Err(e) = self.control.send(control) {
            debug!("Control loop gone, dropping {:?}", e.0);
        }
    }
}

impl AudioSource for StreamingSource {
    fn read(&mut self) -> Frame {
        let draining = {
            let player = self.player.plock();
            match player.state {
                PlayerState::Failed => return Frame::End,
                PlayerState::Stopped => return Frame::Silence,
                _ => {}
            }
            if player.loaded.is_none() || player.paused {
                return Frame::Silence;
            }
            player.state == PlayerState::Draining
        };

        match self.pipe.read_frame(INPUT_FRAME_BYTES, draining) {
            PipeRead::Data(bytes) => Frame::Audio(self.resampler.process(&bytes)),
            PipeRead::Empty if draining => {
                let mut player = self.player.plock();
                // A new track may have been loaded since we looked
                if player.state == PlayerState::Draining {
                    player.unload();
                    player.state = PlayerState::Idle;
                    debug!("Playlist drained");
                    Frame::End
                } else {
                    Frame::Silence
                }
            }
            // Decoder stalled, don't hold up the send loop
            PipeRead::Empty => Frame::Silence,
            PipeRead::Closed => {
                let mut player = self.player.plock();
                if player.state != PlayerState::Stopped {
                    warn!("Pipe closed under a loaded track, source stopped");
                    player.state = PlayerState::Failed;
                    player.loaded = None;
                }
                Frame::End
            }
        }
    }

    fn resume(&mut self) {
        self.player.plock().paused = false;
        self.send(Control::Resume);
    }

    fn pause(&mut self) {
        self.player.plock().paused = true;
        self.send(Control::Pause);
    }

    fn stop(&mut self) {
        {
            let mut player = self.player.plock();
            if player.state == PlayerState::Stopped {
                return;
            }
            player.paused = true;
            player.loaded = None;
            player.state = PlayerState::Stopped;
        }

        self.pipe.close();
        self.shutdown.cancel();
        debug!("Streaming source stopped");
    }

    fn skip(&mut self, amount: usize) {
        if amount > 0 {
            self.send(Control::Skip(amount));
        }
    }

    fn previous(&mut self, amount: usize) {
        if amount > 0 {
            self.send(Control::Previous(amount));
        }
    }

    fn queue(&mut self, item: &str) {
        match parse_track_ref(item) {
            Some(track) => {
                let len = {
                    let mut player = self.player.plock();
                    player.playlist.push_back(track.clone());
                    player.playlist.len()
                };
                info!("Queued {track}, playlist length: {len}");
                self.send(Control::Queued);
            }
            // TODO: resolve free text through the service's search once the
            // backend exposes one
            None => info!("Ignoring unrecognized track reference {item:?}"),
        }
    }

    fn current(&self) -> Option<String> {
        let player = self.player.plock();
        let track = player.loaded.as_ref()?;
        let state = if player.paused { " (paused)" } else { "" };
        match player.playlist.len() {
            0 => Some(format!("{track}{state}")),
            n => Some(format!("{track}{state}, {n} more queued")),
        }
    }

    fn is_terminated(&self) -> bool {
        self.player.plock().state == PlayerState::Failed
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the decode session and performs every load on its behalf.
struct ControlLoop {
    guild: GuildId,
    bus: EventBus,
    player: SharedPlayer,
    pipe: PipeReader,
    session: Box<dyn DecodeSession>,
    /// Id handed to the most recent `session.load`
    last_load: LoadId,
    shutdown: CancellationToken,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(control) = control.recv() => self.handle_control(control).await,
                Some(event) = events.recv() => self.handle_backend_event(event).await,
                else => break,
            }

            if self.player.plock().is_finished() {
                break;
            }
        }

        self.session.shutdown().await;
        self.pipe.close();
        debug!("Control loop for guild {} exited", self.guild);
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Resume => {
                let next = {
                    let mut player = self.player.plock();
                    if player.loaded.is_none() {
                        player.playlist.pop_front()
                    } else {
                        None
                    }
                };
                if let Some(track) = next {
                    self.load(track).await;
                }
                if let Err(e) = self.session.resume().await {
                    self.fail(format!("resume: {e:#}")).await;
                }
            }
            Control::Pause => {
                if let Err(e) = self.session.pause().await {
                    self.fail(format!("pause: {e:#}")).await;
                }
            }
            Control::Queued => {
                // Start right away if we're playing but ran out of tracks
                let next = {
                    let mut player = self.player.plock();
                    let idle = player.loaded.is_none() || player.state == PlayerState::Draining;
                    if idle && !player.paused {
                        player.playlist.pop_front()
                    } else {
                        None
                    }
                };
                if let Some(track) = next {
                    self.load(track).await;
                }
            }
            Control::Skip(amount) => {
                self.abort_current().await;
                let next = {
                    let mut player = self.player.plock();
                    player.unload();
                    // The current track counts as the first one skipped
                    for _ in 1..amount {
                        if player.playlist.pop_front().is_none() {
                            break;
                        }
                    }
                    player.playlist.pop_front()
                };
                self.load_or_idle(next).await;
            }
            Control::Previous(amount) => {
                self.abort_current().await;
                let next = {
                    let mut player = self.player.plock();
                    if let Some(current) = player.loaded.take() {
                        player.playlist.push_front(current);
                    }
                    for _ in 0..amount {
                        match player.history.pop() {
                            Some(track) => player.playlist.push_front(track),
                            None => break,
                        }
                    }
                    player.playlist.pop_front()
                };
                self.load_or_idle(next).await;
            }
        }
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::TrackFinished { track, load } => {
                let next = {
                    let mut player = self.player.plock();
                    // Left over from a track that was skipped or restarted
                    if load != self.last_load || player.loaded.is_none() {
                        debug!("Ignoring finish of stale {track} (load {load})");
                        return;
                    }
                    player.playlist.pop_front()
                };

                info!("Finished decoding {track}");

                match next {
                    Some(next) => self.load(next).await,
                    None => {
                        self.player.plock().state = PlayerState::Draining;
                        self.bus.send(VoiceEvent::PlaylistEnded { guild: self.guild });
                    }
                }
            }
            BackendEvent::Failed(reason) => self.fail(reason).await,
        }
    }

    async fn load(&mut self, track: TrackHandle) {
        if self.player.plock().is_finished() {
            return;
        }

        self.last_load += 1;
        match self.session.load(&track, self.last_load).await {
            Ok(()) => {
                {
                    let mut player = self.player.plock();
                    // Stopped while the load was in flight
                    if player.is_finished() {
                        return;
                    }
                    player.unload();
                    player.loaded = Some(track.clone());
                    player.state = PlayerState::Loaded;
                }
                info!("Loaded {track} for guild {}", self.guild);
                self.bus.send(VoiceEvent::TrackStarted {
                    guild: self.guild,
                    track: track.to_string(),
                });
            }
            Err(e) => self.fail(format!("loading {track}: {e:#}")).await,
        }
    }

    async fn load_or_idle(&mut self, next: Option<TrackHandle>) {
        match next {
            Some(track) => self.load(track).await,
            None => {
                self.player.plock().state = PlayerState::Idle;
                self.bus.send(VoiceEvent::PlaylistEnded { guild: self.guild });
            }
        }
    }

    /// Stops decoding the loaded track and drops whatever it left in the pipe.
    /// `stop` has returned once the feeder is gone, so the clear is final.
    async fn abort_current(&mut self) {
        if let Err(e) = self.session.stop().await {
            warn!("Failed to stop decoder: {e:#}");
        }
        self.pipe.clear();
    }

    async fn fail(&mut self, reason: String) {
        error!("Decode backend failed for guild {}: {reason}", self.guild);
        {
            let mut player = self.player.plock();
            if player.state != PlayerState::Stopped {
                player.state = PlayerState::Failed;
                player.loaded = None;
            }
        }
        self.session.shutdown().await;
        self.pipe.close();
    }
}
