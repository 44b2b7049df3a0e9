use crate::ids::{ChannelId, GuildId};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::{self, Receiver, Sender};

#[derive(Clone)]
pub struct EventBus {
    tx: Sender<VoiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel::<VoiceEvent>(100);
        Self { tx }
    }

    pub fn send(&self, event: VoiceEvent) {
        // Nobody listening is fine, events are notifications only
        if self.tx.send(event).is_err() {
            trace!("VoiceEvent dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber::new(self.tx.subscribe())
    }
}

pub struct Subscriber {
    rx: Receiver<VoiceEvent>,
}

impl Subscriber {
    pub fn new(rx: Receiver<VoiceEvent>) -> Self {
        Self { rx }
    }

    pub fn try_recv(&mut self) -> Result<VoiceEvent, TryRecvError> {
        self.rx.try_recv()
    }

    /// Waits for the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => break Some(event),
                Err(RecvError::Closed) => break None,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("EventBus::Subscriber lagging behind senders, skipping {skipped} messages");
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoiceEvent {
    /// A new transport connection was opened for the guild
    Joined { guild: GuildId, channel: ChannelId },

    /// An existing connection was moved to another channel
    Moved { guild: GuildId, channel: ChannelId },

    /// The session was torn down
    Left { guild: GuildId },

    SourceAttached { guild: GuildId, source: String },

    /// The attached source terminated on its own, placeholder is back in
    SourceStopped { guild: GuildId, source: String },

    TrackStarted { guild: GuildId, track: String },

    /// Auto-advance ran out of queued tracks
    PlaylistEnded { guild: GuildId },
}

pub fn debug(bus: &EventBus) {
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut bus = bus.subscribe();
        while let Some(event) = bus.recv().await {
            debug!("Received event: {:?}", event);
        }
    });
}
