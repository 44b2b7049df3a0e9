//! Decode backends feeding a streaming source's pipe.
//!
//! The remote music service is reached through an external decoder process
//! that writes raw s16le 44.1kHz stereo PCM to stdout. This module only
//! plumbs that process into the pipe and reports when a track is done.

use crate::{constants::INPUT_FRAME_BYTES, pipe::PipeWriter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, process::Stdio};
use tokio::{
    io::AsyncBufReadExt,
    process::{Child, ChildStdout},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

/// A track known to the decode backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackHandle {
    pub id: String,
}

impl TrackHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl fmt::Display for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "track:{}", self.id)
    }
}

/// Numbers every load of a session so events from an aborted decoder can be
/// told apart from the current one, even when the same track is reloaded.
pub type LoadId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// All of the track's audio has been written to the pipe
    TrackFinished { track: TrackHandle, load: LoadId },

    /// The decode session died, the source cannot continue
    Failed(String),
}

pub type BackendEvents = mpsc::UnboundedSender<BackendEvent>;

/// Starts decode sessions that write into a pipe.
pub trait DecodeBackend: Send + Sync {
    fn start(&self, writer: PipeWriter, events: BackendEvents) -> Result<Box<dyn DecodeSession>>;
}

/// A running decode session. Only one track is decoded at a time.
#[async_trait]
pub trait DecodeSession: Send {
    /// Start decoding `track`, replacing whatever was loaded. `load` is echoed
    /// back in the track's `TrackFinished` event.
    async fn load(&mut self, track: &TrackHandle, load: LoadId) -> Result<()>;

    async fn resume(&mut self) -> Result<()>;

    async fn pause(&mut self) -> Result<()>;

    /// Abort the loaded track without reporting it finished. Nothing of the
    /// aborted track is written to the pipe once this returns.
    async fn stop(&mut self) -> Result<()>;

    /// Tear the session down and close the pipe. Safe to call repeatedly.
    async fn shutdown(&mut self);
}

/// How to launch the external decoder.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessConfig {
    pub command: String,

    /// `{track}` is replaced with the track id
    #[serde(default)]
    pub args: Vec<String>,

    /// Credential material, passed to the decoder as environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub struct ProcessBackend {
    config: ProcessConfig,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl DecodeBackend for ProcessBackend {
    fn start(&self, writer: PipeWriter, events: BackendEvents) -> Result<Box<dyn DecodeSession>> {
        if self.config.command.is_empty() {
            anyhow::bail!("No decoder command configured");
        }

        // Sessions start paused, the first resume lets audio through
        let (paused, _) = watch::channel(true);

        Ok(Box::new(ProcessSession {
            config: self.config.clone(),
            writer,
            events,
            paused,
            current: None,
        }))
    }
}

struct ProcessSession {
    config: ProcessConfig,
    writer: PipeWriter,
    events: BackendEvents,
    paused: watch::Sender<bool>,
    current: Option<Feeder>,
}

/// The task copying the current track into the pipe.
pub struct Feeder {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Feeder {
    pub fn spawn<F>(token: CancellationToken, task: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Feeder {
            token,
            handle: tokio::spawn(task),
        }
    }

    /// Cancels the task and waits until it has stopped writing.
    pub async fn abort(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Feeder task ended abnormally: {e}");
        }
    }
}

impl ProcessSession {
    fn spawn_decoder(&self, track: &TrackHandle) -> Result<Child> {
        let args = self
            .config
            .args
            .iter()
            .map(|arg| arg.replace("{track}", &track.id));

        tokio::process::Command::new(&self.config.command)
            .args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn decoder `{}`", self.config.command))
    }
}

#[async_trait]
impl DecodeSession for ProcessSession {
    async fn load(&mut self, track: &TrackHandle, load: LoadId) -> Result<()> {
        self.stop().await?;

        let mut child = self.spawn_decoder(track)?;
        let stdout = child.stdout.take().context("Failed to get decoder stdout")?;
        let stderr = child.stderr.take().context("Failed to get decoder stderr")?;

        tokio::spawn(async move {
            // Print stderr to log
            let mut reader = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("decoder stderr: {}", line);
            }
        });

        let token = CancellationToken::new();
        let task = feed_track(
            track.clone(),
            load,
            child,
            stdout,
            self.writer.clone(),
            self.paused.subscribe(),
            token.clone(),
            self.events.clone(),
        );
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
        self.writer.close();
        if let Some(feeder) = self.current.take() {
            feeder.abort().await;
        }
    }
}

/// Copies decoder stdout into the pipe until EOF, then reports the outcome.
/// Dropping `child` on cancellation kills the process.
async fn feed_track(
    track: TrackHandle,
    load: LoadId,
    mut child: Child,
    stdout: ChildStdout,
    writer: PipeWriter,
    mut paused: watch::Receiver<bool>,
    token: CancellationToken,
    events: BackendEvents,
) {
    let mut stream = ReaderStream::with_capacity(stdout, INPUT_FRAME_BYTES * 4);

    loop {
        loop {
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                break;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                let written = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    written = writer.write_all(&bytes) => written,
                };
                if let Err(e) = written {
                    debug!("Pipe closed while feeding {track}: {e}");
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = events.send(BackendEvent::Failed(format!(
                    "reading decoder output for {track}: {e}"
                )));
                return;
            }
            None => break,
        }
    }

    let status = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        status = child.wait() => status,
    };

    let event = match status {
        Ok(status) if status.success() => BackendEvent::TrackFinished { track, load },
        Ok(status) => BackendEvent::Failed(format!("decoder for {track} exited with {status}")),
        Err(e) => BackendEvent::Failed(format!("waiting for decoder of {track}: {e}")),
    };

    if events.send(event).is_err() {
        trace!("Backend event dropped, source already gone");
    }
}
