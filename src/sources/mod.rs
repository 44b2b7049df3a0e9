//! Audio sources that can be attached to a voice session.
//!
//! All audio sources implement the `AudioSource` trait, which the voice
//! transport's send loop pulls one 20ms frame at a time from.

pub mod silence;
pub mod stream;

use crate::constants::OUTPUT_FRAME_BYTES;

/// One pull from an audio source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Exactly `OUTPUT_FRAME_BYTES` of s16le stereo PCM at the output rate
    Audio(Vec<u8>),

    /// Nothing to play right now, keep the cadence alive
    Silence,

    /// The stream ended
    End,
}

impl Frame {
    /// Byte form handed to the transport: a full frame, or empty for `End`.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Frame::Audio(bytes) => bytes,
            Frame::Silence => vec![0u8; OUTPUT_FRAME_BYTES],
            Frame::End => Vec::new(),
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Frame::Audio(_))
    }
}

/// Trait for everything playable in a voice session.
///
/// `read` is called on the transport's send loop every 20ms and must return
/// within a fraction of that, never waiting on the decoder. Control methods
/// are called from command handlers and must not block either.
pub trait AudioSource: Send {
    /// Pull the next frame.
    fn read(&mut self) -> Frame;

    fn resume(&mut self);

    fn pause(&mut self);

    /// Stop playback and release the pipe and decode session. Terminal:
    /// afterwards `read` only returns silence or end. Sources that hold
    /// anything to release also do this when dropped.
    fn stop(&mut self);

    /// Skip `amount` tracks forward.
    fn skip(&mut self, amount: usize);

    /// Go back `amount` tracks.
    fn previous(&mut self, amount: usize);

    /// Add a track reference to the playlist.
    fn queue(&mut self, item: &str);

    /// Description of what is currently loaded, if anything.
    fn current(&self) -> Option<String> {
        None
    }

    /// Whether frames are already Opus encoded. Used by the transport to
    /// pick its encode path.
    fn is_compressed_format(&self) -> bool {
        false
    }

    /// Set once the source died on its own (backend failure) and should be
    /// detached.
    fn is_terminated(&self) -> bool {
        false
    }
}
