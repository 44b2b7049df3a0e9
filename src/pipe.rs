//! Bounded byte pipe between a decode backend and a streaming source.
//!
//! The writer half is async and waits for space, the reader half never
//! blocks: it is drained from the voice transport's send loop.

use crate::lock::PoisonlessLock;
use bytes::BytesMut;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Result of a single non-blocking frame read.
#[derive(Debug, PartialEq, Eq)]
pub enum PipeRead {
    /// Exactly the requested number of bytes
    Data(Vec<u8>),

    /// Nothing buffered yet, the writer is still alive
    Empty,

    /// The pipe was closed and everything buffered has been consumed
    Closed,
}

struct PipeState {
    buffer: BytesMut,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
    /// Bytes handed to the reader since the pipe was opened
    total_bytes_read: usize,
}

struct Shared {
    state: Mutex<PipeState>,
    space: Notify,
}

#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub struct PipeReader {
    shared: Arc<Shared>,
}

pub fn channel(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(PipeState {
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            writer_closed: false,
            reader_closed: false,
            total_bytes_read: 0,
        }),
        space: Notify::new(),
    });

    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

impl PipeWriter {
    /// Writes all of `data`, waiting for the reader whenever the pipe is full.
    ///
    /// Fails with `BrokenPipe` once the reader side has been closed.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            {
                let mut state = self.shared.state.plock();
                if state.reader_closed || state.writer_closed {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
                }

                let free = state.capacity.saturating_sub(state.buffer.len());
                if free > 0 {
                    let n = free.min(data.len());
                    state.buffer.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    continue;
                }
            }

            self.shared.space.notified().await;
        }

        Ok(())
    }

    /// Marks the end of input. Buffered bytes can still be read.
    pub fn close(&self) {
        self.shared.state.plock().writer_closed = true;
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.plock();
        state.reader_closed || state.writer_closed
    }
}

impl PipeReader {
    /// Takes one frame of `len` bytes without blocking.
    ///
    /// A partial remainder is only returned (zero padded to `len`) when
    /// `drain` is set or the writer has closed, so the caller never sees a
    /// short frame.
    pub fn read_frame(&self, len: usize, drain: bool) -> PipeRead {
        let mut state = self.shared.state.plock();
        if state.reader_closed {
            return PipeRead::Closed;
        }

        let available = state.buffer.len();
        let frame = if available >= len {
            Some(state.buffer.split_to(len).to_vec())
        } else if available > 0 && (drain || state.writer_closed) {
            let mut frame = state.buffer.split().to_vec();
            frame.resize(len, 0);
            Some(frame)
        } else {
            None
        };

        match frame {
            Some(frame) => {
                state.total_bytes_read += available.min(len);
                drop(state);
                self.shared.space.notify_one();
                PipeRead::Data(frame)
            }
            None if state.writer_closed => PipeRead::Closed,
            None => PipeRead::Empty,
        }
    }

    /// Drops everything buffered, e.g. when skipping a track.
    pub fn clear(&self) {
        self.shared.state.plock().buffer.clear();
        self.shared.space.notify_one();
    }

    /// Closes the pipe from the reading side. Pending and future writes fail.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.plock();
            state.reader_closed = true;
            state.buffer.clear();
        }
        self.shared.space.notify_waiters();
        self.shared.space.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.plock().reader_closed
    }

    /// Buffer level in bytes (for diagnostics)
    pub fn available(&self) -> usize {
        self.shared.state.plock().buffer.len()
    }

    pub fn total_bytes_read(&self) -> usize {
        self.shared.state.plock().total_bytes_read
    }
}
