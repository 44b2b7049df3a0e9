use super::{AudioSource, Frame};

/// Placeholder attached to every fresh connection so the transport always
/// has something to pull from.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilenceSource;

impl AudioSource for SilenceSource {
    fn read(&mut self) -> Frame {
        Frame::Silence
    }

    fn resume(&mut self) {}

    fn pause(&mut self) {}

    fn stop(&mut self) {}

    fn skip(&mut self, _amount: usize) {}

    fn previous(&mut self, _amount: usize) {}

    fn queue(&mut self, item: &str) {
        debug!("SilenceSource ignoring queued item {item}");
    }
}
