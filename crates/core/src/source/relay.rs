use std::sync::Arc;

use super::FrameSource;
use crate::error::Result;
use crate::media::SourceFrame;
use crate::relay::RelayConnection;

/// Frames arriving over the producer relay.
///
/// The producer already adapted them to the bitrates it was sent, so
/// every viewer gets the whole frame regardless of its budget.
pub struct RelaySource {
    relay: Arc<RelayConnection>,
    tick: u32,
}

impl RelaySource {
    pub fn new(relay: Arc<RelayConnection>) -> Self {
        Self { relay, tick: 0 }
    }

    pub fn relay(&self) -> &Arc<RelayConnection> {
        &self.relay
    }
}

impl FrameSource for RelaySource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        Ok(self.relay.next_frame().map(SourceFrame::single))
    }

    fn encode(&self, frame: &SourceFrame, _budget: usize) -> Option<Vec<u8>> {
        if frame.is_empty() {
            return None;
        }
        Some(frame.layers().concat())
    }

    fn frame_counter(&self) -> u32 {
        self.tick
    }

    fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }
}
