use std::thread;
use std::time::{Duration, Instant};

use rand::RngExt;

use super::FrameSource;
use crate::error::{Result, StreamError};
use crate::media::{SourceFrame, budget_bytes};

/// How a [`SyntheticSource`] sizes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticMode {
    /// Every viewer gets `bitrate / 8 / fps` bytes, whatever its estimate.
    Fixed,
    /// Each viewer gets exactly its budget.
    FollowBudget,
    /// Nothing is ever sent; frame counters still advance.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticConfig {
    pub bitrate_bps: u64,
    pub mode: SyntheticMode,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 1_000_000,
            mode: SyntheticMode::Fixed,
        }
    }
}

/// Random payloads, for load testing without content or a producer.
pub struct SyntheticSource {
    config: SyntheticConfig,
    fps: u32,
    tick: u32,
    paced: bool,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig, fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(StreamError::InvalidConfig("fps must be positive".into()));
        }
        Ok(Self {
            config,
            fps,
            tick: 0,
            paced: true,
            next_due: None,
        })
    }

    /// Disable frame-rate pacing.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Bytes per frame at the configured bitrate.
    pub fn frame_len(&self) -> usize {
        budget_bytes(self.config.bitrate_bps, self.fps)
    }

    fn pace(&mut self) {
        if !self.paced {
            return;
        }
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + Duration::from_secs(1) / self.fps);
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rand::rng().fill(&mut out[..]);
    out
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        self.pace();
        let payload = match self.config.mode {
            SyntheticMode::Fixed => random_payload(self.frame_len()),
            SyntheticMode::FollowBudget | SyntheticMode::Silent => Vec::new(),
        };
        Ok(Some(SourceFrame::single(payload)))
    }

    fn encode(&self, frame: &SourceFrame, budget: usize) -> Option<Vec<u8>> {
        match self.config.mode {
            SyntheticMode::Silent => None,
            SyntheticMode::Fixed if frame.is_empty() => None,
            SyntheticMode::Fixed => Some(frame.layer(0).to_vec()),
            SyntheticMode::FollowBudget if budget == 0 => None,
            SyntheticMode::FollowBudget => Some(random_payload(budget)),
        }
    }

    fn frame_counter(&self) -> u32 {
        self.tick
    }

    fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(mode: SyntheticMode) -> SyntheticSource {
        SyntheticSource::new(
            SyntheticConfig {
                bitrate_bps: 240_000,
                mode,
            },
            30,
        )
        .unwrap()
        .unpaced()
    }

    #[test]
    fn fixed_ignores_budget() {
        let mut s = source(SyntheticMode::Fixed);
        let frame = s.next_frame().unwrap().unwrap();
        assert_eq!(frame.total_len(), 1000);
        assert_eq!(s.encode(&frame, 0).map(|p| p.len()), Some(1000));
        assert_eq!(s.encode(&frame, 50_000).map(|p| p.len()), Some(1000));
    }

    #[test]
    fn follow_budget_fills_budget() {
        let mut s = source(SyntheticMode::FollowBudget);
        let frame = s.next_frame().unwrap().unwrap();
        assert_eq!(s.encode(&frame, 2500).map(|p| p.len()), Some(2500));
        assert_eq!(s.encode(&frame, 0), None);
    }

    #[test]
    fn silent_never_emits() {
        let mut s = source(SyntheticMode::Silent);
        let frame = s.next_frame().unwrap().unwrap();
        assert_eq!(s.encode(&frame, 1_000_000), None);
        s.advance();
        assert_eq!(s.frame_counter(), 1);
    }

    #[test]
    fn payload_length_is_exact() {
        for len in [0, 1, 7, 8, 9, 1481] {
            assert_eq!(random_payload(len).len(), len);
        }
    }

    #[test]
    fn payload_is_filled() {
        let payload = random_payload(4096);
        assert!(payload.iter().any(|b| *b != 0));
        assert_ne!(payload, random_payload(4096));
    }
}
