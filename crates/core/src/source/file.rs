use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::error::{Result, StreamError};
use crate::media::{LayeredContent, SourceFrame};

/// Plays layered content from disk at a fixed frame rate, looping.
pub struct FileSource {
    content: LayeredContent,
    tick: u32,
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl FileSource {
    /// Load `dir` and pace frames to `fps`.
    pub fn open(dir: impl AsRef<Path>, fps: u32) -> Result<Self> {
        Self::new(LayeredContent::load(dir)?, fps)
    }

    pub fn new(content: LayeredContent, fps: u32) -> Result<Self> {
        if fps == 0 {
            return Err(StreamError::InvalidConfig("fps must be positive".into()));
        }
        Ok(Self {
            content,
            tick: 0,
            interval: Some(Duration::from_secs(1) / fps),
            next_due: None,
        })
    }

    /// Serve frames as fast as they are asked for.
    pub fn unpaced(content: LayeredContent) -> Self {
        Self {
            content,
            tick: 0,
            interval: None,
            next_due: None,
        }
    }

    pub fn content(&self) -> &LayeredContent {
        &self.content
    }

    fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // a late tick does not shorten the following one
        self.next_due = Some(due.max(now) + interval);
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        self.pace();
        Ok(Some(self.content.frame_for_tick(self.tick).clone()))
    }

    fn frame_counter(&self) -> u32 {
        self.tick
    }

    fn advance(&mut self) {
        self.tick = self.tick.wrapping_add(1);
    }
}
