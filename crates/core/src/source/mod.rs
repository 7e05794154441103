//! Where each tick's frame comes from.
//!
//! - [`FileSource`]: pre-encoded layered content on disk, paced to the
//!   frame rate.
//! - [`RelaySource`]: frames reassembled from the producer relay, passed
//!   through unchanged.
//! - [`SyntheticSource`]: random payloads sized from a bitrate.
//!
//! The source is picked once at startup through [`SourceKind`].

pub mod file;
pub mod relay;
pub mod synthetic;

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::Result;
use crate::media::{SourceFrame, selector};

pub use file::FileSource;
pub use relay::RelaySource;
pub use synthetic::{SyntheticConfig, SyntheticMode, SyntheticSource};

/// A frame producer driving the tick loop.
pub trait FrameSource: Send {
    /// Block until this tick's frame is available. `None` ends the stream.
    fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    /// Trim `frame` for one viewer with `budget` bytes to spend.
    ///
    /// `None` means the viewer gets nothing this tick.
    fn encode(&self, frame: &SourceFrame, budget: usize) -> Option<Vec<u8>> {
        selector::select(frame, budget)
    }

    /// Global tick counter.
    fn frame_counter(&self) -> u32;

    /// Move to the next tick. Called exactly once per tick.
    fn advance(&mut self);
}

/// Startup selection of the frame source.
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Layered content directory with `layer_0`..`layer_2`.
    Files { dir: PathBuf },
    /// Producer relay bound to this address.
    Relay { bind: SocketAddr },
    /// Generated payloads.
    Synthetic(SyntheticConfig),
}

impl Default for SourceKind {
    fn default() -> Self {
        Self::Files {
            dir: PathBuf::from("content"),
        }
    }
}
