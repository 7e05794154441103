//! Pre-encoded layered content loaded from disk.
//!
//! Expected layout, one file per frame and layer, ordered by file name:
//!
//! ```text
//! <content>/layer_0/0000.bin  0001.bin ...
//! <content>/layer_1/0000.bin  0001.bin ...
//! <content>/layer_2/0000.bin  0001.bin ...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use super::{LAYER_COUNT, SourceFrame};
use crate::error::{Result, StreamError};

/// All frames of a layered content directory, held in memory.
#[derive(Debug, Clone)]
pub struct LayeredContent {
    frames: Vec<SourceFrame>,
}

impl LayeredContent {
    /// Load `layer_0`..`layer_2` from `dir`.
    ///
    /// Every layer must contain the same number of files, and at least one.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut layers: Vec<Vec<Vec<u8>>> = Vec::with_capacity(LAYER_COUNT);
        for index in 0..LAYER_COUNT {
            let layer_dir = dir.join(format!("layer_{index}"));
            let files = read_layer(&layer_dir)?;
            tracing::debug!(layer = index, frames = files.len(), dir = %layer_dir.display(), "layer loaded");
            layers.push(files);
        }

        let count = layers[0].len();
        if count == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "no frames in {}",
                dir.join("layer_0").display()
            )));
        }
        if layers.iter().any(|l| l.len() != count) {
            return Err(StreamError::InvalidConfig(format!(
                "layer frame counts differ in {}: {:?}",
                dir.display(),
                layers.iter().map(Vec::len).collect::<Vec<_>>()
            )));
        }

        let mut layers = layers.into_iter();
        let (l0, l1, l2) = (
            layers.next().unwrap_or_default(),
            layers.next().unwrap_or_default(),
            layers.next().unwrap_or_default(),
        );
        let frames = l0
            .into_iter()
            .zip(l1)
            .zip(l2)
            .map(|((base, mid), top)| SourceFrame::new(base, mid, top))
            .collect();

        tracing::info!(dir = %dir.display(), frames = count, "layered content loaded");
        Ok(Self { frames })
    }

    /// Build content from frames already in memory.
    pub fn from_frames(frames: Vec<SourceFrame>) -> Result<Self> {
        if frames.is_empty() {
            return Err(StreamError::InvalidConfig("layered content has no frames".into()));
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frame for a tick; content loops when ticks outrun it.
    pub fn frame_for_tick(&self, tick: u32) -> &SourceFrame {
        &self.frames[tick as usize % self.frames.len()]
    }
}

fn read_layer(dir: &Path) -> Result<Vec<Vec<u8>>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| fs::read(path).map_err(StreamError::from))
        .collect()
}
