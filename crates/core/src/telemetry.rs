//! Per-viewer statistics and per-frame records.
//!
//! The tick loop only calls a [`TelemetrySink`]; where the records end up
//! is the sink's business. [`CsvTelemetry`] writes two semicolon-separated
//! files and flushes after every record so a crashed run keeps its data.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::Result;
use crate::session::BandwidthEstimate;

/// Snapshot of a viewer's estimate, taken every few ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSample {
    pub wall_clock_ms: u64,
    pub target_bitrate_bps: u64,
    pub loss_target_bitrate_bps: u64,
    pub delay_target_bitrate_bps: u64,
    pub average_loss: f32,
}

impl StatsSample {
    pub fn from_estimate(estimate: &BandwidthEstimate, wall_clock_ms: u64) -> Self {
        Self {
            wall_clock_ms,
            target_bitrate_bps: estimate.target_bitrate_bps,
            loss_target_bitrate_bps: estimate.loss_target_bitrate_bps,
            delay_target_bitrate_bps: estimate.delay_target_bitrate_bps,
            average_loss: estimate.average_loss,
        }
    }
}

/// One frame handed to one viewer's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    /// Global tick the frame was produced on.
    pub frame: u32,
    pub session_id: u64,
    pub created_ms: u64,
    pub estimated_bitrate_bps: u64,
    /// Encoded payload size in bytes.
    pub size: usize,
    pub completed_ms: u64,
    pub is_final: bool,
}

/// Destination for telemetry. Errors are logged by the caller and ignored.
pub trait TelemetrySink: Send + Sync {
    fn record_stats(&self, session_id: u64, sample: &StatsSample) -> Result<()>;
    fn record_frame(&self, record: &FrameRecord) -> Result<()>;
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn record_stats(&self, _session_id: u64, _sample: &StatsSample) -> Result<()> {
        Ok(())
    }

    fn record_frame(&self, _record: &FrameRecord) -> Result<()> {
        Ok(())
    }
}

/// Keeps records in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    stats: Mutex<Vec<(u64, StatsSample)>>,
    frames: Mutex<Vec<FrameRecord>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Vec<(u64, StatsSample)> {
        self.stats.lock().clone()
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        self.frames.lock().clone()
    }

    pub fn stats_for(&self, session_id: u64) -> Vec<StatsSample> {
        self.stats
            .lock()
            .iter()
            .filter(|(id, _)| *id == session_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn frames_for(&self, session_id: u64) -> Vec<FrameRecord> {
        self.frames
            .lock()
            .iter()
            .filter(|r| r.session_id == session_id)
            .copied()
            .collect()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn record_stats(&self, session_id: u64, sample: &StatsSample) -> Result<()> {
        self.stats.lock().push((session_id, *sample));
        Ok(())
    }

    fn record_frame(&self, record: &FrameRecord) -> Result<()> {
        self.frames.lock().push(*record);
        Ok(())
    }
}

const STATS_HEADER: &str = "session;time;estimated_bitrate;loss_rate;delay_rate;loss";
const FRAMES_HEADER: &str = "frame;session;created;estimated_bitrate;size;completed;final";

/// Writes `<prefix>_cont.csv` (stats) and `<prefix>_frames.csv` (frames).
pub struct CsvTelemetry {
    stats: Mutex<BufWriter<File>>,
    frames: Mutex<BufWriter<File>>,
    stats_path: PathBuf,
    frames_path: PathBuf,
}

impl CsvTelemetry {
    /// Create (truncating) both files and write their headers.
    pub fn create(prefix: impl AsRef<Path>) -> Result<Self> {
        let prefix = prefix.as_ref().to_string_lossy().into_owned();
        let stats_path = PathBuf::from(format!("{prefix}_cont.csv"));
        let frames_path = PathBuf::from(format!("{prefix}_frames.csv"));

        let stats = open_with_header(&stats_path, STATS_HEADER)?;
        let frames = open_with_header(&frames_path, FRAMES_HEADER)?;

        tracing::info!(
            stats = %stats_path.display(),
            frames = %frames_path.display(),
            "telemetry files created"
        );

        Ok(Self {
            stats: Mutex::new(stats),
            frames: Mutex::new(frames),
            stats_path,
            frames_path,
        })
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    pub fn frames_path(&self) -> &Path {
        &self.frames_path
    }
}

fn open_with_header(path: &Path, header: &str) -> Result<BufWriter<File>> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{header}")?;
    writer.flush()?;
    Ok(writer)
}

impl TelemetrySink for CsvTelemetry {
    fn record_stats(&self, session_id: u64, sample: &StatsSample) -> Result<()> {
        let mut writer = self.stats.lock();
        writeln!(
            writer,
            "{};{};{};{};{};{:.2}",
            session_id,
            sample.wall_clock_ms,
            sample.target_bitrate_bps,
            sample.loss_target_bitrate_bps,
            sample.delay_target_bitrate_bps,
            sample.average_loss
        )?;
        writer.flush()?;
        Ok(())
    }

    fn record_frame(&self, record: &FrameRecord) -> Result<()> {
        let mut writer = self.frames.lock();
        writeln!(
            writer,
            "{};{};{};{};{};{};{}",
            record.frame,
            record.session_id,
            record.created_ms,
            record.estimated_bitrate_bps,
            record.size,
            record.completed_ms,
            record.is_final
        )?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_prefix(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "layercast-telemetry-{name}-{}-{}",
            std::process::id(),
            now_millis()
        ))
    }

    #[test]
    fn csv_rows_are_flushed_per_record() {
        let prefix = scratch_prefix("csv");
        let sink = CsvTelemetry::create(&prefix).unwrap();

        let sample = StatsSample::from_estimate(
            &BandwidthEstimate {
                target_bitrate_bps: 600_000,
                loss_target_bitrate_bps: 700_000,
                delay_target_bitrate_bps: 650_000,
                average_loss: 0.25,
            },
            1_000,
        );
        sink.record_stats(3, &sample).unwrap();
        sink.record_frame(&FrameRecord {
            frame: 10,
            session_id: 3,
            created_ms: 1_000,
            estimated_bitrate_bps: 600_000,
            size: 1700,
            completed_ms: 1_001,
            is_final: true,
        })
        .unwrap();

        // read back while the sink is still alive
        let stats = fs::read_to_string(sink.stats_path()).unwrap();
        assert_eq!(
            stats.lines().collect::<Vec<_>>(),
            vec![STATS_HEADER, "3;1000;600000;700000;650000;0.25"]
        );
        let frames = fs::read_to_string(sink.frames_path()).unwrap();
        assert_eq!(
            frames.lines().collect::<Vec<_>>(),
            vec![FRAMES_HEADER, "10;3;1000;600000;1700;1001;true"]
        );

        fs::remove_file(sink.stats_path()).ok();
        fs::remove_file(sink.frames_path()).ok();
    }

    #[test]
    fn memory_filters_by_session() {
        let sink = MemoryTelemetry::new();
        let sample = StatsSample::from_estimate(&BandwidthEstimate::fixed(1), 0);
        sink.record_stats(1, &sample).unwrap();
        sink.record_stats(2, &sample).unwrap();
        sink.record_stats(1, &sample).unwrap();
        assert_eq!(sink.stats_for(1).len(), 2);
        assert_eq!(sink.stats().len(), 3);
        assert!(sink.frames_for(1).is_empty());
    }

    #[test]
    fn csv_in_missing_dir_fails() {
        let prefix = std::env::temp_dir().join("layercast-no-such-dir-xyz").join("run");
        assert!(CsvTelemetry::create(prefix).is_err());
    }
}
