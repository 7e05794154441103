//! The global tick loop.
//!
//! Each tick pulls one frame from the source and walks the ready viewers
//! in id order. Per viewer:
//!
//! 1. every `stats_interval` ticks, record a [`StatsSample`] and evict
//!    stale upstream assemblies;
//! 2. derive the byte budget from its target bitrate and encode;
//! 3. consume one sequence number, whether or not a payload came out;
//! 4. send the payload and record a [`FrameRecord`].
//!
//! A viewer whose send fails is terminated on the spot; the others are
//! still served this tick. After all viewers, the source advances once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::error::Result;
use crate::media::{EncodedFrame, SourceFrame, budget_bytes};
use crate::session::{SessionRegistry, ViewerSession};
use crate::source::FrameSource;
use crate::telemetry::{FrameRecord, StatsSample, TelemetrySink, now_millis};

/// Ticks between two statistics samples of the same viewer.
pub const DEFAULT_STATS_INTERVAL: u32 = 5;

pub struct Streamer {
    source: Box<dyn FrameSource>,
    registry: SessionRegistry,
    telemetry: Arc<dyn TelemetrySink>,
    fps: u32,
    stats_interval: u32,
}

impl Streamer {
    pub fn new(
        source: Box<dyn FrameSource>,
        registry: SessionRegistry,
        telemetry: Arc<dyn TelemetrySink>,
        fps: u32,
    ) -> Self {
        Self {
            source,
            registry,
            telemetry,
            fps,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    /// Change the sampling cadence. Zero is raised to one.
    pub fn with_stats_interval(mut self, interval: u32) -> Self {
        self.stats_interval = interval.max(1);
        self
    }

    /// Current global tick.
    pub fn tick_count(&self) -> u32 {
        self.source.frame_counter()
    }

    /// Run one tick. Returns `false` once the source has no more frames.
    pub fn tick(&mut self) -> Result<bool> {
        let Some(frame) = self.source.next_frame()? else {
            return Ok(false);
        };
        let tick = self.source.frame_counter();

        let viewers = self.registry.ready_sessions();
        for session in &viewers {
            if let Err(e) = self.serve(session, &frame, tick) {
                tracing::warn!(session_id = session.id(), error = %e, "viewer dropped");
                self.registry.terminate(session.id());
            }
        }

        if tick % 100 == 0 {
            tracing::debug!(tick, viewers = viewers.len(), "frame sent to all viewers");
        }

        self.source.advance();
        Ok(true)
    }

    fn serve(&self, session: &ViewerSession, frame: &SourceFrame, tick: u32) -> Result<()> {
        let session_id = session.id();
        let estimate = session.bandwidth_estimate();

        if tick % self.stats_interval == 0 {
            let sample = StatsSample::from_estimate(&estimate, now_millis());
            if let Err(e) = self.telemetry.record_stats(session_id, &sample) {
                tracing::warn!(session_id, error = %e, "stats not recorded");
            }
            let evicted = session.evict_stale_upstream(Instant::now());
            if evicted > 0 {
                tracing::debug!(session_id, evicted, "stale upstream frames evicted");
            }
        }

        let budget = budget_bytes(estimate.target_bitrate_bps, self.fps);
        let payload = self.source.encode(frame, budget);
        let sequence = session.next_sequence();

        let Some(payload) = payload else {
            tracing::trace!(session_id, tick, budget, "nothing fits the budget");
            return Ok(());
        };

        let created_ms = now_millis();
        let size = payload.len();
        session.send_frame(&EncodedFrame::new(sequence, payload))?;

        let record = FrameRecord {
            frame: tick,
            session_id,
            created_ms,
            estimated_bitrate_bps: estimate.target_bitrate_bps,
            size,
            completed_ms: now_millis(),
            is_final: true,
        };
        if let Err(e) = self.telemetry.record_frame(&record) {
            tracing::warn!(session_id, error = %e, "frame record not written");
        }

        tracing::trace!(session_id, tick, sequence, bytes = size, "frame encoded");
        Ok(())
    }

    /// Tick until `running` clears or the source ends.
    pub fn run(&mut self, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            match self.tick() {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(ticks = self.tick_count(), "frame source ended");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame source failed");
                    break;
                }
            }
        }
        tracing::debug!("tick loop exited");
    }
}
