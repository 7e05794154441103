use std::sync::Arc;

use parking_lot::RwLock;

/// Congestion controller output for one viewer.
///
/// Written only by the transport engine; the streaming core reads it once
/// per tick and never computes it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthEstimate {
    /// Sustainable send rate, in bits per second.
    pub target_bitrate_bps: u64,
    /// Loss-based component of the estimate.
    pub loss_target_bitrate_bps: u64,
    /// Delay-based component of the estimate.
    pub delay_target_bitrate_bps: u64,
    /// Average loss fraction, 0.0–1.0.
    pub average_loss: f32,
}

impl BandwidthEstimate {
    /// An estimate where every component equals `bps` and loss is zero.
    pub fn fixed(bps: u64) -> Self {
        Self {
            target_bitrate_bps: bps,
            loss_target_bitrate_bps: bps,
            delay_target_bitrate_bps: bps,
            average_loss: 0.0,
        }
    }

    /// Target rate clamped into the 32-bit field used on the wire.
    pub fn target_bitrate_u32(&self) -> u32 {
        u32::try_from(self.target_bitrate_bps).unwrap_or(u32::MAX)
    }
}

/// Shared handle to a viewer's estimate.
///
/// The session hands a clone to its transport engine, which is the only
/// writer; the lock is held for the copy only.
#[derive(Debug, Clone, Default)]
pub struct EstimateHandle {
    inner: Arc<RwLock<BandwidthEstimate>>,
}

impl EstimateHandle {
    pub fn new(initial: BandwidthEstimate) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Snapshot of the current estimate.
    pub fn get(&self) -> BandwidthEstimate {
        *self.inner.read()
    }

    /// Replace the estimate (transport engine side).
    pub fn update(&self, estimate: BandwidthEstimate) {
        *self.inner.write() = estimate;
    }

    /// Change only the target rate (transport engine side).
    pub fn set_target(&self, bps: u64) {
        self.inner.write().target_bitrate_bps = bps;
    }
}
