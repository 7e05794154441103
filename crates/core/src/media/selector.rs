//! Budget-constrained layer selection.
//!
//! The byte budget for one frame interval is `floor(target_bps / 8 / fps)`.
//! Layers are all-or-nothing and the path taken depends on the first
//! affordability test:
//!
//! ```text
//! budget >= |L0| ?
//!   yes: take L0; then |L1| fits the rest ? take L1, then L2 if it fits
//!                                          : take L2 if it fits
//!   no:  budget >= |L1| ? take L1, then L2 if it fits the rest
//!                       : take L2 if it fits
//! ```
//!
//! L0 is presumed mandatory baseline quality, so when L0 is affordable the
//! output always starts with it. When neither L0 nor L1 fits, L2 alone may
//! still be sent.

use super::{LAYER_COUNT, SourceFrame};

/// Byte allowance for one frame at `target_bps`.
///
/// Returns 0 when `fps` is 0.
pub fn budget_bytes(target_bps: u64, fps: u32) -> usize {
    if fps == 0 {
        return 0;
    }
    (target_bps / 8 / fps as u64) as usize
}

/// Which layers a selection path included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerSet(u8);

impl LayerSet {
    pub const EMPTY: Self = Self(0);

    pub fn with(self, layer: usize) -> Self {
        Self(self.0 | (1 << layer))
    }

    pub fn contains(self, layer: usize) -> bool {
        self.0 & (1 << layer) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Included layer indices in L0 → L2 order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..LAYER_COUNT).filter(move |&i| self.contains(i))
    }
}

/// Decide which layers fit `budget` without copying any bytes.
pub fn plan(sizes: [usize; LAYER_COUNT], budget: usize) -> LayerSet {
    let [l0, l1, l2] = sizes;
    let mut set = LayerSet::EMPTY;
    let mut remaining = budget;

    if remaining >= l0 {
        remaining -= l0;
        set = set.with(0);
        if remaining >= l1 {
            remaining -= l1;
            set = set.with(1);
            if remaining >= l2 {
                set = set.with(2);
            }
        } else if remaining >= l2 {
            set = set.with(2);
        }
    } else if remaining >= l1 {
        remaining -= l1;
        set = set.with(1);
        if remaining >= l2 {
            set = set.with(2);
        }
    } else if remaining >= l2 {
        set = set.with(2);
    }

    set
}

/// Trim `frame` to `budget` bytes.
///
/// Returns `None` when nothing fits (or everything that fit was empty);
/// the viewer simply gets no frame this tick.
pub fn select(frame: &SourceFrame, budget: usize) -> Option<Vec<u8>> {
    let set = plan(frame.layer_sizes(), budget);
    let size: usize = set.iter().map(|i| frame.layer(i).len()).sum();
    if size == 0 {
        return None;
    }

    let mut payload = Vec::with_capacity(size);
    for i in set.iter() {
        payload.extend_from_slice(frame.layer(i));
    }
    Some(payload)
}
