//! Layered source frames and the per-viewer encoded output.
//!
//! A [`SourceFrame`] carries three independently sized layers in priority
//! order: L0 is the base quality every viewer should get when it can afford
//! it, L1 and L2 are enhancements. Each tick the [`selector`] trims the
//! frame to a viewer's byte budget, producing an [`EncodedFrame`] whose
//! payload is a concatenation of whole layers.
//!
//! ## EncodedFrame wire layout
//!
//! ```text
//! +----------------+----------------+----------------+-------------
//! | source id (BE) | length (BE)    | sequence (BE)  | payload ...
//! +----------------+----------------+----------------+-------------
//! ```

pub mod content;
pub mod selector;

pub use content::LayeredContent;
pub use selector::{LayerSet, budget_bytes, select};

/// Number of layers in a [`SourceFrame`].
pub const LAYER_COUNT: usize = 3;

/// One tick's raw payload, split into prioritized layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFrame {
    layers: [Vec<u8>; LAYER_COUNT],
}

impl SourceFrame {
    pub fn new(l0: Vec<u8>, l1: Vec<u8>, l2: Vec<u8>) -> Self {
        Self {
            layers: [l0, l1, l2],
        }
    }

    /// A frame whose layering was already done upstream; carried as L0.
    pub fn single(payload: Vec<u8>) -> Self {
        Self::new(payload, Vec::new(), Vec::new())
    }

    pub fn layer(&self, index: usize) -> &[u8] {
        &self.layers[index]
    }

    pub fn layers(&self) -> &[Vec<u8>; LAYER_COUNT] {
        &self.layers
    }

    pub fn layer_sizes(&self) -> [usize; LAYER_COUNT] {
        [
            self.layers[0].len(),
            self.layers[1].len(),
            self.layers[2].len(),
        ]
    }

    /// Sum of all layer sizes.
    pub fn total_len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}

/// Per-viewer, per-tick output unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Placeholder for the originating session; always 0 for server frames.
    pub source_id: u32,
    /// Viewer-local sequence number.
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl EncodedFrame {
    pub const HEADER_LEN: usize = 12;

    pub fn new(sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            source_id: 0,
            sequence,
            payload,
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Serialize header and payload for the media channel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.source_id.to_be_bytes());
        out.extend_from_slice(&self.payload_len().to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a frame produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_LEN {
            return None;
        }
        let field = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let len = field(4) as usize;
        let payload = buf.get(Self::HEADER_LEN..Self::HEADER_LEN + len)?;
        Some(Self {
            source_id: field(0),
            sequence: field(8),
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_header_is_big_endian() {
        let frame = EncodedFrame::new(0x0A0B0C0D, vec![1, 2, 3]);
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 3]);
        assert_eq!(&bytes[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(&bytes[12..], &[1, 2, 3]);
        assert_eq!(EncodedFrame::from_bytes(&bytes), Some(frame));
    }

    #[test]
    fn from_bytes_rejects_short_payload() {
        let mut bytes = EncodedFrame::new(1, vec![9; 10]).to_bytes();
        bytes.truncate(15);
        assert_eq!(EncodedFrame::from_bytes(&bytes), None);
    }

    #[test]
    fn source_frame_sizes() {
        let frame = SourceFrame::new(vec![0; 3], vec![0; 2], vec![0; 1]);
        assert_eq!(frame.layer_sizes(), [3, 2, 1]);
        assert_eq!(frame.total_len(), 6);
        assert!(SourceFrame::single(Vec::new()).is_empty());
    }
}
