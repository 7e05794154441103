//! Fragment reassembly for inbound chunked frames.
//!
//! Each inbound byte stream (a viewer's upstream track, the producer relay)
//! owns one [`FragmentAssembler`]. Chunks carry an explicit offset, so they
//! may arrive in any order; a frame is complete once the received ranges
//! cover the declared length, at which point its buffer leaves the
//! in-flight table and is handed to the caller exactly once. A chunk that
//! overlaps bytes already received is rejected.
//!
//! The in-flight table is bounded: frames whose tail never arrives are
//! evicted by age and, when the table is full, oldest-first. Buffers grow
//! with the highest byte received, not the declared length.

use std::collections::HashMap;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::error::{Result, StreamError, ViolationKind};
use crate::wire::ChunkHeader;

/// Bounds applied to every assembler.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Largest declared frame length accepted from a peer.
    pub max_frame_len: u32,
    /// In-flight frames older than this are evicted.
    pub max_age: Duration,
    /// Upper bound on concurrently in-flight frame numbers.
    pub max_in_flight: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            max_age: Duration::from_secs(5),
            max_in_flight: 16,
        }
    }
}

/// A fully reassembled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    pub frame_number: u32,
    pub data: Vec<u8>,
}

/// Buffer for one in-flight frame number.
#[derive(Debug)]
struct AssemblyBuffer {
    declared_len: u32,
    received: u32,
    /// Sorted, disjoint, merged byte ranges already written.
    covered: Vec<Range<u32>>,
    data: Vec<u8>,
    first_seen: Instant,
}

impl AssemblyBuffer {
    fn new(declared_len: u32, now: Instant) -> Self {
        Self {
            declared_len,
            received: 0,
            covered: Vec::new(),
            data: Vec::new(),
            first_seen: now,
        }
    }

    fn overlaps(&self, chunk: &Range<u32>) -> bool {
        !chunk.is_empty()
            && self
                .covered
                .iter()
                .any(|r| r.start < chunk.end && chunk.start < r.end)
    }

    /// Copy a chunk that is known to be in bounds and disjoint.
    fn write(&mut self, chunk: Range<u32>, payload: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let end = chunk.end as usize;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[chunk.start as usize..end].copy_from_slice(payload);
        self.received += chunk.end - chunk.start;

        let at = self.covered.partition_point(|r| r.start < chunk.start);
        self.covered.insert(at, chunk);
        if at + 1 < self.covered.len() && self.covered[at].end == self.covered[at + 1].start {
            let next = self.covered.remove(at + 1);
            self.covered[at].end = next.end;
        }
        if at > 0 && self.covered[at - 1].end == self.covered[at].start {
            let merged = self.covered.remove(at);
            self.covered[at - 1].end = merged.end;
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.declared_len
    }

    fn into_data(mut self) -> Vec<u8> {
        self.data.resize(self.declared_len as usize, 0);
        self.data
    }
}

/// Reassembles chunked frames keyed by frame number.
#[derive(Debug)]
pub struct FragmentAssembler {
    config: AssemblyConfig,
    in_flight: HashMap<u32, AssemblyBuffer>,
    evicted: u64,
    completed: u64,
}

impl FragmentAssembler {
    pub fn new(config: AssemblyConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
            evicted: 0,
            completed: 0,
        }
    }

    /// Apply one chunk. Returns the frame when this chunk completes it.
    pub fn ingest(&mut self, header: &ChunkHeader, payload: &[u8]) -> Result<Option<CompletedFrame>> {
        self.ingest_at(header, payload, Instant::now())
    }

    /// [`ingest`](Self::ingest) with an explicit clock, for eviction tests.
    pub fn ingest_at(
        &mut self,
        header: &ChunkHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<CompletedFrame>> {
        self.validate(header, payload)?;

        if !self.in_flight.contains_key(&header.frame_number) {
            self.make_room(now);
            self.in_flight.insert(
                header.frame_number,
                AssemblyBuffer::new(header.frame_length, now),
            );
            tracing::trace!(
                frame_number = header.frame_number,
                frame_length = header.frame_length,
                "assembly started"
            );
        }

        let Some(buffer) = self.in_flight.get_mut(&header.frame_number) else {
            return Ok(None);
        };

        if buffer.declared_len != header.frame_length {
            return Err(StreamError::violation(ViolationKind::FrameLengthChanged {
                frame_number: header.frame_number,
                expected: buffer.declared_len,
                got: header.frame_length,
            }));
        }

        // Bounds were checked in validate, so the end cannot overflow.
        let chunk = header.offset..header.offset + header.length;
        if buffer.overlaps(&chunk) {
            return Err(StreamError::violation(ViolationKind::Overflow {
                frame_number: header.frame_number,
            }));
        }
        buffer.write(chunk, payload);

        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(done) = self.in_flight.remove(&header.frame_number) else {
            return Ok(None);
        };
        let data = done.into_data();
        self.completed += 1;
        tracing::trace!(
            frame_number = header.frame_number,
            bytes = data.len(),
            "frame complete"
        );
        Ok(Some(CompletedFrame {
            frame_number: header.frame_number,
            data,
        }))
    }

    fn validate(&self, header: &ChunkHeader, payload: &[u8]) -> Result<()> {
        if payload.len() != header.length as usize {
            return Err(StreamError::violation(ViolationKind::LengthMismatch {
                declared: header.length,
                actual: payload.len(),
            }));
        }
        if header.frame_length > self.config.max_frame_len {
            return Err(StreamError::ResourceExhaustion(format!(
                "frame {} declares {} bytes (limit {})",
                header.frame_number, header.frame_length, self.config.max_frame_len
            )));
        }
        let in_bounds = header
            .offset
            .checked_add(header.length)
            .is_some_and(|end| end <= header.frame_length);
        if !in_bounds {
            return Err(StreamError::violation(ViolationKind::OutOfBounds {
                offset: header.offset,
                length: header.length,
                frame_length: header.frame_length,
            }));
        }
        Ok(())
    }

    /// Drop expired entries, then the oldest entries until a new one fits.
    fn make_room(&mut self, now: Instant) {
        let max_age = self.config.max_age;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, buf| now.saturating_duration_since(buf.first_seen) < max_age);
        let mut evicted = before - self.in_flight.len();

        while !self.in_flight.is_empty() && self.in_flight.len() >= self.config.max_in_flight {
            let oldest = self
                .in_flight
                .iter()
                .min_by_key(|(number, buf)| (buf.first_seen, **number))
                .map(|(number, _)| *number);
            match oldest {
                Some(number) => {
                    self.in_flight.remove(&number);
                    evicted += 1;
                }
                None => break,
            }
        }

        if evicted > 0 {
            self.evicted += evicted as u64;
            tracing::debug!(
                evicted,
                in_flight = self.in_flight.len(),
                "evicted abandoned frame assemblies"
            );
        }
    }

    /// Evict entries older than the configured age without ingesting.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let max_age = self.config.max_age;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, buf| now.saturating_duration_since(buf.first_seen) < max_age);
        let evicted = before - self.in_flight.len();
        self.evicted += evicted as u64;
        evicted
    }

    /// Number of frames currently being assembled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Bytes currently held by in-flight buffers.
    pub fn buffered_bytes(&self) -> usize {
        self.in_flight.values().map(|buf| buf.data.len()).sum()
    }

    /// Total frames dropped by the eviction policy.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Total frames handed off complete.
    pub fn completed(&self) -> u64 {
        self.completed
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(AssemblyConfig::default())
    }
}
