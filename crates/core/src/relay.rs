//! UDP relay to a remote frame producer.
//!
//! The producer speaks first: its first datagram (any content) tells us
//! where it lives. Once enough viewers have joined the server greets it
//! and starts the reader:
//!
//! ```text
//! producer                         server
//!    | ---- any datagram ----------> |  accept_producer()
//!    | <--- "Hello!" (1500 bytes) -- |  start()
//!    | ---- type 2 chunk ----------> |  reassembled, queued
//!    | ---- tick (type != 2) ------> |
//!    | <--- type 1 bitrate report -- |  one entry per live viewer
//! ```
//!
//! Every tag other than 2 counts as a tick. Datagrams from any other
//! address are ignored. Malformed datagrams are logged and dropped; only a
//! socket error ends the reader.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::assembly::{AssemblyConfig, CompletedFrame, FragmentAssembler};
use crate::error::{Result, StreamError};
use crate::queue::BoundedFrameQueue;
use crate::session::SessionRegistry;
use crate::wire::{self, MAX_DATAGRAM_SIZE, PacketType, TYPE_TAG_LEN};

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Server side of the producer relay.
pub struct RelayConnection {
    socket: UdpSocket,
    producer: RwLock<Option<SocketAddr>>,
    frames: BoundedFrameQueue<CompletedFrame>,
    assembly: AssemblyConfig,
    closed: AtomicBool,
    delivered: AtomicU32,
    reports_sent: AtomicU64,
}

impl RelayConnection {
    /// Bind the relay socket. Completed frames are buffered up to
    /// `queue_capacity`, oldest dropped first.
    pub fn bind(addr: impl ToSocketAddrs, queue_capacity: usize, assembly: AssemblyConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        tracing::info!(addr = %socket.local_addr()?, "relay listening");

        Ok(Self {
            socket,
            producer: RwLock::new(None),
            frames: BoundedFrameQueue::new(queue_capacity),
            assembly,
            closed: AtomicBool::new(false),
            delivered: AtomicU32::new(0),
            reports_sent: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn producer_addr(&self) -> Option<SocketAddr> {
        *self.producer.read()
    }

    /// Block until the producer's first datagram arrives and remember its
    /// address. The datagram itself is discarded.
    pub fn accept_producer(&self) -> Result<SocketAddr> {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "relay closed").into());
            }
            match self.socket.recv_from(&mut buf) {
                Ok((_, from)) => {
                    *self.producer.write() = Some(from);
                    tracing::info!(producer = %from, "relay producer connected");
                    return Ok(from);
                }
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Greet the producer and spawn the reader thread.
    ///
    /// Bitrate reports list every live session in `registry`.
    pub fn start(self: &Arc<Self>, registry: SessionRegistry) -> Result<JoinHandle<()>> {
        let producer = self.producer_addr().ok_or(StreamError::NotStarted)?;
        self.socket.send_to(&wire::greeting_datagram(), producer)?;
        tracing::debug!(%producer, "greeting sent");

        let relay = self.clone();
        let handle = thread::Builder::new()
            .name("relay-reader".into())
            .spawn(move || relay.read_loop(producer, registry))?;
        Ok(handle)
    }

    fn read_loop(&self, producer: SocketAddr, registry: SessionRegistry) {
        let mut assembler = FragmentAssembler::new(self.assembly.clone());
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];

        while !self.closed.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    if from != producer {
                        tracing::trace!(%from, "datagram from stranger dropped");
                        continue;
                    }
                    if let Err(e) = self.handle_datagram(&buf[..n], &mut assembler, &registry) {
                        tracing::warn!(%producer, error = %e, "relay datagram dropped");
                    }
                }
                Err(ref e) if is_timeout(e) => {
                    let evicted = assembler.evict_expired(Instant::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "stale relay frames evicted");
                    }
                }
                Err(e) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        tracing::error!(error = %e, "relay socket failed");
                    }
                    break;
                }
            }
        }

        self.frames.close();
        tracing::debug!(
            completed = assembler.completed(),
            evicted = assembler.evicted(),
            dropped = self.frames.dropped(),
            reports = self.reports_sent(),
            "relay reader exited"
        );
    }

    fn handle_datagram(
        &self,
        datagram: &[u8],
        assembler: &mut FragmentAssembler,
        registry: &SessionRegistry,
    ) -> Result<()> {
        match wire::packet_type(datagram)? {
            PacketType::FrameChunk => {
                let (header, payload) = wire::decode_chunk(&datagram[TYPE_TAG_LEN..])?;
                if let Some(frame) = assembler.ingest(&header, payload)? {
                    tracing::trace!(frame_number = frame.frame_number, bytes = frame.data.len(), "relay frame complete");
                    self.frames.push(frame);
                }
                Ok(())
            }
            // Any other tag, including 0 and 1, is the producer's tick.
            _ => self.send_report(registry),
        }
    }

    /// Send one bitrate report covering every live session.
    pub fn send_report(&self, registry: &SessionRegistry) -> Result<()> {
        let producer = self.producer_addr().ok_or(StreamError::NotStarted)?;
        let entries = registry.bitrate_snapshot();
        self.socket
            .send_to(&wire::encode_bitrate_report(&entries), producer)?;
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(viewers = entries.len(), "bitrate report sent");
        Ok(())
    }

    /// Block until the next reassembled frame. `None` once closed and drained.
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        let frame = self.frames.pop()?;
        let delivered = self.delivered.fetch_add(1, Ordering::SeqCst);
        if delivered % 100 == 0 {
            tracing::debug!(delivered, frame_number = frame.frame_number, "relay frame delivered");
        }
        Some(frame.data)
    }

    /// Like [`next_frame`](Self::next_frame) but gives up after `timeout`.
    pub fn next_frame_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let frame = self.frames.pop_timeout(timeout)?;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Some(frame.data)
    }

    /// Frames handed out by [`next_frame`](Self::next_frame).
    pub fn frames_delivered(&self) -> u32 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Completed frames waiting to be pulled.
    pub fn queued(&self) -> usize {
        self.frames.len()
    }

    /// Bitrate reports sent to the producer.
    pub fn reports_sent(&self) -> u64 {
        self.reports_sent.load(Ordering::Relaxed)
    }

    /// Stop the reader and wake anyone blocked in `next_frame`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.frames.close();
            tracing::debug!("relay closed");
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
