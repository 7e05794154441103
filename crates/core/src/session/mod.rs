//! Viewer sessions and the registry that owns them.
//!
//! A viewer session is created when a signaling connection arrives and
//! destroyed when the connection drops or its transport fails. It tracks:
//!
//! - A numeric id, assigned monotonically by the registry and never reused.
//! - The negotiation state (see below).
//! - The bandwidth estimate written by its transport engine.
//! - A per-viewer frame counter used as the outbound sequence number.
//! - Local candidates waiting for the remote description.
//! - Reassembly state for frames the viewer uploads.
//! - The viewer's last reported [`PanZoom`].
//!
//! ## Session lifecycle
//!
//! ```text
//! (connect)          -> Created
//! hello              -> Negotiating
//! transport up       -> Ready        (frames flow)
//! failure/disconnect -> Terminated   (removed from the registry)
//! ```

mod estimate;
mod view;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::assembly::{AssemblyConfig, CompletedFrame, FragmentAssembler};
use crate::error::{Result, StreamError};
use crate::media::EncodedFrame;
use crate::queue::{BoundedFrameQueue, DEFAULT_QUEUE_CAPACITY};
use crate::signaling::{MessageKind, SignalMessage};
use crate::transport::PeerTransport;
use crate::wire::{self, BitrateEntry};

pub use estimate::{BandwidthEstimate, EstimateHandle};
pub use view::PanZoom;

/// Viewer session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Signaling connection open, nothing negotiated yet.
    Created,
    /// Offer sent, waiting for the transport to connect.
    Negotiating,
    /// Transport connected; the viewer receives frames.
    Ready,
    /// Torn down; the session is no longer served.
    Terminated,
}

impl SessionState {
    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Negotiating) | (Negotiating, Ready) | (Ready, Ready) | (Created | Negotiating | Ready, Terminated)
        )
    }
}

#[derive(Debug, Default)]
struct Candidates {
    remote_description_set: bool,
    pending: Vec<String>,
}

/// One connected viewer.
///
/// Interior mutability with one lock per field so the tick loop, the
/// signaling reader and the transport reader never contend on unrelated
/// state. No lock is held across socket I/O.
pub struct ViewerSession {
    id: u64,
    state: RwLock<SessionState>,
    estimate: EstimateHandle,
    frame_counter: AtomicU32,
    transport: RwLock<Option<Arc<dyn PeerTransport>>>,
    /// Pending local candidates, flushed once the remote description is applied.
    candidates: Mutex<Candidates>,
    /// Reassembly table for the viewer's upstream track.
    upstream: Mutex<FragmentAssembler>,
    upstream_frames: BoundedFrameQueue<CompletedFrame>,
    outbox: Mutex<Option<Sender<SignalMessage>>>,
    pan_zoom: Mutex<PanZoom>,
}

impl ViewerSession {
    fn new(
        id: u64,
        outbox: Option<Sender<SignalMessage>>,
        assembly: AssemblyConfig,
        upstream_capacity: usize,
    ) -> Self {
        Self {
            id,
            state: RwLock::new(SessionState::Created),
            estimate: EstimateHandle::default(),
            frame_counter: AtomicU32::new(0),
            transport: RwLock::new(None),
            candidates: Mutex::new(Candidates::default()),
            upstream: Mutex::new(FragmentAssembler::new(assembly)),
            upstream_frames: BoundedFrameQueue::new(upstream_capacity),
            outbox: Mutex::new(outbox),
            pan_zoom: Mutex::new(PanZoom::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether the transport has connected and the session is still live.
    pub fn is_ready(&self) -> bool {
        *self.state.read() == SessionState::Ready
    }

    pub fn is_terminated(&self) -> bool {
        *self.state.read() == SessionState::Terminated
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// Returns `true` if the state actually changed.
    pub fn transition(&self, next: SessionState) -> Result<bool> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_become(next) {
            return Err(StreamError::InvalidState {
                session_id: self.id,
                from: current,
                to: next,
            });
        }
        *state = next;
        drop(state);

        if current != next {
            tracing::debug!(session_id = self.id, old_state = ?current, new_state = ?next, "state transition");
        }
        Ok(current != next)
    }

    /// Hello received: start negotiating.
    pub fn begin_negotiation(&self) -> Result<()> {
        self.transition(SessionState::Negotiating).map(|_| ())
    }

    /// Transport reported "connected". Returns `true` the first time only.
    pub fn mark_connected(&self) -> Result<bool> {
        let changed = self.transition(SessionState::Ready)?;
        if changed {
            tracing::info!(session_id = self.id, "viewer ready");
        }
        Ok(changed)
    }

    /// Tear the session down and close its transport.
    ///
    /// Returns `true` if this call did the teardown.
    pub fn terminate(&self) -> bool {
        let changed = matches!(self.transition(SessionState::Terminated), Ok(true));
        if changed {
            let transport = self.transport.write().take();
            if let Some(transport) = transport {
                transport.close();
            }
            self.upstream_frames.close();
            self.outbox.lock().take();
        }
        changed
    }

    /// Handle to give the transport engine; it is the only writer.
    pub fn estimate_handle(&self) -> EstimateHandle {
        self.estimate.clone()
    }

    pub fn bandwidth_estimate(&self) -> BandwidthEstimate {
        self.estimate.get()
    }

    /// Consume the next outbound sequence number.
    ///
    /// Called once per encode attempt, whether or not a frame is produced.
    pub fn next_sequence(&self) -> u32 {
        self.frame_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of encode attempts made for this viewer.
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    pub fn pan_zoom(&self) -> PanZoom {
        *self.pan_zoom.lock()
    }

    pub fn set_pan_zoom(&self, pan_zoom: PanZoom) {
        *self.pan_zoom.lock() = pan_zoom;
    }

    pub fn attach_transport(&self, transport: Arc<dyn PeerTransport>) {
        *self.transport.write() = Some(transport);
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.read().clone()
    }

    /// Transmit a frame through the viewer's transport.
    pub fn send_frame(&self, frame: &EncodedFrame) -> Result<()> {
        let transport = self
            .transport()
            .ok_or_else(|| StreamError::transport(self.id, "no transport attached"))?;
        transport.send(frame)
    }

    /// Queue a signaling message to the viewer.
    pub fn signal(&self, kind: MessageKind, payload: impl Into<String>) -> Result<()> {
        let message = SignalMessage::new(self.id, kind, payload);
        let outbox = self.outbox.lock().clone();
        match outbox {
            Some(tx) => tx
                .send(message)
                .map_err(|_| StreamError::transport(self.id, "signaling channel closed")),
            None => {
                tracing::trace!(session_id = self.id, kind = ?message.kind, "no signaling channel, message dropped");
                Ok(())
            }
        }
    }

    /// A local candidate was gathered: send it, or hold it until the
    /// remote description is applied.
    pub fn queue_local_candidate(&self, candidate: String) -> Result<()> {
        {
            let mut candidates = self.candidates.lock();
            if !candidates.remote_description_set {
                tracing::debug!(session_id = self.id, %candidate, "candidate held until answer");
                candidates.pending.push(candidate);
                return Ok(());
            }
        }
        self.signal(MessageKind::Candidate, candidate)
    }

    /// Remote description applied: flush held candidates in order.
    pub fn remote_description_applied(&self) -> Result<()> {
        let pending = {
            let mut candidates = self.candidates.lock();
            candidates.remote_description_set = true;
            std::mem::take(&mut candidates.pending)
        };
        for candidate in pending {
            self.signal(MessageKind::Candidate, candidate)?;
        }
        Ok(())
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.lock().pending.len()
    }

    /// Feed one upstream chunk body (after the type tag).
    ///
    /// Returns the frame number when the chunk completed a frame.
    pub fn ingest_upstream(&self, body: &[u8]) -> Result<Option<u32>> {
        let (header, payload) = wire::decode_chunk(body)?;
        let completed = self.upstream.lock().ingest(&header, payload)?;
        Ok(completed.map(|frame| {
            let number = frame.frame_number;
            self.upstream_frames.push(frame);
            number
        }))
    }

    /// Block until the viewer's next uploaded frame completes.
    ///
    /// Returns `None` once the session is terminated.
    pub fn next_upstream_frame(&self) -> Option<CompletedFrame> {
        self.upstream_frames.pop()
    }

    pub fn try_next_upstream_frame(&self) -> Option<CompletedFrame> {
        self.upstream_frames.try_pop()
    }

    /// Drop upstream assemblies that have been idle too long.
    pub fn evict_stale_upstream(&self, now: Instant) -> usize {
        self.upstream.lock().evict_expired(now)
    }
}

impl std::fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("frame_counter", &self.frame_counter())
            .finish_non_exhaustive()
    }
}

/// Limits applied to every session a registry creates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub assembly: AssemblyConfig,
    pub upstream_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            assembly: AssemblyConfig::default(),
            upstream_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Thread-safe registry of active viewer sessions.
///
/// Written at session creation and teardown, iterated by the tick loop and
/// the relay's bitrate reports. The map itself never leaves the registry.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<u64, Arc<ViewerSession>>>>,
    next_id: Arc<AtomicU64>,
    joined: Arc<(Mutex<u64>, Condvar)>,
    config: Arc<SessionConfig>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        SessionRegistry {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            joined: Arc::new((Mutex::new(0), Condvar::new())),
            config: Arc::new(config),
        }
    }

    /// Create and register a session. `outbox` carries its signaling replies.
    pub fn create_session(&self, outbox: Option<Sender<SignalMessage>>) -> Arc<ViewerSession> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ViewerSession::new(
            id,
            outbox,
            self.config.assembly.clone(),
            self.config.upstream_capacity,
        ));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id, session.clone());
            sessions.len()
        };

        let (joined, cv) = &*self.joined;
        *joined.lock() += 1;
        cv.notify_all();

        tracing::debug!(session_id = id, total_sessions = total, "session created");
        session
    }

    pub fn get(&self, id: u64) -> Option<Arc<ViewerSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Remove a session without tearing it down.
    pub fn remove(&self, id: u64) -> Option<Arc<ViewerSession>> {
        let removed = self.sessions.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(session_id = id, total_sessions = self.len(), "session removed");
        }
        removed
    }

    /// Tear a session down and remove it. Returns `false` if it was unknown.
    pub fn terminate(&self, id: u64) -> bool {
        match self.remove(id) {
            Some(session) => {
                if session.terminate() {
                    tracing::info!(session_id = id, "viewer terminated");
                }
                true
            }
            None => false,
        }
    }

    /// Tear down every session (server shutdown).
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.terminate();
        }
        if !drained.is_empty() {
            tracing::debug!(removed = drained.len(), "all sessions terminated");
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// All registered sessions ordered by id.
    pub fn sessions(&self) -> Vec<Arc<ViewerSession>> {
        let mut all: Vec<_> = self.sessions.read().values().cloned().collect();
        all.sort_by_key(|s| s.id());
        all
    }

    /// Sessions whose transport is connected, ordered by id.
    pub fn ready_sessions(&self) -> Vec<Arc<ViewerSession>> {
        let mut ready: Vec<_> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.is_ready())
            .cloned()
            .collect();
        ready.sort_by_key(|s| s.id());
        ready
    }

    /// Current target bitrate of every live session, for producer reports.
    pub fn bitrate_snapshot(&self) -> Vec<BitrateEntry> {
        self.sessions()
            .iter()
            .filter(|s| !s.is_terminated())
            .map(|s| BitrateEntry {
                session_id: s.id(),
                bitrate_bps: s.bandwidth_estimate().target_bitrate_u32(),
            })
            .collect()
    }

    /// Sessions ever created by this registry.
    pub fn joined(&self) -> u64 {
        *self.joined.0.lock()
    }

    /// Block until at least `count` viewers have joined.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_for_viewers(&self, count: u64, timeout: Option<Duration>) -> bool {
        let (joined, cv) = &*self.joined;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = joined.lock();
        while *current < count {
            match deadline {
                Some(deadline) => {
                    if cv.wait_until(&mut current, deadline).timed_out() {
                        return *current >= count;
                    }
                }
                None => cv.wait(&mut current),
            }
        }
        true
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
