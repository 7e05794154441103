use std::sync::Arc;

use crate::error::{Result, StreamError};
use crate::session::{PanZoom, SessionRegistry, ViewerSession};
use crate::signaling::{MessageKind, SignalMessage, encode_description};
use crate::transport::{EventHandler, TransportEvent, TransportFactory};

/// Handles signaling messages for the session bound to one connection.
///
/// The connection's session is authoritative; the client id inside each
/// message is only compared for logging.
pub struct SignalingHandler {
    session: Arc<ViewerSession>,
    registry: SessionRegistry,
    factory: Arc<dyn TransportFactory>,
}

impl SignalingHandler {
    pub fn new(
        session: Arc<ViewerSession>,
        registry: SessionRegistry,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        SignalingHandler {
            session,
            registry,
            factory,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn handle(&self, message: &SignalMessage) -> Result<()> {
        let session_id = self.session.id();
        if message.client_id != session_id {
            tracing::debug!(session_id, client_id = message.client_id, "client id differs from session");
        }

        match message.kind {
            MessageKind::Hello => self.handle_hello(),
            MessageKind::Answer => self.handle_answer(message),
            MessageKind::Candidate => self.handle_candidate(message),
            MessageKind::PanZoom => {
                let pan_zoom: PanZoom = message.payload.parse()?;
                tracing::trace!(session_id, %pan_zoom, "pan/zoom updated");
                self.session.set_pan_zoom(pan_zoom);
                Ok(())
            }
            MessageKind::Offer => {
                tracing::warn!(session_id, "viewer sent an offer, ignoring");
                Ok(())
            }
        }
    }

    /// Open the transport and reply with its offer.
    fn handle_hello(&self) -> Result<()> {
        let session_id = self.session.id();
        if self.session.transport().is_some() {
            tracing::warn!(session_id, "duplicate hello ignored");
            return Ok(());
        }

        self.session.begin_negotiation()?;
        let events = transport_events(self.registry.clone(), session_id);
        let transport = self
            .factory
            .open(session_id, self.session.estimate_handle(), events)?;
        self.session.attach_transport(transport.clone());

        let offer = transport.create_offer()?;
        tracing::debug!(session_id, "hello, sending offer");
        self.session.signal(MessageKind::Offer, encode_description(&offer))
    }

    fn handle_answer(&self, message: &SignalMessage) -> Result<()> {
        let session_id = self.session.id();
        let transport = self
            .session
            .transport()
            .ok_or_else(|| StreamError::NegotiationFailure("answer before hello".into()))?;
        let answer = message
            .decode_description()
            .map_err(|e| StreamError::NegotiationFailure(format!("unreadable answer: {e}")))?;

        transport.apply_answer(&answer)?;
        tracing::debug!(session_id, pending = self.session.pending_candidates(), "answer applied");
        self.session.remote_description_applied()
    }

    fn handle_candidate(&self, message: &SignalMessage) -> Result<()> {
        let transport = self
            .session
            .transport()
            .ok_or_else(|| StreamError::NegotiationFailure("candidate before hello".into()))?;
        tracing::trace!(session_id = self.session.id(), candidate = %message.payload, "remote candidate");
        transport.add_remote_candidate(&message.payload)
    }
}

/// Event handler routing a transport's events back to its session.
///
/// Looks the session up on every event so a terminated session simply
/// stops receiving them.
pub fn transport_events(registry: SessionRegistry, session_id: u64) -> EventHandler {
    Arc::new(move |event| {
        let Some(session) = registry.get(session_id) else {
            tracing::trace!(session_id, "event for a removed session");
            return;
        };

        match event {
            TransportEvent::Connected => {
                if let Err(e) = session.mark_connected() {
                    tracing::warn!(session_id, error = %e, "connected event rejected");
                }
            }
            TransportEvent::Failed(reason) => {
                tracing::error!(session_id, %reason, "transport failed");
                registry.terminate(session_id);
            }
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = session.queue_local_candidate(candidate) {
                    tracing::warn!(session_id, error = %e, "could not send local candidate");
                }
            }
            TransportEvent::InboundChunk(body) => match session.ingest_upstream(&body) {
                Ok(Some(frame_number)) => {
                    tracing::debug!(session_id, frame_number, "upstream frame complete");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(session_id, error = %e, "upstream chunk rejected"),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::EncodedFrame;
    use crate::session::{EstimateHandle, SessionState};
    use crate::transport::PeerTransport;
    use parking_lot::Mutex;
    use std::sync::mpsc;

    #[derive(Default)]
    struct FakeTransport {
        answers: Mutex<Vec<String>>,
        candidates: Mutex<Vec<String>>,
    }

    impl PeerTransport for FakeTransport {
        fn create_offer(&self) -> Result<String> {
            Ok("v=0\r\n".into())
        }
        fn apply_answer(&self, answer: &str) -> Result<()> {
            if answer.is_empty() {
                return Err(StreamError::NegotiationFailure("empty".into()));
            }
            self.answers.lock().push(answer.to_string());
            Ok(())
        }
        fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
            self.candidates.lock().push(candidate.to_string());
            Ok(())
        }
        fn send(&self, _frame: &EncodedFrame) -> Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    struct FakeFactory {
        transport: Arc<FakeTransport>,
        events: Mutex<Option<EventHandler>>,
    }

    impl TransportFactory for FakeFactory {
        fn open(
            &self,
            _session_id: u64,
            _estimate: EstimateHandle,
            events: EventHandler,
        ) -> Result<Arc<dyn crate::transport::PeerTransport>> {
            events(TransportEvent::LocalCandidate("local-1".into()));
            *self.events.lock() = Some(events);
            Ok(self.transport.clone())
        }
    }

    fn setup() -> (
        SignalingHandler,
        Arc<FakeFactory>,
        mpsc::Receiver<SignalMessage>,
        SessionRegistry,
    ) {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel();
        let session = registry.create_session(Some(tx));
        let factory = Arc::new(FakeFactory {
            transport: Arc::new(FakeTransport::default()),
            events: Mutex::new(None),
        });
        let handler = SignalingHandler::new(session, registry.clone(), factory.clone());
        (handler, factory, rx, registry)
    }

    #[test]
    fn full_negotiation() {
        let (handler, factory, rx, registry) = setup();
        let id = handler.session_id();

        handler.handle(&SignalMessage::new(id, MessageKind::Hello, "")).unwrap();
        let offer = rx.try_recv().unwrap();
        assert_eq!(offer.kind, MessageKind::Offer);
        assert_eq!(offer.decode_description().unwrap(), "v=0\r\n");
        // local candidate is held back until the answer
        assert!(rx.try_recv().is_err());

        let answer = SignalMessage::description(id, MessageKind::Answer, "answer-sdp");
        handler.handle(&answer).unwrap();
        assert_eq!(*factory.transport.answers.lock(), vec!["answer-sdp"]);
        let candidate = rx.try_recv().unwrap();
        assert_eq!(candidate.kind, MessageKind::Candidate);
        assert_eq!(candidate.payload, "local-1");

        handler
            .handle(&SignalMessage::new(id, MessageKind::Candidate, "remote-1"))
            .unwrap();
        assert_eq!(*factory.transport.candidates.lock(), vec!["remote-1"]);

        let events = factory.events.lock().clone().unwrap();
        events(TransportEvent::Connected);
        assert_eq!(registry.get(id).unwrap().state(), SessionState::Ready);
    }

    #[test]
    fn answer_before_hello_is_negotiation_failure() {
        let (handler, _, _rx, _) = setup();
        let answer = SignalMessage::description(0, MessageKind::Answer, "x");
        assert!(matches!(
            handler.handle(&answer),
            Err(StreamError::NegotiationFailure(_))
        ));
    }

    #[test]
    fn undecodable_answer_is_negotiation_failure() {
        let (handler, _, rx, _) = setup();
        handler.handle(&SignalMessage::new(0, MessageKind::Hello, "")).unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, MessageKind::Offer);
        let err = handler
            .handle(&SignalMessage::new(0, MessageKind::Answer, "%%%"))
            .unwrap_err();
        assert!(matches!(err, StreamError::NegotiationFailure(_)));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn pan_zoom_updates_session() {
        let (handler, _, rx, registry) = setup();
        let id = handler.session_id();
        handler
            .handle(&SignalMessage::new(id, MessageKind::PanZoom, "1,2,3,0,90,0"))
            .unwrap();
        let session = registry.get(id).unwrap();
        assert_eq!(session.pan_zoom().position, [1.0, 2.0, 3.0]);
        assert_eq!(session.pan_zoom().rotation, [0.0, 90.0, 0.0]);

        let err = handler
            .handle(&SignalMessage::new(id, MessageKind::PanZoom, "1,2"))
            .unwrap_err();
        assert!(!err.is_session_fatal());
        assert_eq!(session.pan_zoom().position, [1.0, 2.0, 3.0]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_event_terminates_session() {
        let (handler, factory, rx, registry) = setup();
        let id = handler.session_id();
        handler.handle(&SignalMessage::new(id, MessageKind::Hello, "")).unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, MessageKind::Offer);
        let events = factory.events.lock().clone().unwrap();
        events(TransportEvent::Failed("socket gone".into()));
        assert!(registry.get(id).is_none());
        // later events for the removed session are ignored
        events(TransportEvent::Connected);
    }
}
