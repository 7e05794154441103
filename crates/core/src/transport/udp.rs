use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Result, StreamError};
use crate::media::EncodedFrame;
use crate::session::{BandwidthEstimate, EstimateHandle};
use crate::signaling::sdp;
use crate::transport::{EventHandler, PeerTransport, TransportEvent, TransportFactory};
use crate::wire::{self, MAX_DATAGRAM_SIZE, PacketType, TYPE_TAG_LEN};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Opens one [`UdpPeerTransport`] per viewer.
///
/// There is no congestion controller here: every viewer gets the same
/// configured estimate, written once when its transport opens.
#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    bind_ip: IpAddr,
    public_host: Option<String>,
    estimate: BandwidthEstimate,
}

impl UdpTransportFactory {
    pub fn new(bind_ip: IpAddr, public_host: Option<String>, estimate: BandwidthEstimate) -> Self {
        Self {
            bind_ip,
            public_host,
            estimate,
        }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn open(
        &self,
        session_id: u64,
        estimate: EstimateHandle,
        events: EventHandler,
    ) -> Result<Arc<dyn PeerTransport>> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let local = socket.local_addr()?;

        let host_ip = if local.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            local.ip()
        };
        let host = self
            .public_host
            .clone()
            .unwrap_or_else(|| host_ip.to_string());

        estimate.update(self.estimate);

        let transport = Arc::new(UdpPeerTransport {
            session_id,
            socket: Arc::new(socket),
            remote: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(true)),
            host,
            port: local.port(),
        });

        let reader = transport.clone();
        let reader_events = events.clone();
        thread::Builder::new()
            .name(format!("media-{session_id}"))
            .spawn(move || reader.read_loop(reader_events))?;

        tracing::debug!(session_id, %local, "media socket open");
        events(TransportEvent::LocalCandidate(sdp::format_candidate(
            SocketAddr::new(host_ip, local.port()),
        )));

        Ok(transport)
    }
}

/// Reference transport: plain UDP to the address the viewer announced.
///
/// Outbound frames are serialized with [`EncodedFrame::to_bytes`] and
/// fragmented into type-0 chunk datagrams whose frame number is the
/// frame's sequence number. Inbound type-2 datagrams are the viewer's
/// upstream chunks. The first datagram from the viewer's address marks
/// the transport connected.
pub struct UdpPeerTransport {
    session_id: u64,
    socket: Arc<UdpSocket>,
    remote: Arc<RwLock<Option<SocketAddr>>>,
    running: Arc<AtomicBool>,
    host: String,
    port: u16,
}

impl UdpPeerTransport {
    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.read()
    }

    fn set_remote(&self, addr: SocketAddr) {
        let previous = self.remote.write().replace(addr);
        if previous != Some(addr) {
            tracing::debug!(session_id = self.session_id, remote = %addr, "viewer media address set");
        }
    }

    fn read_loop(&self, events: EventHandler) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut connected = false;

        while self.running.load(Ordering::SeqCst) {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        events(TransportEvent::Failed(e.to_string()));
                    }
                    break;
                }
            };

            if self.remote_addr() != Some(from) {
                tracing::trace!(session_id = self.session_id, %from, "datagram from unknown address dropped");
                continue;
            }

            if !connected {
                connected = true;
                events(TransportEvent::Connected);
            }

            match wire::packet_type(&buf[..n]) {
                Ok(PacketType::FrameChunk) => {
                    events(TransportEvent::InboundChunk(buf[TYPE_TAG_LEN..n].to_vec()));
                }
                Ok(packet_type) => {
                    tracing::trace!(session_id = self.session_id, ?packet_type, bytes = n, "keepalive");
                }
                Err(e) => {
                    tracing::warn!(session_id = self.session_id, error = %e, "malformed datagram dropped");
                }
            }
        }

        tracing::debug!(session_id = self.session_id, "media reader exited");
    }
}

impl PeerTransport for UdpPeerTransport {
    fn create_offer(&self) -> Result<String> {
        Ok(sdp::generate_offer(self.session_id, &self.host, self.port))
    }

    fn apply_answer(&self, answer: &str) -> Result<()> {
        let addr = sdp::parse_media_addr(answer)?;
        self.set_remote(addr);
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        let addr = sdp::parse_candidate(candidate)?;
        let mut remote = self.remote.write();
        if remote.is_none() {
            *remote = Some(addr);
        }
        Ok(())
    }

    fn send(&self, frame: &EncodedFrame) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(StreamError::transport(self.session_id, "transport closed"));
        }
        let remote = self
            .remote_addr()
            .ok_or_else(|| StreamError::transport(self.session_id, "viewer address unknown"))?;

        let datagrams = wire::fragment_frame(PacketType::FrameData, frame.sequence, &frame.to_bytes())?;
        for datagram in &datagrams {
            self.socket
                .send_to(datagram, remote)
                .map_err(|e| StreamError::transport(self.session_id, e))?;
        }

        tracing::trace!(
            session_id = self.session_id,
            sequence = frame.sequence,
            bytes = frame.payload.len(),
            datagrams = datagrams.len(),
            "frame sent"
        );
        Ok(())
    }

    fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::debug!(session_id = self.session_id, "media transport closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::FragmentAssembler;
    use parking_lot::Mutex;

    fn factory() -> UdpTransportFactory {
        UdpTransportFactory::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            None,
            BandwidthEstimate::fixed(600_000),
        )
    }

    fn recording_events() -> (EventHandler, Arc<Mutex<Vec<TransportEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |e| sink.lock().push(e));
        (handler, seen)
    }

    fn wait_for(seen: &Mutex<Vec<TransportEvent>>, pred: impl Fn(&TransportEvent) -> bool) -> bool {
        for _ in 0..100 {
            if seen.lock().iter().any(&pred) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn open_writes_estimate_and_emits_candidate() {
        let estimate = EstimateHandle::default();
        let (events, seen) = recording_events();
        let transport = factory().open(1, estimate.clone(), events).unwrap();
        assert_eq!(estimate.get().target_bitrate_bps, 600_000);

        let offer = transport.create_offer().unwrap();
        let offered = sdp::parse_media_addr(&offer).unwrap();
        let candidate = match &seen.lock()[0] {
            TransportEvent::LocalCandidate(c) => sdp::parse_candidate(c).unwrap(),
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(offered, candidate);
        transport.close();
    }

    #[test]
    fn send_before_answer_fails() {
        let (events, _) = recording_events();
        let transport = factory().open(2, EstimateHandle::default(), events).unwrap();
        assert!(matches!(
            transport.send(&EncodedFrame::new(0, vec![1])),
            Err(StreamError::TransportFailure { .. })
        ));
        transport.close();
        transport.close();
    }

    #[test]
    fn media_roundtrip_with_viewer_socket() {
        let viewer = UdpSocket::bind("127.0.0.1:0").unwrap();
        viewer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let (events, seen) = recording_events();
        let transport = factory().open(3, EstimateHandle::default(), events).unwrap();
        let server_addr = sdp::parse_media_addr(&transport.create_offer().unwrap()).unwrap();
        transport
            .apply_answer(&sdp::generate_answer(viewer.local_addr().unwrap()))
            .unwrap();

        // punch: any datagram from the viewer connects the transport
        viewer.send_to(&7u32.to_le_bytes(), server_addr).unwrap();
        assert!(wait_for(&seen, |e| *e == TransportEvent::Connected));

        let payload: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
        transport.send(&EncodedFrame::new(9, payload.clone())).unwrap();

        let mut assembler = FragmentAssembler::default();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let frame = loop {
            let n = viewer.recv(&mut buf).unwrap();
            assert_eq!(wire::packet_type(&buf[..n]).unwrap(), PacketType::FrameData);
            let (header, body) = wire::decode_chunk(&buf[TYPE_TAG_LEN..n]).unwrap();
            assert_eq!(header.frame_number, 9);
            if let Some(done) = assembler.ingest(&header, body).unwrap() {
                break done;
            }
        };
        let decoded = EncodedFrame::from_bytes(&frame.data).unwrap();
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.payload, payload);

        // upstream chunk from the viewer surfaces as an event
        let chunk = wire::encode_chunk(
            PacketType::FrameChunk,
            &wire::ChunkHeader {
                frame_number: 1,
                frame_length: 2,
                offset: 0,
                length: 2,
            },
            b"up",
        );
        viewer.send_to(&chunk, server_addr).unwrap();
        assert!(wait_for(&seen, |e| matches!(e, TransportEvent::InboundChunk(_))));

        transport.close();
    }

    #[test]
    fn strangers_do_not_connect() {
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let (events, seen) = recording_events();
        let transport = factory().open(4, EstimateHandle::default(), events).unwrap();
        let server_addr = sdp::parse_media_addr(&transport.create_offer().unwrap()).unwrap();
        stranger.send_to(b"ping", server_addr).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(!seen.lock().iter().any(|e| *e == TransportEvent::Connected));
        transport.close();
    }
}
