//! Integration test: full viewer flow hello → offer → answer → candidate,
//! then layered frames over UDP and an upstream frame back.
//!
//! Starts the server on an ephemeral port, plays the viewer with a TCP
//! signaling client and a UDP media socket, and checks what arrives.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use layercast::assembly::FragmentAssembler;
use layercast::media::{EncodedFrame, LayeredContent, SourceFrame};
use layercast::session::BandwidthEstimate;
use layercast::signaling::{MessageKind, SignalMessage, sdp};
use layercast::source::FileSource;
use layercast::telemetry::MemoryTelemetry;
use layercast::wire::{self, ChunkHeader, MAX_DATAGRAM_SIZE, PacketType, TYPE_TAG_LEN};
use layercast::{Server, ServerConfig};

fn read_message(reader: &mut BufReader<TcpStream>) -> SignalMessage {
    let mut line = String::new();
    let n = reader.read_line(&mut line).expect("signaling read");
    assert!(n > 0, "signaling connection closed");
    SignalMessage::parse(&line).expect("valid signaling line")
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn start_server(telemetry: Arc<MemoryTelemetry>) -> Server {
    let config = ServerConfig {
        signaling_addr: "127.0.0.1:0".into(),
        media_bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        static_estimate: BandwidthEstimate::fixed(600_000),
        ..ServerConfig::default()
    };
    let content = LayeredContent::from_frames(vec![
        SourceFrame::new(vec![0xA0; 1000], vec![0xA1; 500], vec![0xA2; 200]),
        SourceFrame::new(vec![0xB0; 1000], vec![0xB1; 500], vec![0xB2; 200]),
    ])
    .unwrap();

    let mut server = Server::new(config)
        .with_source(Box::new(FileSource::new(content, 30).unwrap()))
        .with_telemetry(telemetry);
    server.start().expect("server start");
    server
}

#[test]
fn viewer_negotiates_and_receives_layered_frames() {
    let telemetry = Arc::new(MemoryTelemetry::new());
    let mut server = start_server(telemetry.clone());
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect to server");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    // hello -> offer
    writeln!(stream, "0@1@").unwrap();
    let offer = read_message(&mut reader);
    assert_eq!(offer.kind, MessageKind::Offer);
    let offer_sdp = offer.decode_description().unwrap();
    assert!(offer_sdp.contains("a=tool:layercast"));
    let server_media = sdp::parse_media_addr(&offer_sdp).unwrap();

    // answer -> held candidate is flushed
    let viewer = UdpSocket::bind("127.0.0.1:0").unwrap();
    viewer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let answer = SignalMessage::description(
        offer.client_id,
        MessageKind::Answer,
        &sdp::generate_answer(viewer.local_addr().unwrap()),
    );
    writeln!(stream, "{}", answer.serialize()).unwrap();
    let candidate = read_message(&mut reader);
    assert_eq!(candidate.kind, MessageKind::Candidate);
    assert_eq!(sdp::parse_candidate(&candidate.payload).unwrap(), server_media);

    // first datagram from the viewer connects the transport
    viewer.send_to(&3u32.to_le_bytes(), server_media).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        server.registry().ready_sessions().len() == 1
    }));

    // 600 kbit/s at 30 fps is 2500 bytes per frame: all three layers fit
    let mut assembler = FragmentAssembler::default();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let completed = loop {
        let n = viewer.recv(&mut buf).expect("media datagram");
        assert_eq!(wire::packet_type(&buf[..n]).unwrap(), PacketType::FrameData);
        let (header, body) = wire::decode_chunk(&buf[TYPE_TAG_LEN..n]).unwrap();
        if let Some(done) = assembler.ingest(&header, body).unwrap() {
            break done;
        }
    };
    let frame = EncodedFrame::from_bytes(&completed.data).expect("encoded frame");
    assert_eq!(frame.source_id, 0);
    assert_eq!(frame.sequence, completed.frame_number);
    assert_eq!(frame.payload.len(), 1700);
    assert_eq!(frame.payload[0] & 0x0F, 0x00);
    assert_eq!(frame.payload[1000] & 0x0F, 0x01);
    assert_eq!(frame.payload[1500] & 0x0F, 0x02);

    // upstream chunk from the viewer lands in its session
    let upstream = wire::encode_chunk(
        PacketType::FrameChunk,
        &ChunkHeader {
            frame_number: 5,
            frame_length: 4,
            offset: 0,
            length: 4,
        },
        b"ping",
    );
    viewer.send_to(&upstream, server_media).unwrap();
    let session = server.registry().get(offer.client_id).expect("session");
    let mut received = None;
    assert!(wait_until(Duration::from_secs(2), || {
        received = session.try_next_upstream_frame();
        received.is_some()
    }));
    assert_eq!(received.unwrap().data, b"ping");

    assert!(!telemetry.frames_for(session.id()).is_empty());

    // hang up: the session goes away
    drop(reader);
    stream.shutdown(std::net::Shutdown::Both).unwrap();
    assert!(wait_until(Duration::from_secs(2), || server.registry().is_empty()));
    assert!(session.is_terminated());

    server.stop();
    assert!(!server.is_running());
}

#[test]
fn garbage_answer_closes_only_that_viewer() {
    let mut server = start_server(Arc::new(MemoryTelemetry::new()));
    let addr = server.local_addr().unwrap();

    let mut good = TcpStream::connect(addr).unwrap();
    good.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut good_reader = BufReader::new(good.try_clone().unwrap());
    writeln!(good, "0@1@").unwrap();
    assert_eq!(read_message(&mut good_reader).kind, MessageKind::Offer);

    let mut bad = TcpStream::connect(addr).unwrap();
    bad.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut bad_reader = BufReader::new(bad.try_clone().unwrap());
    writeln!(bad, "1@1@").unwrap();
    assert_eq!(read_message(&mut bad_reader).kind, MessageKind::Offer);
    writeln!(bad, "1@3@not-a-description").unwrap();

    // the server hangs up on the offending viewer
    let mut rest = String::new();
    assert_eq!(bad_reader.read_line(&mut rest).unwrap_or(0), 0);

    assert!(wait_until(Duration::from_secs(2), || server.registry().len() == 1));
    assert!(server.registry().get(0).is_some());

    server.stop();
}
