use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use crate::session::{SessionRegistry, ViewerSession};
use crate::signaling::{SignalMessage, SignalingHandler};
use crate::transport::TransportFactory;

const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Non-blocking TCP accept loop for signaling connections.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    registry: SessionRegistry,
    factory: Arc<dyn TransportFactory>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let registry = registry.clone();
                let factory = factory.clone();
                let running = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, registry, factory, running);
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// One viewer's signaling connection; owns exactly one session.
struct Connection {
    reader: BufReader<TcpStream>,
    handler: SignalingHandler,
    session: Arc<ViewerSession>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: create the session, start the writer, run the reader.
    pub fn handle(
        stream: TcpStream,
        registry: SessionRegistry,
        factory: Arc<dyn TransportFactory>,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };
        if stream.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
            return;
        }
        let writer_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let (tx, rx) = mpsc::channel();
        let session = registry.create_session(Some(tx));
        let session_id = session.id();
        tracing::info!(%peer_addr, session_id, "viewer connected");

        thread::spawn(move || write_loop(writer_stream, rx, peer_addr));

        let mut conn = Connection {
            reader: BufReader::new(stream),
            handler: SignalingHandler::new(session.clone(), registry.clone(), factory),
            session,
            peer_addr,
        };

        let reason = conn.run(&running);
        registry.terminate(session_id);
        // the writer exits once the session drops its sender; make sure
        // the peer sees the close even if the writer is mid-write
        conn.reader.get_ref().shutdown(Shutdown::Both).ok();

        tracing::info!(%peer_addr, session_id, reason, "viewer disconnected");
    }

    /// Signaling read loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        let mut line = String::new();
        while running.load(Ordering::SeqCst) {
            if self.session.is_terminated() {
                return "session terminated";
            }

            match self.reader.read_line(&mut line) {
                Ok(0) => return "connection closed by client",
                Ok(_) => {}
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    // partial line stays in `line` until the rest arrives
                    continue;
                }
                Err(_) => return "read error",
            }
            if !line.ends_with('\n') {
                continue;
            }

            let text = std::mem::take(&mut line);
            if text.trim().is_empty() {
                continue;
            }

            let message = match SignalMessage::parse(&text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                    continue;
                }
            };
            tracing::debug!(
                peer = %self.peer_addr,
                session_id = self.handler.session_id(),
                kind = ?message.kind,
                "signal"
            );

            if let Err(e) = self.handler.handle(&message) {
                if e.is_session_fatal() {
                    tracing::error!(session_id = self.handler.session_id(), error = %e, "negotiation failed");
                    return "negotiation failed";
                }
                tracing::warn!(session_id = self.handler.session_id(), error = %e, "signal rejected");
            }
        }

        "server shutting down"
    }
}

/// Drains the session's outbox onto the socket until the session is gone.
fn write_loop(mut stream: TcpStream, outbox: Receiver<SignalMessage>, peer_addr: SocketAddr) {
    for message in outbox {
        let line = format!("{}\n", message.serialize());
        if stream.write_all(line.as_bytes()).is_err() {
            tracing::debug!(%peer_addr, "signaling write failed");
            break;
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}
