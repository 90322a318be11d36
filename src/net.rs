//! TCP transport: the control-port listener, outbound dials and the
//! per-connection actors.
//!
//! Every connection is split into a reader task and a writer task. The
//! reader decodes one message per line and posts [`HubEvent::Inbound`] in
//! arrival order; the writer drains the connection's [`ConnTx`]. Whichever
//! side fails first posts [`HubEvent::Closed`]; the router removes the
//! connection at most once.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::hub::{ConnId, ConnTx, DialRequest, Outbound};
use crate::protocol::Identity;
use crate::protocol::codec::{self, MAX_LINE_BYTES};
use crate::supervisor::bus::{BusHandle, DialPurpose, HubEvent};

// ── listener ──────────────────────────────────────────────────────────────────

/// The hub's control port.
pub struct Listener {
    listener: TcpListener,
    bus: BusHandle,
}

impl Listener {
    pub async fn bind(host: &str, port: u16, bus: BusHandle) -> Result<Self, AppError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AppError::Startup(format!("cannot listen on {host}:{port}: {e}")))?;
        Ok(Self { listener, bus })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_listener(self.listener, self.bus, shutdown))
    }
}

async fn run_listener(listener: TcpListener, bus: BusHandle, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control port listening");
    }
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("listener shutting down");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = bus.next_conn_id();
                    debug!(%conn, %peer, "tcp connection accepted");
                    spawn_connection(stream, conn, bus.clone(), move |tx| HubEvent::Accepted {
                        conn,
                        peer,
                        tx,
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

// ── dialing ───────────────────────────────────────────────────────────────────

fn dialed_identity(purpose: DialPurpose) -> Identity {
    match purpose {
        DialPurpose::Master => Identity::Hub,
        DialPurpose::AuxRelay { .. } => Identity::AuxService,
    }
}

/// Open `request` and register it with the router.
pub async fn connect(request: &DialRequest, bus: &BusHandle) -> std::io::Result<()> {
    let stream = TcpStream::connect((request.host.as_str(), request.port)).await?;
    let conn = bus.next_conn_id();
    let identity = dialed_identity(request.purpose);
    let purpose = request.purpose;
    info!(%conn, host = %request.host, port = request.port, ?purpose, "outbound connection open");
    spawn_connection(stream, conn, bus.clone(), move |tx| HubEvent::Connected {
        conn,
        identity,
        purpose,
        tx,
    });
    Ok(())
}

/// Dial in the background; failure comes back as [`HubEvent::DialFailed`].
pub fn spawn_dial(request: DialRequest, bus: BusHandle) {
    tokio::spawn(async move {
        if let Err(e) = connect(&request, &bus).await {
            warn!(host = %request.host, port = request.port, error = %e, "dial failed");
            bus.send(HubEvent::DialFailed {
                purpose: request.purpose,
                error: e.to_string(),
            })
            .await;
        }
    });
}

// ── connection actors ─────────────────────────────────────────────────────────

/// Start the reader and writer of one connection.
///
/// `opened` builds the event announcing the connection; it is posted before
/// the first inbound message so the router always knows the connection when
/// its traffic arrives.
pub fn spawn_connection<F>(stream: TcpStream, conn: ConnId, bus: BusHandle, opened: F)
where
    F: FnOnce(ConnTx) -> HubEvent + Send + 'static,
{
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%conn, error = %e, "set_nodelay failed");
    }
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let closing = CancellationToken::new();

    tokio::spawn(write_loop(conn, write, rx, bus.clone(), closing.clone()));
    tokio::spawn(async move {
        if !bus.send(opened(tx)).await {
            return;
        }
        read_loop(conn, read, bus, closing).await;
    });
}

async fn read_loop(conn: ConnId, read: OwnedReadHalf, bus: BusHandle, closing: CancellationToken) {
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    // Room for the payload and a CRLF terminator.
    let limit = (MAX_LINE_BYTES + 2) as u64;

    let reason = loop {
        line.clear();
        let mut limited = (&mut reader).take(limit);
        let result = tokio::select! {
            biased;

            _ = closing.cancelled() => break "connection closed".to_string(),

            n = limited.read_line(&mut line) => n,
        };
        match result {
            Ok(0) => break "peer closed".to_string(),
            Ok(_) => {
                let text = line.trim_end_matches(['\n', '\r']);
                if text.len() > MAX_LINE_BYTES {
                    break format!("message exceeds {MAX_LINE_BYTES} bytes");
                }
                if text.trim().is_empty() {
                    continue;
                }
                match codec::decode(text) {
                    Ok(message) => {
                        if !bus.send(HubEvent::Inbound { conn, message }).await {
                            return;
                        }
                    }
                    Err(e) => break e.to_string(),
                }
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };

    debug!(%conn, %reason, "reader finished");
    bus.send(HubEvent::Closed { conn, reason }).await;
}

async fn write_loop(
    conn: ConnId,
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    bus: BusHandle,
    closing: CancellationToken,
) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Message(msg) => {
                let line = match codec::encode(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(%conn, error = %e, "message not sent");
                        continue;
                    }
                };
                if let Err(e) = write.write_all(line.as_bytes()).await {
                    bus.send(HubEvent::Closed {
                        conn,
                        reason: format!("write failed: {e}"),
                    })
                    .await;
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = write.shutdown().await {
        debug!(%conn, error = %e, "socket shutdown failed");
    }
    closing.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{self, Body};
    use crate::protocol::id;
    use crate::supervisor::bus::HubBus;

    /// A client socket whose server side is wired to `bus`.
    async fn accepted(bus: &BusHandle) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let conn = bus.next_conn_id();
        spawn_connection(server, conn, bus.clone(), move |tx| HubEvent::Accepted { conn, peer, tx });
        client
    }

    /// A quit message padded with JSON whitespace to `len` bytes, plus `eol`.
    fn padded(len: usize, eol: &str) -> Vec<u8> {
        let mut line = serde_json::to_string(&message::quit(id::BROADCAST)).unwrap().into_bytes();
        line.resize(len, b' ');
        line.extend_from_slice(eol.as_bytes());
        line
    }

    async fn next_after_accept(bus: &mut HubBus) -> HubEvent {
        assert!(matches!(bus.rx.recv().await, Some(HubEvent::Accepted { .. })));
        bus.rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn line_of_exactly_the_limit_is_accepted() {
        for eol in ["\n", "\r\n"] {
            let mut bus = HubBus::new(8);
            let mut client = accepted(&bus.handle).await;
            let line = padded(MAX_LINE_BYTES, eol);
            tokio::spawn(async move {
                client.write_all(&line).await.unwrap();
                client
            });
            match next_after_accept(&mut bus).await {
                HubEvent::Inbound { message, .. } => {
                    assert_eq!(message.body, Body::Quit { id: id::BROADCAST })
                }
                _ => panic!("expected the message to arrive"),
            }
        }
    }

    #[tokio::test]
    async fn line_over_the_limit_closes_the_connection() {
        let mut bus = HubBus::new(8);
        let mut client = accepted(&bus.handle).await;
        let line = padded(MAX_LINE_BYTES + 1, "\n");
        tokio::spawn(async move {
            let _ = client.write_all(&line).await;
            client
        });
        match next_after_accept(&mut bus).await {
            HubEvent::Closed { reason, .. } => assert!(reason.contains("exceeds"), "{reason}"),
            _ => panic!("expected the connection to close"),
        }
    }
}
