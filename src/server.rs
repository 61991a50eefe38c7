//! Rendezvous server: accept loop and per-connection session handling.
//!
//! Each accepted connection gets two tasks: a session task that reads framed
//! messages and drives the Unregistered → Registered → Closed state machine,
//! and a writer task that drains the connection's outbox to the socket.
//! Session failures are caught at the spawn boundary and converted into the
//! teardown-and-notify sequence; they never reach the acceptor or other
//! connections' workers.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;

use tracing::{debug, info, warn};

use crate::codec::ReadError;
use crate::message::{read_message, DecodeError, ErrorCode, Message, ParticipantInfo};
use crate::registry::{ConnectionHandle, RegisterError, Registry};

/// Deadline for one framed read, header and payload alike.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive timed-out reads tolerated before the connection is dropped.
const MAX_READ_RETRIES: u32 = 5;

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until the shutdown future resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_session(stream, peer, &registry),
                        Err(err) => warn!(error = ?err, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, registry).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// How a session left its read loop.
enum Close {
    /// DISCONNECT, or the peer closed the stream at a frame boundary.
    Clean,
    /// Too many consecutive reads timed out.
    Idle,
    Transport(ReadError),
}

enum SessionState {
    Unregistered,
    Registered { nickname: String },
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(run_writer(writer, outbox_rx));

    let close = run_session(&mut reader, &outbox, &registry, peer).await;

    // Writer drains whatever is still queued (a final ERROR, the last
    // fan-out frames), then shuts the socket down.
    drop(outbox);
    let _ = writer_task.await;

    match close {
        Close::Clean => Ok(()),
        Close::Idle => {
            info!(?peer, "dropping connection after repeated read timeouts");
            Ok(())
        }
        Close::Transport(err) => Err(err.into()),
    }
}

async fn run_writer(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(error = ?err, "failed to deliver frame; dropping connection writer");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_session(
    reader: &mut BufReader<OwnedReadHalf>,
    outbox: &ConnectionHandle,
    registry: &Arc<Registry>,
    peer: Option<SocketAddr>,
) -> Close {
    let mut state = SessionState::Unregistered;
    let mut timeouts = 0u32;

    let close = loop {
        let deadline = Instant::now() + READ_TIMEOUT;
        match read_message(reader, deadline).await {
            Ok(Some(message)) => {
                timeouts = 0;
                match dispatch(message, &mut state, outbox, registry, peer).await {
                    Flow::Continue => {}
                    Flow::Disconnect => break Close::Clean,
                }
            }
            Ok(None) => break Close::Clean,
            Err(DecodeError::Read(ReadError::Timeout)) => {
                timeouts += 1;
                if timeouts >= MAX_READ_RETRIES {
                    break Close::Idle;
                }
            }
            Err(DecodeError::Read(err)) => break Close::Transport(err),
            Err(err) => match err.error_code() {
                // Malformed but frame-delimited input: answer and carry on.
                Some(code) => enqueue(outbox, &Message::Error { code }),
                None => break Close::Transport(ReadError::Closed),
            },
        }
    };

    teardown(state, registry, peer).await;
    close
}

enum Flow {
    Continue,
    Disconnect,
}

async fn dispatch(
    message: Message,
    state: &mut SessionState,
    outbox: &ConnectionHandle,
    registry: &Arc<Registry>,
    peer: Option<SocketAddr>,
) -> Flow {
    match message {
        Message::Register { ip, udp_port, nickname } => {
            match state {
                SessionState::Unregistered => {
                    if try_register(&nickname, ip, udp_port, outbox, registry, peer).await {
                        *state = SessionState::Registered { nickname };
                    }
                }
                // A second REGISTER on a live session is out of protocol.
                SessionState::Registered { .. } => {
                    enqueue(outbox, &Message::Error {
                        code: ErrorCode::UnknownMessageId,
                    });
                }
            }
            Flow::Continue
        }
        Message::Broadcast { text } => {
            match state {
                SessionState::Unregistered => {
                    enqueue(outbox, &Message::Error {
                        code: ErrorCode::UnknownMessageId,
                    });
                }
                SessionState::Registered { nickname } => {
                    if text.is_empty() {
                        enqueue(outbox, &Message::Error {
                            code: ErrorCode::EmptyText,
                        });
                    } else {
                        let frame = Message::Broadcast { text }.encode();
                        registry.fan_out(&frame, Some(nickname.as_str())).await;
                    }
                }
            }
            Flow::Continue
        }
        Message::Disconnect => Flow::Disconnect,
        Message::Error { code } => {
            // Clients may report errors (e.g. an invalid client list); there
            // is nothing to do beyond recording it.
            warn!(?peer, %code, "client reported a protocol error");
            Flow::Continue
        }
        // Server-to-client kinds arriving at the server are out of protocol.
        Message::RegisterAck { .. }
        | Message::ClientJoined(_)
        | Message::ClientLeft { .. }
        | Message::PeerRequest { .. }
        | Message::PeerMessage { .. } => {
            enqueue(outbox, &Message::Error {
                code: ErrorCode::UnknownMessageId,
            });
            Flow::Continue
        }
    }
}

/// Validates and performs a registration. On success the REGISTER_ACK is
/// enqueued atomically with the insertion (nothing can reach the new outbox
/// ahead of it) and CLIENT_JOINED fans out to everyone already registered.
async fn try_register(
    nickname: &str,
    ip: Ipv4Addr,
    udp_port: u16,
    outbox: &ConnectionHandle,
    registry: &Arc<Registry>,
    peer: Option<SocketAddr>,
) -> bool {
    if nickname.is_empty() {
        enqueue(outbox, &Message::Error {
            code: ErrorCode::EmptyText,
        });
        return false;
    }

    let ack_outbox = outbox.clone();
    let registered = registry
        .register_with(nickname, ip, udp_port, outbox.clone(), |existing| {
            let participants = existing.iter().map(|record| record.info()).collect();
            let _ = ack_outbox.send(Message::RegisterAck { participants }.encode());
        })
        .await;

    match registered {
        Ok(()) => {
            let joined = Message::ClientJoined(ParticipantInfo {
                nickname: nickname.to_string(),
                ip,
                udp_port,
            });
            registry.fan_out(&joined.encode(), Some(nickname)).await;
            info!(?peer, nickname, %ip, udp_port, "participant joined");
            true
        }
        Err(RegisterError::AddressTaken) => {
            enqueue(outbox, &Message::Error {
                code: ErrorCode::AddressTaken,
            });
            false
        }
        Err(RegisterError::NicknameTaken) => {
            enqueue(outbox, &Message::Error {
                code: ErrorCode::NicknameTaken,
            });
            false
        }
    }
}

/// Removes the participant (if registered) and notifies the remaining
/// participants: exactly once per departure, and never the departing
/// connection itself.
async fn teardown(state: SessionState, registry: &Arc<Registry>, peer: Option<SocketAddr>) {
    if let SessionState::Registered { nickname } = state {
        if let Some(record) = registry.unregister(&nickname).await {
            info!(?peer, nickname = %record.nickname, "participant left");
            let left = Message::ClientLeft {
                nickname: record.nickname,
            };
            registry.fan_out(&left.encode(), None).await;
        }
    }
}

fn enqueue(outbox: &ConnectionHandle, message: &Message) {
    // A closed outbox means the writer is already gone; the read loop will
    // observe the closed socket on its own.
    if outbox.send(message.encode()).is_err() {
        debug!("outbox closed while enqueueing a reply");
    }
}
