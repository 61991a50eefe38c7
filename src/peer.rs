//! Direct participant-to-participant sessions.
//!
//! The rendezvous is a two-phase handshake that leaves the central server
//! out entirely: the initiator sends one PEER_REQUEST datagram announcing
//! its peer TCP port, and the target dials back to the datagram's source
//! address on that port. From then on both ends speak only bare
//! length-prefixed frames until either side closes the stream.
//!
//! Datagram loss is not retried here; the user can re-issue the invitation.
//! A closed peer stream ends the session silently; the server is never told.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::codec::{self, ReadError};
use crate::message::{Message, ParticipantInfo, MAX_TEXT_BYTES};

/// Deadline per peer-frame read. Expiry re-arms the read; peers may idle.
const PEER_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// PEER_REQUEST fits in 3 + 255 bytes; anything larger is foreign traffic.
const DATAGRAM_BUF_BYTES: usize = 512;

/// What the peer endpoint reports back for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    InvitationReceived { nickname: String, addr: SocketAddr },
    SessionOpened { nickname: String },
    MessageReceived { nickname: String, text: String },
    SessionClosed { nickname: String },
}

#[derive(Debug, Error)]
pub enum PeerSendError {
    #[error("no active peer session; use /peer <name> first")]
    NoSession,
    #[error("the peer session has closed")]
    SessionClosed,
    #[error("peer message is longer than {MAX_TEXT_BYTES} bytes")]
    MessageTooLong,
}

/// An ephemeral direct session. Only one is remembered at a time, and only
/// so `/msg` has a target; correctness never depends on it.
struct ActiveSession {
    nickname: String,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct PeerState {
    /// Nickname from the most recent outstanding invitation; an accepted
    /// stream is attributed to it (the initiator never learns the caller's
    /// name from the stream itself).
    pending_invite: Option<String>,
    active: Option<ActiveSession>,
}

struct Shared {
    udp: UdpSocket,
    udp_port: u16,
    tcp_port: u16,
    nickname: String,
    state: Mutex<PeerState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// A participant's peer-facing endpoints: the UDP socket invitations arrive
/// on and the TCP listener peers dial back to. Binding spawns the two
/// background workers; all activity is reported on the returned event
/// channel.
#[derive(Clone)]
pub struct PeerEndpoint {
    shared: Arc<Shared>,
}

impl PeerEndpoint {
    /// Binds the UDP and TCP endpoints (port 0 picks ephemeral ports) and
    /// starts the invitation listener and the peer accept loop.
    pub async fn bind(
        udp_port: u16,
        tcp_port: u16,
        nickname: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, udp_port))
            .await
            .context("failed to bind the peer invitation socket")?;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, tcp_port))
            .await
            .context("failed to bind the peer listener")?;

        let udp_port = udp.local_addr()?.port();
        let tcp_port = listener.local_addr()?.port();
        let (events, events_rx) = mpsc::unbounded_channel();

        let endpoint = Self {
            shared: Arc::new(Shared {
                udp,
                udp_port,
                tcp_port,
                nickname: nickname.to_string(),
                state: Mutex::new(PeerState::default()),
                events,
            }),
        };

        tokio::spawn(run_invite_listener(endpoint.clone()));
        tokio::spawn(run_accept_loop(endpoint.clone(), listener));

        Ok((endpoint, events_rx))
    }

    /// The UDP port to advertise in REGISTER.
    pub fn udp_port(&self) -> u16 {
        self.shared.udp_port
    }

    /// The TCP port announced in outgoing PEER_REQUEST datagrams.
    pub fn tcp_port(&self) -> u16 {
        self.shared.tcp_port
    }

    /// Sends one invitation datagram to the target's advertised UDP
    /// endpoint. Loss is the caller's problem; re-inviting is cheap.
    pub async fn invite(&self, target: &ParticipantInfo) -> Result<()> {
        self.shared.state.lock().await.pending_invite = Some(target.nickname.clone());

        let datagram = Message::PeerRequest {
            tcp_port: self.shared.tcp_port,
            nickname: self.shared.nickname.clone(),
        }
        .encode();
        self.shared
            .udp
            .send_to(&datagram, (target.ip, target.udp_port))
            .await
            .with_context(|| format!("failed to send invitation to {}", target.nickname))?;
        Ok(())
    }

    /// Enqueues one frame on the active session. Returns the remote
    /// nickname the message went to.
    pub async fn send(&self, text: &str) -> Result<String, PeerSendError> {
        if text.len() > MAX_TEXT_BYTES {
            return Err(PeerSendError::MessageTooLong);
        }
        let state = self.shared.state.lock().await;
        let session = state.active.as_ref().ok_or(PeerSendError::NoSession)?;
        let frame = Message::PeerMessage {
            text: text.to_string(),
        }
        .encode();
        session
            .outbox
            .send(frame)
            .map_err(|_| PeerSendError::SessionClosed)?;
        Ok(session.nickname.clone())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.shared.events.send(event);
    }
}

/// Receives PEER_REQUEST datagrams and dials back to the requester. Each
/// dial runs in its own task so a slow connect never stalls the listener.
async fn run_invite_listener(endpoint: PeerEndpoint) {
    let mut buf = [0u8; DATAGRAM_BUF_BYTES];
    loop {
        let (len, addr) = match endpoint.shared.udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!(error = ?err, "peer invitation socket failed");
                break;
            }
        };
        match Message::decode_datagram(&buf[..len]) {
            Ok(Message::PeerRequest { tcp_port, nickname }) => {
                endpoint.emit(PeerEvent::InvitationReceived {
                    nickname: nickname.clone(),
                    addr,
                });
                let endpoint = endpoint.clone();
                tokio::spawn(connect_back(endpoint, addr, tcp_port, nickname));
            }
            Ok(other) => warn!(%addr, ?other, "ignoring unexpected datagram"),
            Err(err) => warn!(%addr, error = %err, "ignoring malformed datagram"),
        }
    }
}

/// Completes the rendezvous from the invited side: the requester's IP comes
/// from the datagram's source address, the TCP port from its payload.
async fn connect_back(endpoint: PeerEndpoint, from: SocketAddr, tcp_port: u16, nickname: String) {
    match TcpStream::connect((from.ip(), tcp_port)).await {
        Ok(stream) => run_session(endpoint, stream, nickname).await,
        Err(err) => {
            warn!(%nickname, %from, tcp_port, error = ?err, "failed to connect back to inviter");
        }
    }
}

async fn run_accept_loop(endpoint: PeerEndpoint, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let nickname = endpoint
                    .shared
                    .state
                    .lock()
                    .await
                    .pending_invite
                    .take()
                    .unwrap_or_else(|| addr.to_string());
                tokio::spawn(run_session(endpoint.clone(), stream, nickname));
            }
            Err(err) => warn!(error = ?err, "failed to accept peer connection"),
        }
    }
}

/// Drives one established peer stream until it closes: a writer task drains
/// the session outbox, and this task decodes incoming bare frames.
async fn run_session(endpoint: PeerEndpoint, stream: TcpStream, nickname: String) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let outbox_probe = outbox.clone();

    {
        let mut state = endpoint.shared.state.lock().await;
        state.active = Some(ActiveSession {
            nickname: nickname.clone(),
            outbox,
        });
    }
    endpoint.emit(PeerEvent::SessionOpened {
        nickname: nickname.clone(),
    });

    let writer_task = tokio::spawn(drain_outbox(writer, outbox_rx));

    loop {
        let deadline = Instant::now() + PEER_READ_TIMEOUT;
        match codec::read_frame(&mut reader, deadline).await {
            Ok(Some(payload)) => match Message::decode_peer_frame(&payload) {
                Ok(Message::PeerMessage { text }) => {
                    endpoint.emit(PeerEvent::MessageReceived {
                        nickname: nickname.clone(),
                        text,
                    });
                }
                Ok(other) => debug!(?other, "ignoring unexpected peer frame"),
                Err(err) => warn!(%nickname, error = %err, "ignoring undecodable peer frame"),
            },
            Ok(None) => break,
            Err(ReadError::Timeout) => continue,
            Err(err) => {
                debug!(%nickname, error = ?err, "peer stream failed");
                break;
            }
        }
    }

    // Forget the session if it is still the remembered one (a newer session
    // may have replaced it, even under the same nickname), then let the
    // writer drain and close the socket.
    {
        let mut state = endpoint.shared.state.lock().await;
        if state
            .active
            .as_ref()
            .is_some_and(|s| s.outbox.same_channel(&outbox_probe))
        {
            state.active = None;
        }
    }
    drop(outbox_probe);
    let _ = writer_task.await;
    endpoint.emit(PeerEvent::SessionClosed { nickname });
}

async fn drain_outbox(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(error = ?err, "failed to write peer frame");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
