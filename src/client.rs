//! Client side of the rendezvous protocol.
//!
//! Registration is a blocking handshake: REGISTER goes out once and nothing
//! else happens until REGISTER_ACK (or an ERROR, which is fatal) comes back.
//! After that, a dedicated reader task consumes server pushes and keeps the
//! local roster current while the interactive loop runs in the main task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cli::ClientArgs;
use crate::codec::ReadError;
use crate::message::{
    read_message, write_message, DecodeError, ErrorCode, Message, ParticipantInfo,
    MAX_NICKNAME_BYTES, MAX_TEXT_BYTES,
};
use crate::peer::{PeerEndpoint, PeerEvent};

/// How long registration may wait for the server's answer.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline per pushed-message read. Expiry just re-arms the read; the
/// server is allowed to be silent indefinitely.
const PUSH_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The server refused the registration. The code must be surfaced to the
/// user; the client does not proceed past it.
#[derive(Debug, Error)]
#[error("registration refused by server: {code}")]
pub struct RegistrationRefused {
    pub code: ErrorCode,
}

/// A registered connection plus the roster the server acknowledged.
pub struct Registration {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
    pub roster: Vec<ParticipantInfo>,
}

/// Connects, registers, and blocks for the server's verdict.
pub async fn register_at(server: SocketAddr, nickname: &str, udp_port: u16) -> Result<Registration> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {server}");

    let local_ip = match stream.local_addr()? {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => bail!("the rendezvous protocol carries IPv4 addresses only"),
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(
        &mut writer,
        &Message::Register {
            ip: local_ip,
            udp_port,
            nickname: nickname.to_string(),
        },
    )
    .await?;

    let deadline = Instant::now() + REGISTER_TIMEOUT;
    match read_message(&mut reader, deadline).await? {
        Some(Message::RegisterAck { participants }) => Ok(Registration {
            reader,
            writer,
            roster: participants,
        }),
        Some(Message::Error { code }) => Err(RegistrationRefused { code }.into()),
        Some(other) => bail!("unexpected reply to registration: {other:?}"),
        None => bail!("server closed the connection during registration"),
    }
}

/// The local view of who is registered, shared between the push reader and
/// the interactive loop.
#[derive(Debug, Default)]
pub struct Roster {
    participants: Vec<ParticipantInfo>,
}

impl Roster {
    pub fn new(participants: Vec<ParticipantInfo>) -> Self {
        Self { participants }
    }

    /// Applies a join notification. A repeated join for a known nickname
    /// refreshes the reachability info instead of duplicating the entry.
    pub fn apply_joined(&mut self, participant: ParticipantInfo) {
        match self
            .participants
            .iter_mut()
            .find(|p| p.nickname == participant.nickname)
        {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
    }

    /// Applies a leave notification. Unknown nicknames are a no-op.
    pub fn apply_left(&mut self, nickname: &str) -> bool {
        match self.participants.iter().position(|p| p.nickname == nickname) {
            Some(index) => {
                self.participants.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, nickname: &str) -> Option<&ParticipantInfo> {
        self.participants.iter().find(|p| p.nickname == nickname)
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }
}

/// One parsed line of interactive input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Broadcast(String),
    List,
    Peer(String),
    PeerMessage(String),
    Quit,
    Help,
}

/// Bare text broadcasts; slash commands do everything else. Returns `None`
/// for blank lines.
fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Command::Broadcast(line.to_string()));
    }

    let (word, rest) = match line.split_once(' ') {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    match word {
        "/list" => Some(Command::List),
        "/peer" if !rest.is_empty() => Some(Command::Peer(rest.to_string())),
        "/msg" if !rest.is_empty() => Some(Command::PeerMessage(rest.to_string())),
        "/quit" => Some(Command::Quit),
        _ => Some(Command::Help),
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    if args.nickname.is_empty() {
        bail!("nickname must not be empty");
    }
    if args.nickname.len() > MAX_NICKNAME_BYTES {
        bail!("nickname must be at most {MAX_NICKNAME_BYTES} bytes");
    }

    let (peer, peer_events) = PeerEndpoint::bind(args.udp_port, args.peer_port, &args.nickname)
        .await
        .context("failed to bind peer endpoints")?;
    info!(
        udp_port = peer.udp_port(),
        tcp_port = peer.tcp_port(),
        "peer endpoints ready"
    );

    let registration = register_at(args.server, &args.nickname, peer.udp_port()).await?;
    write_stdout(&format!("*** connected as {}", args.nickname)).await?;
    if !registration.roster.is_empty() {
        let names: Vec<&str> = registration
            .roster
            .iter()
            .map(|p| p.nickname.as_str())
            .collect();
        write_stdout(&format!("*** currently online: {}", names.join(", "))).await?;
    }

    let roster = Arc::new(Mutex::new(Roster::new(registration.roster)));
    let mut writer = registration.writer;

    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(run_push_loop(registration.reader, Arc::clone(&roster), done_tx));
    tokio::spawn(render_peer_events(peer_events));

    run_interactive(&mut writer, &roster, &peer, done_rx).await?;

    // Best effort: the server may already be gone.
    if let Err(err) = write_message(&mut writer, &Message::Disconnect).await {
        warn!(error = ?err, "failed to send disconnect");
    }
    if let Err(err) = writer.shutdown().await {
        warn!(error = ?err, "failed to shut down connection cleanly");
    }

    Ok(())
}

/// Consumes server pushes until the connection ends, keeping the roster
/// consistent under its lock. Signals the interactive loop on exit.
async fn run_push_loop(
    mut reader: BufReader<OwnedReadHalf>,
    roster: Arc<Mutex<Roster>>,
    done: oneshot::Sender<()>,
) {
    loop {
        let deadline = Instant::now() + PUSH_READ_TIMEOUT;
        match read_message(&mut reader, deadline).await {
            Ok(Some(message)) => {
                if let Err(err) = render_push(message, &roster).await {
                    warn!(error = ?err, "failed to render server message");
                    break;
                }
            }
            Ok(None) => {
                let _ = write_stdout("*** server closed the connection").await;
                break;
            }
            Err(DecodeError::Read(ReadError::Timeout)) => continue,
            Err(err) => {
                // The stream is unusable after a failed decode; the roster
                // received so far stays as-is.
                warn!(error = ?err, "lost connection to server");
                let _ = write_stdout("*** lost connection to server").await;
                break;
            }
        }
    }
    let _ = done.send(());
}

async fn render_push(message: Message, roster: &Arc<Mutex<Roster>>) -> io::Result<()> {
    match message {
        Message::ClientJoined(participant) => {
            let nickname = participant.nickname.clone();
            roster.lock().await.apply_joined(participant);
            write_stdout(&format!("*** {nickname} joined the chat")).await
        }
        Message::ClientLeft { nickname } => {
            roster.lock().await.apply_left(&nickname);
            write_stdout(&format!("*** {nickname} left the chat")).await
        }
        Message::Broadcast { text } => write_stdout(&format!("[broadcast] {text}")).await,
        Message::Error { code } => write_stderr(&format!("!!! server error: {code}")).await,
        other => {
            warn!(?other, "ignoring unexpected server push");
            Ok(())
        }
    }
}

async fn run_interactive(
    writer: &mut OwnedWriteHalf,
    roster: &Arc<Mutex<Roster>>,
    peer: &PeerEndpoint,
    mut done: oneshot::Receiver<()>,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            _ = &mut done => break,
            bytes = stdin.read_line(&mut input) => {
                if bytes? == 0 {
                    break;
                }
                match parse_command(&input) {
                    None => {}
                    Some(Command::Quit) => {
                        write_stdout("*** leaving chat").await?;
                        break;
                    }
                    Some(command) => handle_command(command, writer, roster, peer).await?,
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(err) = ctrl_c {
                    warn!(error = ?err, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    Ok(())
}

async fn handle_command(
    command: Command,
    writer: &mut OwnedWriteHalf,
    roster: &Arc<Mutex<Roster>>,
    peer: &PeerEndpoint,
) -> Result<()> {
    match command {
        Command::Broadcast(text) => {
            if text.len() > MAX_TEXT_BYTES {
                write_stderr(&format!("!!! message is longer than {MAX_TEXT_BYTES} bytes")).await?;
                return Ok(());
            }
            write_message(writer, &Message::Broadcast { text }).await?;
        }
        Command::List => {
            let roster = roster.lock().await;
            if roster.participants().is_empty() {
                write_stdout("*** nobody else is online").await?;
            } else {
                write_stdout("*** currently online:").await?;
                for participant in roster.participants() {
                    write_stdout(&format!(
                        "  - {} [{}:{}]",
                        participant.nickname, participant.ip, participant.udp_port
                    ))
                    .await?;
                }
            }
        }
        Command::Peer(nickname) => {
            let target = roster.lock().await.lookup(&nickname).cloned();
            match target {
                Some(target) => {
                    peer.invite(&target).await?;
                    write_stdout(&format!("*** peer invitation sent to {nickname}")).await?;
                }
                None => write_stderr(&format!("!!! unknown participant: {nickname}")).await?,
            }
        }
        Command::PeerMessage(text) => {
            if let Err(err) = peer.send(&text).await {
                write_stderr(&format!("!!! {err}")).await?;
            }
        }
        Command::Help => {
            write_stdout("commands: <text> broadcasts, /list, /peer <name>, /msg <text>, /quit").await?;
        }
        Command::Quit => {}
    }
    Ok(())
}

async fn render_peer_events(mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let rendered = match event {
            PeerEvent::InvitationReceived { nickname, addr } => {
                format!("*** peer invitation from {nickname} ({addr})")
            }
            PeerEvent::SessionOpened { nickname } => {
                format!("*** peer session with {nickname} opened")
            }
            PeerEvent::MessageReceived { nickname, text } => format!("[{nickname}] {text}"),
            PeerEvent::SessionClosed { nickname } => {
                format!("*** peer session with {nickname} closed")
            }
        };
        if write_stdout(&rendered).await.is_err() {
            break;
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
