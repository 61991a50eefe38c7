//! Binary message model for the rendezvous protocol.
//!
//! Nine message kinds share one type-byte namespace (there is no type 3; the
//! gap is part of the inherited numbering and stays reserved). All multi-byte
//! integers are big-endian. Variable-length text is length-prefixed (one
//! byte for nicknames, two bytes for free text) with two deliberate
//! exceptions kept for wire compatibility:
//!
//! - [`Message::PeerRequest`] is a datagram whose trailing nickname has no
//!   length prefix; it is simply the rest of the datagram.
//! - [`Message::PeerMessage`] frames on an established peer stream carry no
//!   type byte at all; every frame is a bare length-prefixed payload
//!   (see [`crate::codec::read_frame`]).
//!
//! Decoded messages are immutable and fully validated: every text field is
//! checked UTF-8 before a [`Message`] exists.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::codec::{self, ReadError};

const ID_ERROR: u8 = 0;
const ID_REGISTER: u8 = 1;
const ID_REGISTER_ACK: u8 = 2;
const ID_CLIENT_JOINED: u8 = 4;
const ID_CLIENT_LEFT: u8 = 5;
const ID_BROADCAST: u8 = 6;
const ID_DISCONNECT: u8 = 7;
const ID_PEER_REQUEST: u8 = 8;

/// Nickname length must fit the one-byte length field.
pub const MAX_NICKNAME_BYTES: usize = u8::MAX as usize;

/// Broadcast and peer-message text must fit the two-byte length field.
pub const MAX_TEXT_BYTES: usize = u16::MAX as usize;

/// One participant as carried in REGISTER_ACK and CLIENT_JOINED payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub nickname: String,
    pub ip: Ipv4Addr,
    pub udp_port: u16,
}

/// Protocol error codes carried by [`Message::Error`].
///
/// Codes outside the defined range decode as [`ErrorCode::Other`] so a newer
/// peer cannot break an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownMessageId,
    AddressTaken,
    NicknameTaken,
    EmptyText,
    InvalidUtf8,
    InvalidClientList,
    Other(u8),
}

impl ErrorCode {
    pub fn to_wire(self) -> u8 {
        match self {
            ErrorCode::UnknownMessageId => 0,
            ErrorCode::AddressTaken => 1,
            ErrorCode::NicknameTaken => 2,
            ErrorCode::EmptyText => 3,
            ErrorCode::InvalidUtf8 => 4,
            ErrorCode::InvalidClientList => 5,
            ErrorCode::Other(code) => code,
        }
    }

    pub fn from_wire(code: u8) -> Self {
        match code {
            0 => ErrorCode::UnknownMessageId,
            1 => ErrorCode::AddressTaken,
            2 => ErrorCode::NicknameTaken,
            3 => ErrorCode::EmptyText,
            4 => ErrorCode::InvalidUtf8,
            5 => ErrorCode::InvalidClientList,
            other => ErrorCode::Other(other),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::UnknownMessageId => "unknown message id",
            ErrorCode::AddressTaken => "(ip, udp port) already registered",
            ErrorCode::NicknameTaken => "nickname already registered",
            ErrorCode::EmptyText => "empty nickname or text",
            ErrorCode::InvalidUtf8 => "text is not valid UTF-8",
            ErrorCode::InvalidClientList => "invalid client list",
            ErrorCode::Other(_) => "unrecognized error code",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {} ({})", self.to_wire(), self.describe())
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Type 0, server to client.
    Error { code: ErrorCode },
    /// Type 1, client to server: advertise reachability and claim a nickname.
    Register {
        ip: Ipv4Addr,
        udp_port: u16,
        nickname: String,
    },
    /// Type 2, server to client: the participants registered before the
    /// newcomer, in registration order.
    RegisterAck { participants: Vec<ParticipantInfo> },
    /// Type 4, server to the other participants.
    ClientJoined(ParticipantInfo),
    /// Type 5, server to the remaining participants.
    ClientLeft { nickname: String },
    /// Type 6, either direction. Relayed byte-identical by the server.
    Broadcast { text: String },
    /// Type 7, client to server. No payload.
    Disconnect,
    /// Type 8, client-to-client datagram announcing a peer TCP port.
    PeerRequest { tcp_port: u16, nickname: String },
    /// Bare frame on an established peer stream (nominally type 9, but the
    /// type byte is never sent once the stream exists).
    PeerMessage { text: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("text is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid client list: {0}")]
    InvalidClientList(&'static str),
    #[error("datagram too short for a peer request")]
    TruncatedDatagram,
    #[error(transparent)]
    Read(#[from] ReadError),
}

impl DecodeError {
    /// The wire error code to reply with, where the taxonomy defines one.
    /// Transport failures have no reply; the connection is torn down instead.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            DecodeError::UnknownMessageId(_) => Some(ErrorCode::UnknownMessageId),
            DecodeError::InvalidUtf8 => Some(ErrorCode::InvalidUtf8),
            DecodeError::InvalidClientList(_) => Some(ErrorCode::InvalidClientList),
            DecodeError::TruncatedDatagram | DecodeError::Read(_) => None,
        }
    }
}

impl Message {
    /// Encodes this message to its exact wire bytes.
    ///
    /// Nicknames must be at most [`MAX_NICKNAME_BYTES`] and texts at most
    /// [`MAX_TEXT_BYTES`]; both bounds are enforced where values enter the
    /// system (registration validation and the interactive input paths).
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Error { code } => vec![ID_ERROR, code.to_wire()],
            Message::Register { ip, udp_port, nickname } => {
                debug_assert!(nickname.len() <= MAX_NICKNAME_BYTES);
                let mut buf = Vec::with_capacity(8 + nickname.len());
                buf.push(ID_REGISTER);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&udp_port.to_be_bytes());
                buf.push(nickname.len() as u8);
                buf.extend_from_slice(nickname.as_bytes());
                buf
            }
            Message::RegisterAck { participants } => {
                let mut buf = vec![ID_REGISTER_ACK];
                buf.extend_from_slice(&(participants.len() as u32).to_be_bytes());
                for participant in participants {
                    put_participant(&mut buf, participant);
                }
                buf
            }
            Message::ClientJoined(participant) => {
                debug_assert!(participant.nickname.len() <= MAX_NICKNAME_BYTES);
                let mut buf = Vec::with_capacity(8 + participant.nickname.len());
                buf.push(ID_CLIENT_JOINED);
                // The IP travels as a u32 here, unlike the raw octets in
                // REGISTER. Same bytes on the wire, kept distinct on purpose.
                buf.extend_from_slice(&u32::from(participant.ip).to_be_bytes());
                buf.extend_from_slice(&participant.udp_port.to_be_bytes());
                buf.push(participant.nickname.len() as u8);
                buf.extend_from_slice(participant.nickname.as_bytes());
                buf
            }
            Message::ClientLeft { nickname } => {
                debug_assert!(nickname.len() <= MAX_NICKNAME_BYTES);
                let mut buf = Vec::with_capacity(2 + nickname.len());
                buf.push(ID_CLIENT_LEFT);
                buf.push(nickname.len() as u8);
                buf.extend_from_slice(nickname.as_bytes());
                buf
            }
            Message::Broadcast { text } => {
                debug_assert!(text.len() <= MAX_TEXT_BYTES);
                let mut buf = Vec::with_capacity(3 + text.len());
                buf.push(ID_BROADCAST);
                buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                buf
            }
            Message::Disconnect => vec![ID_DISCONNECT],
            Message::PeerRequest { tcp_port, nickname } => {
                debug_assert!(nickname.len() <= MAX_NICKNAME_BYTES);
                // The trailing nickname has no length prefix: it is the rest
                // of the datagram.
                let mut buf = Vec::with_capacity(3 + nickname.len());
                buf.push(ID_PEER_REQUEST);
                buf.extend_from_slice(&tcp_port.to_be_bytes());
                buf.extend_from_slice(nickname.as_bytes());
                buf
            }
            Message::PeerMessage { text } => {
                debug_assert!(text.len() <= MAX_TEXT_BYTES);
                // No type byte: peer-stream frames are bare.
                let mut buf = Vec::with_capacity(2 + text.len());
                buf.extend_from_slice(&(text.len() as u16).to_be_bytes());
                buf.extend_from_slice(text.as_bytes());
                buf
            }
        }
    }

    /// Decodes a datagram. Only [`Message::PeerRequest`] travels this way.
    pub fn decode_datagram(datagram: &[u8]) -> Result<Message, DecodeError> {
        let (&id, rest) = datagram.split_first().ok_or(DecodeError::TruncatedDatagram)?;
        if id != ID_PEER_REQUEST {
            return Err(DecodeError::UnknownMessageId(id));
        }
        if rest.len() < 2 {
            return Err(DecodeError::TruncatedDatagram);
        }
        let tcp_port = u16::from_be_bytes([rest[0], rest[1]]);
        let nickname = std::str::from_utf8(&rest[2..])
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        Ok(Message::PeerRequest { tcp_port, nickname })
    }

    /// Decodes the payload of one bare peer-stream frame.
    pub fn decode_peer_frame(payload: &[u8]) -> Result<Message, DecodeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        Ok(Message::PeerMessage { text })
    }
}

/// Reads one framed message from a stream.
///
/// Returns `Ok(None)` when the peer closes the connection cleanly before a
/// type byte; a close mid-message is a transport error. The deadline bounds
/// the whole message, header and payload alike.
///
/// Frames with `nameLen = 0` decode successfully; refusing empty nicknames is
/// registration-level validation, not framing.
pub async fn read_message<R>(reader: &mut R, deadline: Instant) -> Result<Option<Message>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let id = match codec::read_u8(reader, deadline).await {
        Ok(id) => id,
        Err(ReadError::Closed) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let message = match id {
        ID_ERROR => {
            let code = codec::read_u8(reader, deadline).await?;
            Message::Error {
                code: ErrorCode::from_wire(code),
            }
        }
        ID_REGISTER => {
            let mut octets = [0u8; 4];
            codec::read_exact(reader, &mut octets, deadline).await?;
            let udp_port = codec::read_u16(reader, deadline).await?;
            let nickname = read_prefixed_name(reader, deadline).await?;
            Message::Register {
                ip: Ipv4Addr::from(octets),
                udp_port,
                nickname,
            }
        }
        ID_REGISTER_ACK => {
            let count = codec::read_u32(reader, deadline).await?;
            let mut participants = Vec::new();
            for _ in 0..count {
                participants.push(read_participant(reader, deadline).await.map_err(|err| {
                    match err {
                        DecodeError::InvalidUtf8 => {
                            DecodeError::InvalidClientList("participant name is not valid UTF-8")
                        }
                        other => other,
                    }
                })?);
            }
            Message::RegisterAck { participants }
        }
        ID_CLIENT_JOINED => {
            let ip = Ipv4Addr::from(codec::read_u32(reader, deadline).await?);
            let udp_port = codec::read_u16(reader, deadline).await?;
            let nickname = read_prefixed_name(reader, deadline).await?;
            Message::ClientJoined(ParticipantInfo { nickname, ip, udp_port })
        }
        ID_CLIENT_LEFT => {
            let nickname = read_prefixed_name(reader, deadline).await?;
            Message::ClientLeft { nickname }
        }
        ID_BROADCAST => {
            let len = codec::read_u16(reader, deadline).await? as usize;
            let mut text = vec![0u8; len];
            codec::read_exact(reader, &mut text, deadline).await?;
            let text = String::from_utf8(text).map_err(|_| DecodeError::InvalidUtf8)?;
            Message::Broadcast { text }
        }
        ID_DISCONNECT => Message::Disconnect,
        // Types 8 and 9 never travel framed on the rendezvous stream: 8 is a
        // datagram and 9 is bare on peer streams.
        other => return Err(DecodeError::UnknownMessageId(other)),
    };

    Ok(Some(message))
}

/// Encodes and writes one message, flushing so peers get timely updates.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await
}

fn put_participant(buf: &mut Vec<u8>, participant: &ParticipantInfo) {
    debug_assert!(participant.nickname.len() <= MAX_NICKNAME_BYTES);
    buf.extend_from_slice(&participant.ip.octets());
    buf.extend_from_slice(&participant.udp_port.to_be_bytes());
    buf.push(participant.nickname.len() as u8);
    buf.extend_from_slice(participant.nickname.as_bytes());
}

async fn read_participant<R>(reader: &mut R, deadline: Instant) -> Result<ParticipantInfo, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut octets = [0u8; 4];
    codec::read_exact(reader, &mut octets, deadline).await?;
    let udp_port = codec::read_u16(reader, deadline).await?;
    let nickname = read_prefixed_name(reader, deadline).await?;
    Ok(ParticipantInfo {
        nickname,
        ip: Ipv4Addr::from(octets),
        udp_port,
    })
}

async fn read_prefixed_name<R>(reader: &mut R, deadline: Instant) -> Result<String, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let len = codec::read_u8(reader, deadline).await? as usize;
    let mut name = vec![0u8; len];
    codec::read_exact(reader, &mut name, deadline).await?;
    String::from_utf8(name).map_err(|_| DecodeError::InvalidUtf8)
}
