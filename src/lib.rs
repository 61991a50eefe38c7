//! Presence/broadcast chat over a binary rendezvous protocol.
//!
//! A central server tracks participants over persistent TCP connections,
//! relays broadcast text to everyone else, and brokers introductions for
//! direct peer sessions, which are negotiated with one UDP datagram and then
//! carried over their own TCP stream. Each module owns one concrete
//! responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`codec`] accumulates exact byte counts with deadlines and frames the
//!   bare peer-stream payloads.
//! - [`message`] defines the binary message model and its validation rules.
//! - [`registry`] is the server's participant table and fan-out path.
//! - [`server`] accepts connections and runs each session's state machine.
//! - [`client`] registers, consumes server pushes, and drives the
//!   interactive loop.
//! - [`peer`] handles invitation datagrams and direct peer streams.
//!
//! Integration tests use this crate directly to exercise the registry, the
//! session state machine, and the wire protocol.

pub mod cli;
pub mod client;
pub mod codec;
pub mod message;
pub mod peer;
pub mod registry;
pub mod server;
