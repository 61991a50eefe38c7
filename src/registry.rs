//! Server-side participant registry.
//!
//! The registry is the only state shared across connection workers. It keeps
//! participants in insertion order behind one mutex; registration,
//! unregistration, snapshots and fan-out are mutually exclusive, so no reader
//! ever observes a half-inserted or half-removed record.
//!
//! Records hold each connection's outbox rather than the socket itself. The
//! socket write half is owned by exactly one writer task per connection, and
//! outbox enqueues never block, so nothing blocking ever happens under the
//! registry lock.

use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::message::ParticipantInfo;

/// Sending half of a connection's outbox. Frames enqueued here are written
/// to the socket, in order, by that connection's writer task. The handle is
/// valid exactly as long as the owning connection is open; senders must
/// tolerate it being closed concurrently.
pub type ConnectionHandle = mpsc::UnboundedSender<Vec<u8>>;

/// One registered participant. Owned exclusively by the registry; created on
/// successful registration, removed on disconnect.
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub nickname: String,
    pub ip: Ipv4Addr,
    pub udp_port: u16,
    handle: ConnectionHandle,
}

impl ParticipantRecord {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            nickname: self.nickname.clone(),
            ip: self.ip,
            udp_port: self.udp_port,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The advertised `(ip, udp port)` pair is already registered.
    #[error("(ip, udp port) already registered")]
    AddressTaken,
    /// The nickname is already registered.
    #[error("nickname already registered")]
    NicknameTaken,
}

/// Nickname-keyed participant table, insertion-ordered.
#[derive(Debug, Default)]
pub struct Registry {
    participants: Mutex<Vec<ParticipantRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a participant, rejecting duplicate addresses before
    /// duplicate nicknames. No record is created on rejection.
    pub async fn register(
        &self,
        nickname: &str,
        ip: Ipv4Addr,
        udp_port: u16,
        handle: ConnectionHandle,
    ) -> Result<(), RegisterError> {
        self.register_with(nickname, ip, udp_port, handle, |_| {}).await
    }

    /// Registers a participant, invoking `before_insert` with the pre-insert
    /// snapshot while the lock is still held.
    ///
    /// The caller uses this to enqueue its REGISTER_ACK atomically with the
    /// insertion: once the record is visible, concurrent fan-outs may reach
    /// the new outbox, and nothing may get there ahead of the ACK. The
    /// callback must only do non-blocking work (outbox enqueues qualify).
    pub async fn register_with<F>(
        &self,
        nickname: &str,
        ip: Ipv4Addr,
        udp_port: u16,
        handle: ConnectionHandle,
        before_insert: F,
    ) -> Result<(), RegisterError>
    where
        F: FnOnce(&[ParticipantRecord]),
    {
        let mut participants = self.participants.lock().await;

        if participants.iter().any(|p| p.ip == ip && p.udp_port == udp_port) {
            return Err(RegisterError::AddressTaken);
        }
        if participants.iter().any(|p| p.nickname == nickname) {
            return Err(RegisterError::NicknameTaken);
        }

        before_insert(&participants);

        participants.push(ParticipantRecord {
            nickname: nickname.to_string(),
            ip,
            udp_port,
            handle,
        });
        Ok(())
    }

    /// Removes and returns the participant, making the nickname immediately
    /// available again. Unknown nicknames are a logged no-op, never fatal.
    pub async fn unregister(&self, nickname: &str) -> Option<ParticipantRecord> {
        let mut participants = self.participants.lock().await;
        match participants.iter().position(|p| p.nickname == nickname) {
            Some(index) => Some(participants.remove(index)),
            None => {
                warn!(nickname, "unregister for a nickname not in the registry");
                None
            }
        }
    }

    /// The currently registered participants in registration order. This
    /// exact order is what REGISTER_ACK enumerates.
    pub async fn snapshot(&self) -> Vec<ParticipantInfo> {
        let participants = self.participants.lock().await;
        participants.iter().map(ParticipantRecord::info).collect()
    }

    pub async fn lookup(&self, nickname: &str) -> Option<ParticipantRecord> {
        let participants = self.participants.lock().await;
        participants.iter().find(|p| p.nickname == nickname).cloned()
    }

    pub async fn len(&self) -> usize {
        self.participants.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Enqueues a frame to every registered participant except `exclude`,
    /// in registration order.
    ///
    /// Delivery is best-effort per recipient: a closed outbox (the recipient
    /// is tearing down concurrently) is logged and skipped, never escalated
    /// to the originator or the remaining recipients. The actual socket
    /// writes happen in each connection's writer task, so nothing here
    /// blocks while the lock is held.
    pub async fn fan_out(&self, frame: &[u8], exclude: Option<&str>) {
        let participants = self.participants.lock().await;
        for participant in participants.iter() {
            if exclude == Some(participant.nickname.as_str()) {
                continue;
            }
            if participant.handle.send(frame.to_vec()).is_err() {
                debug!(
                    nickname = %participant.nickname,
                    "skipping recipient whose connection is closing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        mpsc::unbounded_channel()
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(127, 0, 0, last)
    }

    #[tokio::test]
    async fn snapshot_preserves_registration_order() {
        let registry = Registry::new();
        for (index, nickname) in ["alice", "bob", "carol"].iter().enumerate() {
            let (tx, _rx) = handle();
            registry
                .register(nickname, ip(1), 30000 + index as u16, tx)
                .await
                .expect("register");
        }

        let names: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|p| p.nickname)
            .collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn duplicate_nickname_is_rejected_without_a_second_record() {
        let registry = Registry::new();
        let (tx, _rx) = handle();
        registry.register("alice", ip(1), 30000, tx).await.expect("first");

        let (tx, _rx) = handle();
        let result = registry.register("alice", ip(1), 30001, tx).await;
        assert_eq!(result, Err(RegisterError::NicknameTaken));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected_before_nickname() {
        let registry = Registry::new();
        let (tx, _rx) = handle();
        registry.register("alice", ip(1), 30000, tx).await.expect("first");

        // Same address and same nickname: the address check wins.
        let (tx, _rx) = handle();
        let result = registry.register("alice", ip(1), 30000, tx).await;
        assert_eq!(result, Err(RegisterError::AddressTaken));

        let (tx, _rx) = handle();
        let result = registry.register("bob", ip(1), 30000, tx).await;
        assert_eq!(result, Err(RegisterError::AddressTaken));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn nickname_is_available_again_after_unregister() {
        let registry = Registry::new();
        let (tx, _rx) = handle();
        registry.register("alice", ip(1), 30000, tx).await.expect("first");

        let removed = registry.unregister("alice").await.expect("removed");
        assert_eq!(removed.nickname, "alice");
        assert!(registry.is_empty().await);

        let (tx, _rx) = handle();
        registry
            .register("alice", ip(1), 30000, tx)
            .await
            .expect("re-register after removal");
    }

    #[tokio::test]
    async fn unregister_unknown_nickname_is_a_noop() {
        let registry = Registry::new();
        assert!(registry.unregister("ghost").await.is_none());
    }

    #[tokio::test]
    async fn lookup_finds_registered_participants() {
        let registry = Registry::new();
        let (tx, _rx) = handle();
        registry.register("alice", ip(1), 30000, tx).await.expect("register");

        let record = registry.lookup("alice").await.expect("found");
        assert_eq!(record.udp_port, 30000);
        assert!(registry.lookup("bob").await.is_none());
    }

    #[tokio::test]
    async fn register_with_sees_the_pre_insert_snapshot() {
        let registry = Registry::new();
        let (tx, _rx) = handle();
        registry.register("alice", ip(1), 30000, tx).await.expect("register");

        let (tx, _rx) = handle();
        let mut seen = None;
        registry
            .register_with("bob", ip(1), 30001, tx, |existing| {
                seen = Some(existing.iter().map(|p| p.nickname.clone()).collect::<Vec<_>>());
            })
            .await
            .expect("register");
        assert_eq!(seen.as_deref(), Some(&["alice".to_string()][..]));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn fan_out_excludes_the_originator_and_tolerates_closed_outboxes() {
        let registry = Registry::new();
        let (alice_tx, mut alice_rx) = handle();
        let (bob_tx, mut bob_rx) = handle();
        let (carol_tx, carol_rx) = handle();
        registry.register("alice", ip(1), 30000, alice_tx).await.expect("alice");
        registry.register("bob", ip(1), 30001, bob_tx).await.expect("bob");
        registry.register("carol", ip(1), 30002, carol_tx).await.expect("carol");

        // Carol's connection is tearing down; her outbox is gone.
        drop(carol_rx);

        registry.fan_out(b"frame", Some("alice")).await;

        assert_eq!(bob_rx.try_recv().expect("bob receives"), b"frame");
        assert!(alice_rx.try_recv().is_err());
    }
}
