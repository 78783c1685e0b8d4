//! Process-wide mode gating writes and watches.
//!
//! Three states: `Writable` (commits allowed, watches allowed, replication from peers
//! allowed), `ReplicationOnly` (no client writes, replicate incoming commits), `ReadOnly`
//! (no writes, no replication). A writable state always implies replicating.
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Writable,
    ReplicationOnly,
    ReadOnly,
}

impl Status {
    pub fn accepts_client_writes(&self) -> bool {
        matches!(self, Status::Writable)
    }

    pub fn replicates(&self) -> bool {
        matches!(self, Status::Writable | Status::ReplicationOnly)
    }
}

/// Scope of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    All,
}

/// Shared, observable process status. Built on `tokio::sync::watch` so any number of
/// readers (an HTTP layer, the watch manager) can cheaply poll or subscribe to changes
/// without a broadcast channel's per-receiver backlog.
#[derive(Clone)]
pub struct ServerStatus {
    tx: watch::Sender<Status>,
}

impl ServerStatus {
    pub fn new(initial: Status) -> Self {
        let (tx, _rx) = watch::channel(initial);
        ServerStatus { tx }
    }

    pub fn current(&self) -> Status {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Transitions to `next`. `scope` is informational in this in-process model — cluster
    /// propagation to peers is a collaborator's responsibility; this call always applies
    /// locally.
    pub fn transition(&self, next: Status, _scope: Scope) {
        self.tx.send_replace(next);
    }
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus::new(Status::Writable)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn writable_implies_replicating() {
        assert!(Status::Writable.replicates());
        assert!(Status::Writable.accepts_client_writes());
    }

    #[test]
    fn read_only_blocks_both() {
        assert!(!Status::ReadOnly.replicates());
        assert!(!Status::ReadOnly.accepts_client_writes());
    }

    #[test]
    fn transition_is_observable() {
        let status = ServerStatus::default();
        let mut rx = status.subscribe();
        status.transition(Status::ReadOnly, Scope::All);
        assert_eq!(*rx.borrow_and_update(), Status::ReadOnly);
        assert_eq!(status.current(), Status::ReadOnly);
    }
}
