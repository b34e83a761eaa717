//! Generic per-connection command engine (SPEC §4.H), shared in structure
//! between POP3 and ManageSieve (IMAP gets the same discipline for free
//! from `imap-flow`, which already enforces "parse in order, execute in
//! order, group-4 commands run concurrently").
//!
//! Grounded on the teacher's `aero-proto/src/imap/mod.rs` `NetLoop`/
//! `Instance` split — a background task owns protocol state and a FIFO of
//! in-flight work, the network task only shuttles bytes and responses.

use std::collections::VecDeque;

/// Concurrency class of a queued command (SPEC §4.H). `Exclusive` commands
/// wait for every prior command to finish; `ReadOnlyParallel` commands in
/// the same connection may run alongside one another once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Exclusive,
    ReadOnlyParallel,
}

/// One parsed-but-not-yet-finished command, queued in the order it was
/// parsed. `T` is the protocol's concrete command enum (POP3's `Pop3Command`,
/// ManageSieve's `SieveCommand`).
pub struct Queued<T> {
    pub command: T,
    pub group: Group,
}

/// FIFO of parsed commands awaiting execution, honoring SPEC §4.H's
/// ordering rule. Both protocols this engine serves execute one command to
/// completion before starting the next non-grouped one (neither protocol
/// defines a read-only-parallel group the way IMAP's SELECT/STATUS/EXAMINE
/// do), so `drain_ready` simply pops commands in FIFO order; the `Group`
/// field is retained so a future `ReadOnlyParallel` extension doesn't
/// require restructuring the queue.
#[derive(Default)]
pub struct CommandQueue<T> {
    queue: VecDeque<Queued<T>>,
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, command: T, group: Group) {
        self.queue.push_back(Queued { command, group });
    }

    pub fn pop(&mut self) -> Option<Queued<T>> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Connection close: discard remaining queued commands without
    /// executing them (SPEC §4.H).
    pub fn drain_unexecuted(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_preserves_parse_order() {
        let mut q: CommandQueue<&str> = CommandQueue::new();
        q.push("STAT", Group::Exclusive);
        q.push("LIST", Group::Exclusive);
        assert_eq!(q.pop().unwrap().command, "STAT");
        assert_eq!(q.pop().unwrap().command, "LIST");
        assert!(q.pop().is_none());
    }

    #[test]
    fn drain_unexecuted_discards_without_popping() {
        let mut q: CommandQueue<&str> = CommandQueue::new();
        q.push("RETR", Group::Exclusive);
        q.drain_unexecuted();
        assert!(q.is_empty());
    }
}
