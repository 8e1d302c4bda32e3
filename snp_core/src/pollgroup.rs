//! Poll groups: a FIFO fan-in of messages received across every connection
//! currently assigned to the group.

use std::collections::{HashSet, VecDeque};

use crate::connection::ConnectionHandle;
use crate::snp::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollGroupHandle(pub u32);

/// A batched receive queue shared by every connection assigned to it.
/// Connections push messages in arrival order; `receive` drains up to
/// `max_messages` in that same order regardless of which connection
/// produced them.
#[derive(Default)]
pub struct PollGroup {
    members: HashSet<ConnectionHandle>,
    queue: VecDeque<(ConnectionHandle, Message)>,
}

impl PollGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, handle: ConnectionHandle) {
        self.members.insert(handle);
    }

    pub fn remove_member(&mut self, handle: ConnectionHandle) {
        self.members.remove(&handle);
        self.queue.retain(|(h, _)| *h != handle);
    }

    pub fn is_member(&self, handle: ConnectionHandle) -> bool {
        self.members.contains(&handle)
    }

    pub fn push(&mut self, handle: ConnectionHandle, msg: Message) {
        if self.members.contains(&handle) {
            self.queue.push_back((handle, msg));
        }
    }

    pub fn receive(&mut self, max_messages: usize) -> Vec<(ConnectionHandle, Message)> {
        let n = max_messages.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UsecTime;

    fn msg(n: u64) -> Message {
        Message { data: vec![n as u8], message_number: n, reliable: false, recv_timestamp: UsecTime(0) }
    }

    #[test]
    fn poll_001_fifo_across_members() {
        let mut g = PollGroup::new();
        let a = ConnectionHandle(1);
        let b = ConnectionHandle(2);
        g.add_member(a);
        g.add_member(b);
        g.push(a, msg(1));
        g.push(b, msg(2));
        g.push(a, msg(3));
        let out = g.receive(10);
        assert_eq!(out.iter().map(|(h, m)| (*h, m.message_number)).collect::<Vec<_>>(), vec![(a, 1), (b, 2), (a, 3)]);
    }

    #[test]
    fn poll_002_receive_respects_max() {
        let mut g = PollGroup::new();
        let a = ConnectionHandle(1);
        g.add_member(a);
        for i in 0..5 {
            g.push(a, msg(i));
        }
        let first = g.receive(2);
        assert_eq!(first.len(), 2);
        assert_eq!(g.pending_count(), 3);
    }

    #[test]
    fn poll_003_non_member_push_is_dropped() {
        let mut g = PollGroup::new();
        let a = ConnectionHandle(1);
        g.push(a, msg(1));
        assert_eq!(g.pending_count(), 0);
    }

    #[test]
    fn poll_004_remove_member_drops_queued_messages() {
        let mut g = PollGroup::new();
        let a = ConnectionHandle(1);
        g.add_member(a);
        g.push(a, msg(1));
        g.remove_member(a);
        assert_eq!(g.pending_count(), 0);
        assert!(!g.is_member(a));
    }
}
