//! FIFO of pending lock-holding requests with duplicate suppression and
//! removal by identity. Each entry also carries the deadline by which it
//! must be granted; `expire` drains entries that timed out while still
//! queued so the caller can answer them negatively instead of leaving the
//! requester to wait forever behind a stuck holder.

use std::collections::VecDeque;
use std::time::Instant;
use transdb_common::{Message, MessageKind, NodeId, Txid};

/// Identifies a message independent of its payload, for dedup/removal.
type Identity = (NodeId, Txid, MessageKind);

fn identity(msg: &Message) -> Identity {
    (msg.src, msg.txid, msg.kind)
}

struct Entry {
    msg: Message,
    deadline: Instant,
}

#[derive(Default)]
pub struct RequestQueue {
    entries: VecDeque<Entry>,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue { entries: VecDeque::new() }
    }

    /// Appends `msg` unless a message with the same identity is already
    /// queued. `deadline` is when this request should be given up on if it
    /// is still sitting in the queue (not yet granted).
    pub fn enqueue(&mut self, msg: Message, deadline: Instant) {
        if self.contains(&msg) {
            return;
        }
        self.entries.push_back(Entry { msg, deadline });
    }

    pub fn contains(&self, msg: &Message) -> bool {
        let id = identity(msg);
        self.entries.iter().any(|e| identity(&e.msg) == id)
    }

    /// Removes the queued message matching `(src, txid, kind)`, if any.
    pub fn remove(&mut self, src: NodeId, txid: Txid, kind: MessageKind) {
        self.entries.retain(|e| (e.msg.src, e.msg.txid, e.msg.kind) != (src, txid, kind));
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        self.entries.pop_front().map(|e| e.msg)
    }

    /// Removes and returns every entry whose deadline has passed as of
    /// `now`, preserving the relative order of what remains queued.
    pub fn expire(&mut self, now: Instant) -> Vec<Message> {
        let mut expired = Vec::new();
        self.entries.retain(|e| {
            if e.deadline <= now {
                expired.push(e.msg.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(src: NodeId, txid: Txid, kind: MessageKind) -> Message {
        Message::new(0, src, 1, txid, kind, "k")
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn fifo_order() {
        let mut q = RequestQueue::new();
        q.enqueue(msg(1, 1, MessageKind::NodeLockRequest), far_deadline());
        q.enqueue(msg(2, 2, MessageKind::NodeLockRequest), far_deadline());
        assert_eq!(q.dequeue().unwrap().src, 1);
        assert_eq!(q.dequeue().unwrap().src, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn duplicate_identity_is_not_enqueued_twice() {
        let mut q = RequestQueue::new();
        q.enqueue(msg(1, 1, MessageKind::NodeLockRequest), far_deadline());
        q.enqueue(msg(1, 1, MessageKind::NodeLockRequest), far_deadline());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_by_identity() {
        let mut q = RequestQueue::new();
        q.enqueue(msg(1, 1, MessageKind::NodeLockRequest), far_deadline());
        q.enqueue(msg(2, 2, MessageKind::NodeLockRequest), far_deadline());
        q.remove(1, 1, MessageKind::NodeLockRequest);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().src, 2);
    }

    #[test]
    fn expire_drains_only_passed_deadlines_preserving_order() {
        let mut q = RequestQueue::new();
        let past = Instant::now() - Duration::from_millis(1);
        q.enqueue(msg(1, 1, MessageKind::NodeLockRequest), past);
        q.enqueue(msg(2, 2, MessageKind::NodeLockRequest), far_deadline());
        q.enqueue(msg(3, 3, MessageKind::NodeLockRequest), past);

        let expired = q.expire(Instant::now());
        assert_eq!(expired.iter().map(|m| m.src).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.dequeue().unwrap().src, 2);
    }
}
