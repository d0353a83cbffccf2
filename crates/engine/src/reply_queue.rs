//! Bounded per-client reply queue: single producer (the pipeline or an
//! upstream reader task), single consumer (the client's reply writer task),
//! coordinated by a mutex + condition in the same shape as the request
//! table's new-request signaling.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::sync::{Mutex, Notify};

use crate::MAX_REQUESTS;

/// An outbound reply buffer plus, for datagram clients, the destination
/// address captured from the originating request.
pub struct ReplyEntry {
    pub buf: Vec<u8>,
    pub addr: Option<SocketAddr>,
}

pub struct ReplyQueue {
    queue: Mutex<VecDeque<ReplyEntry>>,
    notify: Notify,
    capacity: usize,
}

impl ReplyQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a reply; drops it with a warning if the queue is at
    /// capacity (§4.7).
    pub async fn push(&self, entry: ReplyEntry) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            log::warn!("reply queue full ({} entries), dropping reply", self.capacity);
            return;
        }
        queue.push_back(entry);
        drop(queue);
        self.notify.notify_one();
    }

    /// Waits for and dequeues the next reply. Used by the single consumer
    /// (the client's writer task).
    pub async fn pop(&self) -> ReplyEntry {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(entry) = queue.pop_front() {
                    return entry;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Drains and discards all pending replies, logging each at debug
    /// (§9 Open Question c: drained rather than left to leak on teardown).
    pub async fn drain(&self) {
        let mut queue = self.queue.lock().await;
        let dropped = queue.len();
        if dropped > 0 {
            log::debug!("draining {dropped} queued replies on client teardown");
        }
        queue.clear();
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new(MAX_REQUESTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_pop_round_trips() {
        let queue = ReplyQueue::new(2);
        queue.push(ReplyEntry { buf: vec![1], addr: None }).await;
        let entry = queue.pop().await;
        assert_eq!(entry.buf, vec![1]);
    }

    #[tokio::test]
    async fn overflow_drops_the_newest_entry() {
        let queue = ReplyQueue::new(1);
        queue.push(ReplyEntry { buf: vec![1], addr: None }).await;
        queue.push(ReplyEntry { buf: vec![2], addr: None }).await;

        let entry = queue.pop().await;
        assert_eq!(entry.buf, vec![1]);
    }
}
