//! Bounded drop-oldest outbound queue, one per connection.

use std::collections::VecDeque;
use std::sync::Arc;

use analytix_core::StreamEnvelope;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// What a connection task receives next.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Arc<StreamEnvelope>),
    /// Events evicted because the consumer fell behind.
    Dropped(u64),
    /// The hub closed the queue and everything before it was delivered.
    Close,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<StreamEnvelope>>,
    dropped: u64,
    closed: bool,
}

/// Single producer (the hub actor), single consumer (the connection task).
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                ..QueueState::default()
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues `envelope`, evicting the oldest entry when full. Returns how
    /// many entries were evicted, or `None` once the queue is closed.
    pub(crate) fn push(&self, envelope: Arc<StreamEnvelope>) -> Option<u64> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let mut evicted = 0;
            while state.items.len() >= self.capacity {
                state.items.pop_front();
                evicted += 1;
            }
            state.dropped += evicted;
            state.items.push_back(envelope);
            evicted
        };
        self.notify.notify_one();
        Some(evicted)
    }

    /// Marks the queue closed; queued events are still delivered first.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Waits for the next delivery. Cancel safe.
    pub(crate) async fn pop(&self) -> Delivery {
        loop {
            {
                let mut state = self.state.lock();
                if state.dropped > 0 {
                    return Delivery::Dropped(std::mem::take(&mut state.dropped));
                }
                if let Some(envelope) = state.items.pop_front() {
                    return Delivery::Event(envelope);
                }
                if state.closed {
                    return Delivery::Close;
                }
            }
            self.notify.notified().await;
        }
    }
}
