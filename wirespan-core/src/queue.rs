//! Bounded queue of completed exchanges between the parsers and the emitter.
//!
//! Producers never wait: when the queue is full the oldest exchange is
//! dropped and counted, so a slow emitter cannot stall capture.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::events::HttpExchange;
use crate::stats::Stats;

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<HttpExchange>,
    closed: bool,
}

#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    stats: Arc<Stats>,
}

impl EventQueue {
    pub fn new(capacity: usize, stats: Arc<Stats>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            stats,
        }
    }

    /// Append an exchange, evicting the oldest one when full.
    pub fn push(&self, exchange: HttpExchange) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                Stats::incr(&self.stats.events_dropped);
                debug!(id = %exchange.display_id(), "event queue closed, exchange dropped");
                return;
            }
            if inner.items.len() >= self.capacity {
                if let Some(evicted) = inner.items.pop_front() {
                    Stats::incr(&self.stats.events_dropped);
                    debug!(id = %evicted.display_id(), "event queue full, oldest exchange dropped");
                }
            }
            inner.items.push_back(exchange);
        }
        self.notify.notify_one();
    }

    /// Next exchange in insertion order. `None` once the queue is closed
    /// and empty.
    pub async fn pop(&self) -> Option<HttpExchange> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(exchange) = inner.items.pop_front() {
                    return Some(exchange);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake the consumer. Queued exchanges can
    /// still be popped.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
