//! Coalescing delivery queue.
//!
//! A FIFO with one consumer that merges repeated inserts of the same logical
//! item into the entry already pending for it, counting the merged inserts as
//! duplicates. Inserts never block; the queue has no capacity bound, so a
//! stalled consumer lets it grow with the number of distinct pending items.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Identity used to coalesce queued items.
pub trait Coalesce {
    type Key: Eq + Hash + Clone;

    /// Key under which this item merges with a pending one; `None` never
    /// merges.
    fn coalesce_key(&self) -> Option<Self::Key>;
}

/// Signals returned instead of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue closed")]
    Closed,

    #[error("wait cancelled")]
    Cancelled,
}

struct Slot<T> {
    item: T,
    dups: u32,
}

struct Inner<T: Coalesce> {
    slots: VecDeque<Slot<T>>,
    // Sequence number of each pending keyed item
    pending: HashMap<T::Key, u64>,
    // Sequence number of slots[0]
    head: u64,
    closed: bool,
}

impl<T: Coalesce> Inner<T> {
    fn pop(&mut self) -> Option<Slot<T>> {
        let slot = self.slots.pop_front()?;
        self.head += 1;
        if let Some(key) = slot.item.coalesce_key() {
            self.pending.remove(&key);
        }
        Some(slot)
    }
}

/// Unbounded, cancellable, coalescing FIFO.
pub struct CoalescingQueue<T: Coalesce> {
    inner: Mutex<Inner<T>>,
    ready: Notify,
}

impl<T: Coalesce> Default for CoalescingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Coalesce> CoalescingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                pending: HashMap::new(),
                head: 0,
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    /// Queue `item`, or merge it into the pending entry with the same key.
    ///
    /// A merged item replaces the pending one, keeping its position. Returns
    /// the duplicate count of the entry: 0 for a fresh entry.
    pub fn insert(&self, item: T) -> Result<u32, QueueError> {
        let dups = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed);
            }

            let key = item.coalesce_key();
            let pending = key.as_ref().and_then(|k| inner.pending.get(k).copied());
            match pending {
                Some(seq) => {
                    let index = (seq - inner.head) as usize;
                    let slot = &mut inner.slots[index];
                    slot.item = item;
                    slot.dups = slot.dups.saturating_add(1);
                    slot.dups
                }
                None => {
                    let seq = inner.head + inner.slots.len() as u64;
                    inner.slots.push_back(Slot { item, dups: 0 });
                    if let Some(key) = key {
                        inner.pending.insert(key, seq);
                    }
                    0
                }
            }
        };

        self.ready.notify_waiters();
        Ok(dups)
    }

    /// Wait for the next item and its duplicate count.
    ///
    /// Pending items are still handed out after [`close`](Self::close);
    /// `Closed` is returned once the queue is closed and empty, `Cancelled`
    /// when `cancel` fires first.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<(T, u32), QueueError> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent insert is not missed
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(slot) = inner.pop() {
                    return Ok((slot.item, slot.dups));
                }
                if inner.closed {
                    return Err(QueueError::Closed);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Refuse further inserts and wake the consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }
}
