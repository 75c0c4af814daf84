//! Unbounded FIFO between the pollers and the batch writer.
//!
//! Producers never block: `push` on an unbounded tokio channel is
//! synchronous, so blocking acquisition threads can enqueue directly.

use tokio::sync::mpsc;

use crate::persistence::record::PersistenceItem;

/// Create a connected sender/receiver pair.
pub fn persistence_queue() -> (PersistenceSender, PersistenceReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PersistenceSender { tx }, PersistenceReceiver { rx })
}

/// Producer half, cloned into every poller.
#[derive(Debug, Clone)]
pub struct PersistenceSender {
    tx: mpsc::UnboundedSender<PersistenceItem>,
}

impl PersistenceSender {
    /// Enqueue an item. Returns `false` once the writer is gone.
    pub fn push(&self, item: PersistenceItem) -> bool {
        self.tx.send(item).is_ok()
    }

    /// Whether the writer dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the batch writer.
#[derive(Debug)]
pub struct PersistenceReceiver {
    rx: mpsc::UnboundedReceiver<PersistenceItem>,
}

impl PersistenceReceiver {
    /// Items waiting to be flushed.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take at most the items queued at the moment of the call.
    ///
    /// Items pushed while draining stay for the next flush, so a busy
    /// producer cannot keep one flush running forever.
    pub fn drain_available(&mut self) -> Vec<PersistenceItem> {
        let available = self.rx.len();
        let mut items = Vec::with_capacity(available);
        for _ in 0..available {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::record::{RecordKind, SqlValue};

    fn item(value: i64) -> PersistenceItem {
        PersistenceItem::single(RecordKind::Fire, vec![SqlValue::Int(value)])
    }

    #[test]
    fn drain_is_bounded_by_current_length() {
        let (tx, mut rx) = persistence_queue();
        for i in 0..3 {
            assert!(tx.push(item(i)));
        }
        let drained = rx.drain_available();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], item(0));
        assert!(rx.is_empty());
        assert!(rx.drain_available().is_empty());
    }

    #[test]
    fn push_after_receiver_dropped_fails() {
        let (tx, rx) = persistence_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.push(item(1)));
    }
}
