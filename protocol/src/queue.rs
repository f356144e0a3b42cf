use tokio::sync::mpsc::{self, error::TrySendError};

/// Offer `item` to a bounded queue without waiting.
///
/// A full queue drops the item with an error log so the producing loop
/// keeps running. Returns whether the item was queued.
pub fn enqueue<T>(tx: &mpsc::Sender<T>, item: T, queue: &'static str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::error!(queue, capacity = tx.max_capacity(), "Queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!(queue, "Queue closed, dropping message");
            false
        }
    }
}

/// Number of items currently waiting in the queue behind `tx`
pub fn depth<T>(tx: &mpsc::Sender<T>) -> usize {
    tx.max_capacity() - tx.capacity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops() {
        let (tx, mut rx) = mpsc::channel::<u32>(2);
        assert!(enqueue(&tx, 1, "test"));
        assert!(enqueue(&tx, 2, "test"));
        assert_eq!(depth(&tx), 2);
        assert!(!enqueue(&tx, 3, "test"));

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(depth(&tx), 1);
        assert!(enqueue(&tx, 4, "test"));
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_drops() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        assert!(!enqueue(&tx, 1, "test"));
    }
}
