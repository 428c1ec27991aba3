use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Bounded single-consumer queue that evicts the oldest item when full.
/// Stale audio is useless in a live conversation, so freshness wins.
pub struct DropOldest<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

impl<T> DropOldest<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(capacity), dropped: 0, closed: false }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Returns false if the queue is closed (the item is discarded).
    pub fn push(&self, item: T) -> bool {
        {
            let mut g = self.inner.lock();
            if g.closed { return false; }
            if g.items.len() == self.capacity {
                g.items.pop_front();
                g.dropped += 1;
            }
            g.items.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<T> { self.inner.lock().items.pop_front() }

    /// Waits for the next item; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut g = self.inner.lock();
                if let Some(item) = g.items.pop_front() { return Some(item); }
                if g.closed { return None; }
            }
            // notify_one keeps a permit, so a push between unlock and here is not lost
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Discards everything queued and returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut g = self.inner.lock();
        let n = g.items.len();
        g.items.clear();
        n
    }

    pub fn len(&self) -> usize { self.inner.lock().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn dropped(&self) -> u64 { self.inner.lock().dropped }
    pub fn capacity(&self) -> usize { self.capacity }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn overflow_keeps_newest_in_order() {
        let q = DropOldest::new(4);
        for i in 0..10 { q.push(i); }
        assert_eq!(q.dropped(), 6);
        let drained: Vec<_> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(drained, vec![6, 7, 8, 9]);
    }

    #[test]
    fn clear_empties_but_keeps_accepting() {
        let q = DropOldest::new(4);
        for i in 0..3 { q.push(i); }
        assert_eq!(q.clear(), 3);
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 0);
        assert!(q.push(9));
        assert_eq!(q.try_pop(), Some(9));
    }

    #[test]
    fn closed_queue_rejects_pushes() {
        let q = DropOldest::new(2);
        q.close();
        assert!(!q.push(1));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_ends_after_close() {
        let q = Arc::new(DropOldest::new(8));
        let q2 = q.clone();
        let consumer = tokio::spawn(async move {
            let mut got = vec![];
            while let Some(v) = q2.pop().await { got.push(v); }
            got
        });
        for i in 0..3 { q.push(i); tokio::task::yield_now().await; }
        q.close();
        assert_eq!(consumer.await.unwrap(), vec![0, 1, 2]);
    }
}
