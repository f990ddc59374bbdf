//! Per-order background tasks

use crate::order::OrderHash;

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// At most one watcher task per order. Spawning a new one aborts the old.
#[derive(Default)]
pub struct OrderTasks {
    handles: DashMap<OrderHash, (u64, JoinHandle<()>)>,
    next_id: AtomicU64,
}

impl OrderTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the task built by `make`, which receives the task id it must
    /// hand back to `finished`
    pub fn spawn<F, Fut>(&self, order_hash: OrderHash, make: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = make(id);
        // The task waits until its handle is registered
        let (start, started) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if started.await.is_ok() {
                task.await;
            }
        });
        let replaced = self.handles.insert(order_hash, (id, handle));
        let _ = start.send(());
        if let Some((old_id, old)) = replaced {
            debug!("Replacing task {} of order {}", old_id, order_hash);
            old.abort();
        }
    }

    /// Called by a task on exit; a newer task for the same order is kept
    pub fn finished(&self, order_hash: &OrderHash, id: u64) {
        self.handles.remove_if(order_hash, |_, (current, _)| *current == id);
    }

    /// Abort the order's task, if any
    pub fn cancel(&self, order_hash: &OrderHash) -> bool {
        match self.handles.remove(order_hash) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, order_hash: &OrderHash) -> bool {
        self.handles.contains_key(order_hash)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn abort_all(&self) {
        for entry in self.handles.iter() {
            entry.value().1.abort();
        }
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_replaces_previous_task() {
        let tasks = OrderTasks::new();
        let order_hash = OrderHash([1u8; 32]);

        tasks.spawn(order_hash, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tasks.spawn(order_hash, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        assert_eq!(tasks.len(), 1);

        assert!(tasks.cancel(&order_hash));
        assert!(tasks.is_empty());
        assert!(!tasks.cancel(&order_hash));
    }

    #[tokio::test]
    async fn test_finished_ignores_stale_id() {
        let tasks = Arc::new(OrderTasks::new());
        let order_hash = OrderHash([2u8; 32]);

        tasks.spawn(order_hash, |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let (tx, rx) = tokio::sync::oneshot::channel();
        tasks.spawn(order_hash, move |id| async move {
            let _ = tx.send(id);
        });
        let current = rx.await.unwrap();

        tasks.finished(&order_hash, current + 1);
        assert!(tasks.is_running(&order_hash));
        tasks.finished(&order_hash, current);
        assert!(!tasks.is_running(&order_hash));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_finishing_at_once_leaves_no_handle() {
        let tasks = Arc::new(OrderTasks::new());

        for byte in 0..32u8 {
            let order_hash = OrderHash([byte; 32]);
            let inner = tasks.clone();
            tasks.spawn(order_hash, move |id| async move {
                inner.finished(&order_hash, id);
            });
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !tasks.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(tasks.is_empty());
    }
}
