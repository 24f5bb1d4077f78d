//! Per-subscription handler queues.
//!
//! Each subscription pattern owns a bounded queue and a worker task. A
//! handler runs to completion before the next message of the same
//! subscription is dequeued (per-topic FIFO); distinct subscriptions proceed
//! in parallel. Handlers run in registration order.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A subscription handler. Receives the concrete topic and the decoded
/// payload.
pub type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// What to do with queued-but-unhandled messages on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish delivering everything already queued.
    Drain,
    /// Abandon pending messages.
    Drop,
}

const QUEUE_CAPACITY: usize = 64;

pub(crate) struct SubscriptionQueue {
    sender: Mutex<Option<mpsc::Sender<(Arc<str>, Arc<Value>)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    handlers: Arc<RwLock<Vec<(u64, Handler)>>>,
}

impl SubscriptionQueue {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<(Arc<str>, Arc<Value>)>(QUEUE_CAPACITY);
        let handlers: Arc<RwLock<Vec<(u64, Handler)>>> = Arc::new(RwLock::new(Vec::new()));
        let worker_handlers = handlers.clone();
        let worker = tokio::spawn(async move {
            while let Some((topic, payload)) = receiver.recv().await {
                // snapshot so handlers can (un)register without deadlocking
                let snapshot: Vec<Handler> = worker_handlers
                    .read()
                    .expect("handler list poisoned")
                    .iter()
                    .map(|(_, handler)| handler.clone())
                    .collect();
                for handler in snapshot {
                    handler(&topic, &payload);
                }
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            handlers,
        }
    }

    pub fn add_handler(&self, token: u64, handler: Handler) {
        self.handlers
            .write()
            .expect("handler list poisoned")
            .push((token, handler));
    }

    /// Removes the handler with `token`; returns how many handlers remain.
    pub fn remove_handler(&self, token: u64) -> usize {
        let mut handlers = self.handlers.write().expect("handler list poisoned");
        handlers.retain(|(id, _)| *id != token);
        handlers.len()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().expect("handler list poisoned").len()
    }

    /// Enqueues a message for this subscription's worker. Returns `false`
    /// after the queue stopped.
    pub async fn deliver(&self, topic: Arc<str>, payload: Arc<Value>) -> bool {
        let sender = self
            .sender
            .lock()
            .expect("sender slot poisoned")
            .clone();
        match sender {
            Some(sender) => sender.send((topic, payload)).await.is_ok(),
            None => false,
        }
    }

    pub async fn stop(&self, mode: StopMode) {
        self.sender.lock().expect("sender slot poisoned").take();
        let worker = self.worker.lock().expect("worker slot poisoned").take();
        if let Some(worker) = worker {
            match mode {
                StopMode::Drain => {
                    let _ = worker.await;
                }
                StopMode::Drop => {
                    worker.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    #[tokio::test]
    async fn handlers_run_in_registration_order() {
        let queue = SubscriptionQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3u64 {
            let order = order.clone();
            queue.add_handler(
                tag,
                Arc::new(move |_, _| order.lock().unwrap().push(tag)),
            );
        }
        assert!(queue.deliver(Arc::from("t"), Arc::new(Value::Null)).await);
        queue.stop(StopMode::Drain).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn messages_are_processed_in_order() {
        let queue = SubscriptionQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            queue.add_handler(
                0,
                Arc::new(move |_, payload| {
                    seen.lock().unwrap().push(payload.as_u64().unwrap());
                }),
            );
        }
        for n in 0..20u64 {
            assert!(
                queue
                    .deliver(Arc::from("t"), Arc::new(Value::from(n)))
                    .await
            );
        }
        queue.stop(StopMode::Drain).await;
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn deliver_after_stop_reports_closed() {
        let queue = SubscriptionQueue::new();
        queue.stop(StopMode::Drain).await;
        assert!(!queue.deliver(Arc::from("t"), Arc::new(Value::Null)).await);
    }

    #[tokio::test]
    async fn drop_mode_abandons_pending_messages() {
        let queue = SubscriptionQueue::new();
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let handled = handled.clone();
            queue.add_handler(
                0,
                Arc::new(move |_, _| {
                    handled.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }),
            );
        }
        for n in 0..10u64 {
            assert!(
                queue
                    .deliver(Arc::from("t"), Arc::new(Value::from(n)))
                    .await
            );
        }
        // let the worker pick up the first message, then stop without draining
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.stop(StopMode::Drop).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handled.load(Ordering::SeqCst) < 10);
    }
}
