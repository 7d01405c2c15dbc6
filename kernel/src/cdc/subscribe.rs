//! Live fan-out of committed change records. Each subscriber owns a
//! bounded queue drained by its own task, so a slow handler never blocks
//! the commit pipeline; overflow drops the oldest queued records.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::ChangeRecord;

/// Async change handler. Errors are routed to the subscription's error sink
/// and never reach the producer.
pub type ChangeHandler = Arc<
    dyn Fn(ChangeRecord) -> BoxFuture<'static, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Optional per-subscription error sink.
pub type ErrorSink =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync), &ChangeRecord) + Send + Sync>;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SubscriberQueue {
    records: Mutex<VecDeque<ChangeRecord>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SubscriberQueue {
    fn push(&self, record: ChangeRecord) {
        let Ok(mut queue) = self.records.lock() else {
            return;
        };
        if queue.len() >= self.capacity {
            queue.pop_front();
            warn!("subscriber queue full, dropping oldest change record");
        }
        queue.push_back(record);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ChangeRecord> {
        self.records.lock().ok()?.pop_front()
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

struct Subscriber {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

/// Registry of live subscriptions, shared by a table handle and the commit
/// pipeline.
pub struct SubscriberRegistry {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a handler. Delivery starts with the next committed change.
    pub fn subscribe(
        self: &Arc<Self>,
        handler: ChangeHandler,
        error_sink: Option<ErrorSink>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(SubscriberQueue {
            records: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: self.queue_capacity,
        });
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(Subscriber {
                id,
                queue: queue.clone(),
            });
        }

        let worker_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                match worker_queue.pop() {
                    Some(record) => {
                        if let Err(err) = handler(record.clone()).await {
                            match &error_sink {
                                Some(sink) => sink(err.as_ref(), &record),
                                None => {
                                    warn!(error = %err, "change handler failed")
                                }
                            }
                        }
                    }
                    None => {
                        if worker_queue.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        worker_queue.notified().await;
                    }
                }
            }
            debug!("subscription worker exited");
        });

        SubscriptionHandle {
            id,
            registry: Arc::downgrade(self),
        }
    }

    /// Ergonomic wrapper around [`SubscriberRegistry::subscribe`] for plain
    /// async closures.
    pub fn subscribe_fn<F, Fut>(self: &Arc<Self>, handler: F) -> SubscriptionHandle
    where
        F: Fn(ChangeRecord) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        let handler: ChangeHandler = Arc::new(move |record| {
            let fut: BoxFuture<'static, _> = Box::pin(handler(record));
            fut
        });
        self.subscribe(handler, None)
    }

    /// Enqueue `records` for every live subscriber. Never blocks.
    pub(crate) fn dispatch(&self, records: Vec<ChangeRecord>) {
        let Ok(subscribers) = self.subscribers.read() else {
            return;
        };
        for subscriber in subscribers.iter() {
            for record in &records {
                subscriber.queue.push(record.clone());
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                let subscriber = subscribers.swap_remove(pos);
                subscriber.queue.closed.store(true, Ordering::SeqCst);
                subscriber.queue.notify.notify_one();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

/// Keeps a subscription addressable; dropping the handle does not cancel
/// delivery, `unsubscribe` does.
pub struct SubscriptionHandle {
    id: u64,
    registry: std::sync::Weak<SubscriberRegistry>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}
