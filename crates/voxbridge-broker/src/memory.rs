//! In-process broker with AMQP-like delivery semantics.
//!
//! Queues are FIFO. Manual-ack deliveries stay outstanding until acked or
//! rejected; a reject-and-requeue appends the message to the tail with the
//! `redelivered` flag set, and a delivery dropped without being resolved is
//! requeued the same way. A consumer skips messages it has just rejected
//! itself while anything else is ready, and otherwise waits a short moment
//! for a competing consumer to pick them up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use voxbridge_core::error::{Result, VoxBridgeError};

use crate::{AckMode, Acker, Broker, Consumer, Delivery};

/// How long a consumer leaves its own rejected messages to competitors.
const REDELIVERY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
    /// Consumer that requeued this message most recently.
    rejected_by: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    next_tag: u64,
    closed: bool,
}

enum Take {
    Message(Delivery),
    OnlyOwnRejects,
    Empty,
    Closed,
}

struct MemoryQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, body: Vec<u8>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(VoxBridgeError::Transport(format!(
                    "queue '{}' is closed",
                    self.name
                )));
            }
            state.ready.push_back(StoredMessage {
                body,
                redelivered: false,
                rejected_by: None,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn take(self: &Arc<Self>, consumer: u64, mode: AckMode, own_rejects_ok: bool) -> Take {
        let mut state = self.lock();
        if state.closed {
            return Take::Closed;
        }

        let position = state
            .ready
            .iter()
            .position(|m| m.rejected_by != Some(consumer))
            .or(if own_rejects_ok && !state.ready.is_empty() {
                Some(0)
            } else {
                None
            });

        let Some(position) = position else {
            return if state.ready.is_empty() {
                Take::Empty
            } else {
                Take::OnlyOwnRejects
            };
        };

        let Some(message) = state.ready.remove(position) else {
            return Take::Empty;
        };

        let delivery = match mode {
            AckMode::Auto => Delivery::new(message.body, message.redelivered, Box::new(AutoAcker)),
            AckMode::Manual => {
                let tag = state.next_tag;
                state.next_tag += 1;
                let body = message.body.clone();
                let redelivered = message.redelivered;
                state.unacked.insert(tag, message);
                Delivery::new(
                    body,
                    redelivered,
                    Box::new(MemoryAcker {
                        queue: Arc::clone(self),
                        tag,
                        consumer,
                        settled: AtomicBool::new(false),
                    }),
                )
            }
        };
        Take::Message(delivery)
    }

    fn ack(&self, tag: u64) -> Result<()> {
        let mut state = self.lock();
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| self.unknown_tag(tag))
    }

    fn requeue(&self, tag: u64, rejected_by: Option<u64>) -> Result<()> {
        {
            let mut state = self.lock();
            let mut message = state
                .unacked
                .remove(&tag)
                .ok_or_else(|| self.unknown_tag(tag))?;
            message.redelivered = true;
            message.rejected_by = rejected_by;
            state.ready.push_back(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn unknown_tag(&self, tag: u64) -> VoxBridgeError {
        VoxBridgeError::Transport(format!(
            "unknown delivery tag {tag} on queue '{}'",
            self.name
        ))
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    tag: u64,
    consumer: u64,
    settled: AtomicBool,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        self.queue.ack(self.tag)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        if requeue {
            self.queue.requeue(self.tag, Some(self.consumer))
        } else {
            self.queue.ack(self.tag)
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !*self.settled.get_mut() {
            debug!(queue = %self.queue.name, tag = self.tag, "Unresolved delivery dropped, requeueing");
            let _ = self.queue.requeue(self.tag, None);
        }
    }
}

/// Acker for auto-ack deliveries: the message is already gone.
struct AutoAcker;

#[async_trait]
impl Acker for AutoAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if requeue {
            return Err(VoxBridgeError::Transport(
                "cannot requeue an auto-acknowledged delivery".into(),
            ));
        }
        Ok(())
    }
}

/// Competing consumer on one in-memory queue.
pub struct MemoryConsumer {
    queue: Arc<MemoryQueue>,
    id: u64,
    mode: AckMode,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let mut own_rejects_ok = false;
        loop {
            // Register for wakeups before looking, so a publish between the
            // check and the wait is not missed.
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);

            match self.queue.take(self.id, self.mode, own_rejects_ok) {
                Take::Message(delivery) => return Some(Ok(delivery)),
                Take::Closed => return None,
                Take::OnlyOwnRejects => {
                    let _ = tokio::time::timeout(REDELIVERY_BACKOFF, notified).await;
                    own_rejects_ok = true;
                }
                Take::Empty => notified.await,
            }
        }
    }
}

/// Broker whose queues live in this process.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    next_consumer: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>> {
        self.queues()
            .get(name)
            .cloned()
            .ok_or_else(|| VoxBridgeError::Transport(format!("queue '{name}' is not declared")))
    }

    /// `(ready, unacknowledged)` message counts, or `None` for an undeclared queue.
    pub fn message_count(&self, queue: &str) -> Option<(usize, usize)> {
        let queue = self.queue(queue).ok()?;
        let state = queue.lock();
        Some((state.ready.len(), state.unacked.len()))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn id(&self) -> &str {
        "memory"
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoxBridgeError::Transport("broker is closed".into()));
        }
        self.queues()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, "Declared queue");
                Arc::new(MemoryQueue::new(name))
            });
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.queue(queue)?.push(body.to_vec())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<Box<dyn Consumer>> {
        let queue = self.queue(queue)?;
        let id = self.next_consumer.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConsumer { queue, id, mode }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for queue in self.queues().values() {
            queue.close();
        }
        Ok(())
    }
}
