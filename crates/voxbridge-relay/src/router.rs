//! Routed-mode correlation.
//!
//! A single consumer per flow reads the shared response queue and hands
//! each response to the waiter registered under its token. Responses with a
//! token nobody here registered are requeued, since another process sharing
//! the queue may own them. Tokens whose waiter gave up are remembered for a
//! while so their late responses are discarded instead of circulating.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use voxbridge_broker::{AckMode, Broker, Consumer, Delivery};
use voxbridge_core::envelope::{Envelope, decode};
use voxbridge_core::error::{Result, VoxBridgeError};
use voxbridge_core::token::CorrelationToken;

/// Abandoned tokens remembered per router.
const ABANDONED_CAPACITY: usize = 1024;

type Waiter<R> = oneshot::Sender<Result<R>>;

struct WaitingList<R> {
    waiters: HashMap<CorrelationToken, Waiter<R>>,
    abandoned: HashSet<CorrelationToken>,
    abandoned_order: VecDeque<CorrelationToken>,
    /// Set once the router stopped; the reason is handed to late registrations.
    stopped: Option<String>,
}

impl<R> WaitingList<R> {
    fn new() -> Self {
        Self {
            waiters: HashMap::new(),
            abandoned: HashSet::new(),
            abandoned_order: VecDeque::new(),
            stopped: None,
        }
    }

    fn abandon(&mut self, token: CorrelationToken) {
        if self.abandoned.insert(token.clone()) {
            self.abandoned_order.push_back(token);
        }
        while self.abandoned_order.len() > ABANDONED_CAPACITY {
            if let Some(oldest) = self.abandoned_order.pop_front() {
                self.abandoned.remove(&oldest);
            }
        }
    }

    fn fail_all(&mut self, reason: &str) {
        self.stopped = Some(reason.to_string());
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(VoxBridgeError::Transport(reason.to_string())));
        }
    }
}

type SharedWaitingList<R> = Arc<Mutex<WaitingList<R>>>;

fn lock<R>(list: &SharedWaitingList<R>) -> MutexGuard<'_, WaitingList<R>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Route<R> {
    Deliver(Waiter<R>),
    Discard,
    Requeue,
}

pub struct ResponseRouter<R> {
    queue: String,
    waiting: SharedWaitingList<R>,
    shutdown: CancellationToken,
}

impl<R: Envelope> ResponseRouter<R> {
    /// Subscribe to `queue` and start routing in a background task.
    pub async fn start(broker: &Arc<dyn Broker>, queue: &str) -> Result<Arc<Self>> {
        let consumer = broker.consume(queue, AckMode::Manual).await?;
        let router = Arc::new(Self {
            queue: queue.to_string(),
            waiting: Arc::new(Mutex::new(WaitingList::new())),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(route(
            consumer,
            router.queue.clone(),
            router.waiting.clone(),
            router.shutdown.clone(),
        ));
        info!(queue, "Response router started");

        Ok(router)
    }

    /// Register a waiter. Must happen before the request is published.
    pub fn register(&self, token: CorrelationToken) -> Result<oneshot::Receiver<Result<R>>> {
        let mut list = lock(&self.waiting);
        if let Some(reason) = &list.stopped {
            return Err(VoxBridgeError::Transport(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        list.waiters.insert(token, tx);
        Ok(rx)
    }

    /// Drop a waiter. Returns `false` when its response was already routed.
    pub fn forget(&self, token: &CorrelationToken) -> bool {
        let mut list = lock(&self.waiting);
        if list.waiters.remove(token).is_some() {
            list.abandon(token.clone());
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.waiting).waiters.len()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop routing; every pending waiter fails.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl<R> Drop for ResponseRouter<R> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route<R: Envelope>(
    mut consumer: Box<dyn Consumer>,
    queue: String,
    waiting: SharedWaitingList<R>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break format!("response router for '{queue}' shut down"),
            next = consumer.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if let Err(e) = dispatch_delivery(&queue, &waiting, delivery).await {
                    error!(queue = %queue, %e, "Failed to settle response");
                }
            }
            Some(Err(e)) => {
                error!(queue = %queue, %e, "Response stream failed");
                break format!("response stream on '{queue}' failed: {e}");
            }
            None => break format!("response queue '{queue}' closed"),
        }
    };

    let pending = {
        let mut list = lock(&waiting);
        let pending = list.waiters.len();
        list.fail_all(&reason);
        pending
    };
    if let Err(e) = consumer.close().await {
        debug!(queue = %queue, %e, "Failed to close router consumer");
    }
    info!(queue = %queue, pending, "Response router stopped");
}

async fn dispatch_delivery<R: Envelope>(
    queue: &str,
    waiting: &SharedWaitingList<R>,
    delivery: Delivery,
) -> Result<()> {
    let response = match decode::<R>(&delivery.body) {
        Ok(response) => response,
        Err(e) => {
            warn!(queue, bytes = delivery.body.len(), %e, "Discarding malformed response");
            return delivery.ack().await;
        }
    };

    let route = {
        let mut list = lock(waiting);
        match list.waiters.remove(response.token()) {
            Some(waiter) => Route::Deliver(waiter),
            None if list.abandoned.contains(response.token()) => Route::Discard,
            None => Route::Requeue,
        }
    };

    let token = response.token().short().to_string();
    match route {
        Route::Deliver(waiter) => {
            let acked = delivery.ack().await;
            debug!(queue, token = %token, "Routed response");
            if waiter.send(Ok(response)).is_err() {
                debug!(queue, token = %token, "Waiter went away before its response arrived");
            }
            acked
        }
        Route::Discard => {
            debug!(queue, token = %token, "Discarding response for abandoned request");
            delivery.ack().await
        }
        Route::Requeue => {
            trace!(queue, token = %token, "Requeueing response with unknown token");
            delivery.requeue().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use voxbridge_broker::MemoryBroker;
    use voxbridge_core::envelope::{SynthesisResponse, encode};

    const QUEUE: &str = "responses";

    async fn setup() -> (Arc<MemoryBroker>, Arc<ResponseRouter<SynthesisResponse>>) {
        let memory = Arc::new(MemoryBroker::new());
        memory.declare_queue(QUEUE).await.unwrap();
        let broker: Arc<dyn Broker> = memory.clone();
        let router = ResponseRouter::start(&broker, QUEUE).await.unwrap();
        (memory, router)
    }

    async fn publish(broker: &MemoryBroker, audio: &[u8], token: &CorrelationToken) {
        let body = encode(&SynthesisResponse::from_audio(audio, token.clone())).unwrap();
        broker.publish(QUEUE, &body).await.unwrap();
    }

    async fn wait_for_empty(broker: &MemoryBroker) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.message_count(QUEUE) != Some((0, 0)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_routes_to_registered_waiter() {
        let (broker, router) = setup().await;
        let token = CorrelationToken::generate();
        let rx = router.register(token.clone()).unwrap();
        assert_eq!(router.pending(), 1);

        publish(&broker, b"pcm", &token).await;

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.audio_bytes().unwrap(), b"pcm");
        assert_eq!(router.pending(), 0);
        assert_eq!(broker.message_count(QUEUE), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_unknown_token_stays_available() {
        let (broker, _router) = setup().await;
        let stranger = CorrelationToken::generate();
        publish(&broker, b"theirs", &stranger).await;

        let mut other = broker.consume(QUEUE, AckMode::Manual).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), other.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let response: SynthesisResponse = decode(&delivery.body).unwrap();
        assert_eq!(response.hash, stranger);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_forget_discards_late_response() {
        let (broker, router) = setup().await;
        let token = CorrelationToken::generate();
        let _rx = router.register(token.clone()).unwrap();

        assert!(router.forget(&token));
        assert!(!router.forget(&token));

        publish(&broker, b"too late", &token).await;
        wait_for_empty(&broker).await;
    }

    #[tokio::test]
    async fn test_malformed_response_is_skipped() {
        let (broker, router) = setup().await;
        let token = CorrelationToken::generate();
        let rx = router.register(token.clone()).unwrap();

        broker.publish(QUEUE, b"\x00garbage").await.unwrap();
        publish(&broker, b"ok", &token).await;

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.audio_bytes().unwrap(), b"ok");
        assert_eq!(broker.message_count(QUEUE), Some((0, 0)));
    }

    #[tokio::test]
    async fn test_stream_loss_fails_pending_waiters() {
        let (broker, router) = setup().await;
        let rx = router.register(CorrelationToken::generate()).unwrap();

        broker.close().await.unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, VoxBridgeError::Transport(_)));
        assert!(router.register(CorrelationToken::generate()).is_err());
    }

    #[tokio::test]
    async fn test_late_response_redelivered_twice_is_discarded() {
        let (broker, router) = setup().await;
        let token = CorrelationToken::generate();
        let _rx = router.register(token.clone()).unwrap();
        assert!(router.forget(&token));

        publish(&broker, b"late", &token).await;
        wait_for_empty(&broker).await;
        publish(&broker, b"late", &token).await;
        wait_for_empty(&broker).await;
    }

    #[tokio::test]
    async fn test_multibyte_token_does_not_stop_routing() {
        let (broker, router) = setup().await;
        let token = CorrelationToken::generate();
        let rx = router.register(token.clone()).unwrap();

        publish(&broker, b"theirs", &CorrelationToken::from("aaaaaaa中")).await;
        publish(&broker, b"mine", &token).await;

        let response = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.audio_bytes().unwrap(), b"mine");
        assert_eq!(router.pending(), 0);
    }

    #[test]
    fn test_abandoned_tokens_are_bounded() {
        let mut list = WaitingList::<SynthesisResponse>::new();
        for _ in 0..ABANDONED_CAPACITY + 10 {
            list.abandon(CorrelationToken::generate());
        }
        assert_eq!(list.abandoned.len(), ABANDONED_CAPACITY);
        assert_eq!(list.abandoned_order.len(), ABANDONED_CAPACITY);
    }
}
