//! Requeue-mode correlation: one competing consumer per pending request.
//!
//! Every waiter on a flow reads the same response queue. A waiter acks the
//! response carrying its own token and rejects-and-requeues everything
//! else, so the other waiters still get to see it. Each waiter re-reads the
//! others' traffic, so throughput drops as concurrency grows; the routed
//! mode in [`crate::router`] avoids that.

use std::marker::PhantomData;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use voxbridge_broker::Consumer;
use voxbridge_core::envelope::{Envelope, decode};
use voxbridge_core::error::{Result, VoxBridgeError};
use voxbridge_core::token::CorrelationToken;

/// How a wait ended when it did not fail.
#[derive(Debug)]
pub enum CorrelationOutcome<R> {
    Matched(R),
    Cancelled,
}

impl<R> CorrelationOutcome<R> {
    pub fn into_response(self) -> Result<R> {
        match self {
            Self::Matched(response) => Ok(response),
            Self::Cancelled => Err(VoxBridgeError::Cancelled),
        }
    }
}

pub struct Correlator<R> {
    consumer: Box<dyn Consumer>,
    queue: String,
    token: CorrelationToken,
    _response: PhantomData<fn() -> R>,
}

impl<R: Envelope> Correlator<R> {
    /// `consumer` must be a manual-ack subscription to `queue`.
    pub fn new(consumer: Box<dyn Consumer>, queue: impl Into<String>, token: CorrelationToken) -> Self {
        Self {
            consumer,
            queue: queue.into(),
            token,
            _response: PhantomData,
        }
    }

    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Wait for the response carrying this correlator's token.
    ///
    /// `cancel` is checked only between deliveries; a delivery that has been
    /// taken is always acked or requeued first. On a match the correlator
    /// cancels `cancel` itself. The consumer is closed before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<CorrelationOutcome<R>> {
        let outcome = self.poll(&cancel).await;
        if let Err(e) = self.consumer.close().await {
            debug!(queue = %self.queue, %e, "Failed to close correlator consumer");
        }
        outcome
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<CorrelationOutcome<R>> {
        let mut rejected = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(token = %self.token.short(), rejected, "Correlator cancelled");
                    return Ok(CorrelationOutcome::Cancelled);
                }
                next = self.consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(VoxBridgeError::Transport(format!(
                        "response queue '{}' closed while waiting",
                        self.queue
                    )));
                }
            };

            let response = match decode::<R>(&delivery.body) {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        token = %self.token.short(),
                        bytes = delivery.body.len(),
                        %e,
                        "Discarding malformed response"
                    );
                    delivery.ack().await?;
                    return Err(e);
                }
            };

            if response.token() == &self.token {
                delivery.ack().await?;
                cancel.cancel();
                debug!(token = %self.token.short(), rejected, "Correlator matched response");
                return Ok(CorrelationOutcome::Matched(response));
            }

            trace!(
                token = %self.token.short(),
                other = %response.token().short(),
                redelivered = delivery.redelivered,
                "Requeueing response for another waiter"
            );
            delivery.requeue().await?;
            rejected += 1;
        }
    }
}
