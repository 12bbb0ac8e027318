//! Publishing requests and handing back a handle to their response.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use voxbridge_broker::{AckMode, Broker};
use voxbridge_core::config::CorrelationMode;
use voxbridge_core::envelope::{Envelope, encode};
use voxbridge_core::error::{Result, VoxBridgeError};
use voxbridge_core::flow::{FlowProtocol, FlowSpec};
use voxbridge_core::token::CorrelationToken;

use crate::correlator::{CorrelationOutcome, Correlator};
use crate::router::ResponseRouter;

type WaitTask<R> = JoinHandle<Result<CorrelationOutcome<R>>>;

/// Publishes requests for one flow and waits for their responses.
pub struct Dispatcher<P: FlowProtocol> {
    broker: Arc<dyn Broker>,
    spec: FlowSpec,
    mode: CorrelationMode,
    router: Option<Arc<ResponseRouter<P::Response>>>,
    _protocol: PhantomData<fn() -> P>,
}

impl<P: FlowProtocol> Dispatcher<P> {
    /// Declare the flow's queues and, in routed mode, start its response router.
    pub async fn connect(broker: Arc<dyn Broker>, spec: FlowSpec, mode: CorrelationMode) -> Result<Self> {
        if spec.kind != P::KIND {
            return Err(VoxBridgeError::Config(format!(
                "queues for flow '{}' bound to a {} dispatcher",
                spec.kind,
                P::KIND
            )));
        }

        broker.declare_queue(&spec.request_queue).await?;
        broker.declare_queue(&spec.response_queue).await?;

        let router = match mode {
            CorrelationMode::Routed => {
                Some(ResponseRouter::start(&broker, &spec.response_queue).await?)
            }
            CorrelationMode::Requeue => None,
        };

        Ok(Self {
            broker,
            spec,
            mode,
            router,
            _protocol: PhantomData,
        })
    }

    pub fn spec(&self) -> &FlowSpec {
        &self.spec
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Requests still waiting on the router, `None` in requeue mode.
    pub fn pending(&self) -> Option<usize> {
        self.router.as_ref().map(|r| r.pending())
    }

    /// Publish one request and start waiting for its response in the
    /// background. Encoding or publish failures are returned here and leave
    /// nothing running.
    pub async fn dispatch(&self, payload: P::Payload) -> Result<PendingResponse<P::Response>> {
        let token = CorrelationToken::generate();
        let body = encode(&P::wrap(payload, token.clone()))?;
        let cancel = CancellationToken::new();

        let task = match &self.router {
            Some(router) => {
                let rx = router.register(token.clone())?;
                if let Err(e) = self.broker.publish(&self.spec.request_queue, &body).await {
                    router.forget(&token);
                    return Err(e);
                }
                tokio::spawn(wait_routed(rx, router.clone(), token.clone(), cancel.clone()))
            }
            None => {
                let consumer = self
                    .broker
                    .consume(&self.spec.response_queue, AckMode::Manual)
                    .await?;
                self.broker.publish(&self.spec.request_queue, &body).await?;
                let correlator = Correlator::<P::Response>::new(
                    consumer,
                    self.spec.response_queue.clone(),
                    token.clone(),
                );
                tokio::spawn(correlator.run(cancel.clone()))
            }
        };

        debug!(
            flow = %P::KIND,
            queue = %self.spec.request_queue,
            token = %token.short(),
            bytes = body.len(),
            "Dispatched request"
        );

        Ok(PendingResponse { token, cancel, task })
    }
}

async fn wait_routed<R: Envelope>(
    mut rx: oneshot::Receiver<Result<R>>,
    router: Arc<ResponseRouter<R>>,
    token: CorrelationToken,
    cancel: CancellationToken,
) -> Result<CorrelationOutcome<R>> {
    let received = tokio::select! {
        biased;
        received = &mut rx => received,
        _ = cancel.cancelled() => {
            if router.forget(&token) {
                return Ok(CorrelationOutcome::Cancelled);
            }
            // Already routed; the response is on its way.
            rx.await
        }
    };

    let response = received.map_err(|_| {
        VoxBridgeError::Transport(format!("response router for '{}' went away", router.queue()))
    })??;
    cancel.cancel();
    Ok(CorrelationOutcome::Matched(response))
}

/// Handle to one in-flight request.
///
/// Dropping it detaches the wait: the response is still consumed when it
/// arrives, but nobody observes it.
pub struct PendingResponse<R> {
    token: CorrelationToken,
    cancel: CancellationToken,
    task: WaitTask<R>,
}

impl<R: Envelope> PendingResponse<R> {
    pub fn token(&self) -> &CorrelationToken {
        &self.token
    }

    /// Give up waiting. Messages being evaluated are still settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fires on cancellation and also once the response has matched.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<R> {
        settle(self.task.await)
    }

    /// Wait at most `timeout`, then cancel. A response that was already
    /// matched when the deadline hit is still returned.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<R> {
        let Self { token, cancel, mut task } = self;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => settle(joined),
            Err(_) => {
                debug!(token = %token.short(), ?timeout, "Giving up on response");
                cancel.cancel();
                settle(task.await)
            }
        }
    }

    /// Report the result through `callback` instead of awaiting it.
    pub fn on_complete<F>(self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(CorrelationToken, Result<R>) + Send + 'static,
    {
        tokio::spawn(async move {
            let token = self.token.clone();
            let result = self.wait().await;
            callback(token, result);
        })
    }
}

fn settle<R>(joined: std::result::Result<Result<CorrelationOutcome<R>>, JoinError>) -> Result<R> {
    match joined {
        Ok(outcome) => outcome?.into_response(),
        Err(e) => Err(VoxBridgeError::Other(anyhow::anyhow!("response wait aborted: {e}"))),
    }
}
