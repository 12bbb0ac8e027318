//! Workers: drain a flow's request queue through an external endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use voxbridge_broker::{AckMode, Broker};
use voxbridge_core::envelope::{
    Envelope, RecognitionRequest, SynthesisRequest, decode, encode,
};
use voxbridge_core::error::{Result, VoxBridgeError};
use voxbridge_core::flow::{FlowProtocol, FlowSpec, RecognitionFlow, SynthesisFlow};
use voxbridge_core::token::CorrelationToken;
use voxbridge_endpoints::{RecognitionEndpoint, SynthesisEndpoint};

type RequestOf<H> = <<H as FlowHandler>::Protocol as FlowProtocol>::Request;
type OutputOf<H> = <<H as FlowHandler>::Protocol as FlowProtocol>::Output;

/// Turns one decoded request into the flow's output.
#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    type Protocol: FlowProtocol;

    async fn handle(&self, request: &RequestOf<Self>) -> anyhow::Result<OutputOf<Self>>;
}

pub struct RecognitionHandler {
    endpoint: Arc<dyn RecognitionEndpoint>,
}

impl RecognitionHandler {
    pub fn new(endpoint: Arc<dyn RecognitionEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl FlowHandler for RecognitionHandler {
    type Protocol = RecognitionFlow;

    async fn handle(&self, request: &RecognitionRequest) -> anyhow::Result<String> {
        let audio = request.audio_bytes()?;
        if audio.len() as u64 != request.audio_len {
            warn!(
                declared = request.audio_len,
                actual = audio.len(),
                "Audio length does not match payload"
            );
        }
        self.endpoint
            .recognize(&request.audio_base64, audio.len() as u64)
            .await
    }
}

pub struct SynthesisHandler {
    endpoint: Arc<dyn SynthesisEndpoint>,
}

impl SynthesisHandler {
    pub fn new(endpoint: Arc<dyn SynthesisEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl FlowHandler for SynthesisHandler {
    type Protocol = SynthesisFlow;

    async fn handle(&self, request: &SynthesisRequest) -> anyhow::Result<Vec<u8>> {
        self.endpoint.synthesize(&request.text).await
    }
}

/// Lifecycle of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Consuming,
    Stopped,
}

pub struct Forwarder<H: FlowHandler> {
    broker: Arc<dyn Broker>,
    spec: FlowSpec,
    handler: H,
    state: watch::Sender<FlowState>,
}

impl<H: FlowHandler> Forwarder<H> {
    pub fn new(broker: Arc<dyn Broker>, spec: FlowSpec, handler: H) -> Self {
        let (state, _) = watch::channel(FlowState::Idle);
        Self {
            broker,
            spec,
            handler,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Consume requests until `shutdown` fires or the request stream ends.
    ///
    /// Requests are consumed on receipt: a request whose decode, endpoint
    /// call or response publish fails is logged and dropped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let flow = <H::Protocol as FlowProtocol>::KIND;
        if self.spec.kind != flow {
            return Err(VoxBridgeError::Config(format!(
                "queues for flow '{}' bound to a {flow} forwarder",
                self.spec.kind
            )));
        }

        self.broker.declare_queue(&self.spec.request_queue).await?;
        self.broker.declare_queue(&self.spec.response_queue).await?;
        let mut consumer = self
            .broker
            .consume(&self.spec.request_queue, AckMode::Auto)
            .await?;

        self.state.send_replace(FlowState::Consuming);
        info!(%flow, queue = %self.spec.request_queue, "Forwarder consuming");

        let mut forwarded = 0u64;
        let mut dropped = 0u64;
        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = consumer.next() => next,
            };

            match next {
                Some(Ok(delivery)) => match self.forward(&delivery.body).await {
                    Ok(token) => {
                        forwarded += 1;
                        debug!(%flow, token = %token.short(), "Forwarded response");
                    }
                    Err(e) => {
                        dropped += 1;
                        warn!(%flow, bytes = delivery.body.len(), %e, "Dropped request");
                    }
                },
                Some(Err(e)) => {
                    error!(%flow, %e, "Request stream failed");
                    break Err(e);
                }
                None => {
                    info!(%flow, "Request queue closed");
                    break Ok(());
                }
            }
        };

        if let Err(e) = consumer.close().await {
            debug!(%flow, %e, "Failed to close request consumer");
        }
        self.state.send_replace(FlowState::Stopped);
        info!(%flow, forwarded, dropped, "Forwarder stopped");
        result
    }

    async fn forward(&self, body: &[u8]) -> Result<CorrelationToken> {
        let request: RequestOf<H> = decode(body)?;
        let token = request.token().clone();

        let output = self
            .handler
            .handle(&request)
            .await
            .map_err(|e| VoxBridgeError::Endpoint(format!("{e:#}")))?;

        let response = <H::Protocol as FlowProtocol>::respond(output, token.clone());
        self.broker
            .publish(&self.spec.response_queue, &encode(&response)?)
            .await?;
        Ok(token)
    }
}
