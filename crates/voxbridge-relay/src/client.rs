//! Caller-side facade over both flows.

use std::sync::Arc;
use std::time::Duration;

use voxbridge_broker::Broker;
use voxbridge_core::config::Config;
use voxbridge_core::envelope::Envelope;
use voxbridge_core::error::Result;
use voxbridge_core::flow::{FlowKind, RecognitionFlow, SynthesisFlow};
use voxbridge_core::token::CorrelationToken;

use crate::dispatcher::{Dispatcher, PendingResponse};

/// Audio produced for one synthesis request.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub token: CorrelationToken,
    pub audio: Vec<u8>,
}

pub struct Client {
    recognition: Dispatcher<RecognitionFlow>,
    synthesis: Dispatcher<SynthesisFlow>,
    timeout: Option<Duration>,
}

impl Client {
    pub async fn connect(broker: Arc<dyn Broker>, config: &Config) -> Result<Self> {
        let mode = config.correlation_mode();
        let recognition = Dispatcher::connect(
            broker.clone(),
            config.flow_spec(FlowKind::Recognition),
            mode,
        )
        .await?;
        let synthesis =
            Dispatcher::connect(broker, config.flow_spec(FlowKind::Synthesis), mode).await?;

        Ok(Self {
            recognition,
            synthesis,
            timeout: config.correlation_timeout(),
        })
    }

    /// Give up on a response after `timeout`; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn recognition(&self) -> &Dispatcher<RecognitionFlow> {
        &self.recognition
    }

    pub fn synthesis(&self) -> &Dispatcher<SynthesisFlow> {
        &self.synthesis
    }

    pub async fn recognize(&self, audio: Vec<u8>) -> Result<String> {
        let pending = self.recognition.dispatch(audio).await?;
        Ok(self.finish(pending).await?.result)
    }

    pub async fn synthesize(&self, text: impl Into<String>) -> Result<Synthesized> {
        let pending = self.synthesis.dispatch(text.into()).await?;
        let token = pending.token().clone();
        let response = self.finish(pending).await?;
        Ok(Synthesized {
            token,
            audio: response.audio_bytes()?,
        })
    }

    async fn finish<R: Envelope>(&self, pending: PendingResponse<R>) -> Result<R> {
        match self.timeout {
            Some(timeout) => pending.wait_timeout(timeout).await,
            None => pending.wait().await,
        }
    }
}
