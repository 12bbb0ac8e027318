//! Runs the forwarders of both flows side by side.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use voxbridge_broker::Broker;
use voxbridge_core::config::Config;
use voxbridge_core::error::{Result, VoxBridgeError};
use voxbridge_core::flow::FlowKind;
use voxbridge_endpoints::{RecognitionEndpoint, SynthesisEndpoint};

use crate::forwarder::{FlowState, Forwarder, RecognitionHandler, SynthesisHandler};

struct Worker {
    kind: FlowKind,
    state: watch::Receiver<FlowState>,
    task: JoinHandle<Result<()>>,
}

pub struct WorkerSet {
    workers: Vec<Worker>,
    shutdown: CancellationToken,
}

impl WorkerSet {
    /// Spawn a forwarder for every flow that has an endpoint.
    pub fn spawn(
        broker: Arc<dyn Broker>,
        config: &Config,
        recognition: Option<Arc<dyn RecognitionEndpoint>>,
        synthesis: Option<Arc<dyn SynthesisEndpoint>>,
        shutdown: CancellationToken,
    ) -> Self {
        let mut workers = Vec::new();

        if let Some(endpoint) = recognition {
            let forwarder = Forwarder::new(
                broker.clone(),
                config.flow_spec(FlowKind::Recognition),
                RecognitionHandler::new(endpoint),
            );
            workers.push(Worker {
                kind: FlowKind::Recognition,
                state: forwarder.state(),
                task: tokio::spawn(forwarder.run(shutdown.clone())),
            });
        }

        if let Some(endpoint) = synthesis {
            let forwarder = Forwarder::new(
                broker,
                config.flow_spec(FlowKind::Synthesis),
                SynthesisHandler::new(endpoint),
            );
            workers.push(Worker {
                kind: FlowKind::Synthesis,
                state: forwarder.state(),
                task: tokio::spawn(forwarder.run(shutdown.clone())),
            });
        }

        info!(flows = workers.len(), "Workers started");
        Self { workers, shutdown }
    }

    pub fn flows(&self) -> Vec<FlowKind> {
        self.workers.iter().map(|w| w.kind).collect()
    }

    pub fn state(&self, kind: FlowKind) -> Option<FlowState> {
        self.workers
            .iter()
            .find(|w| w.kind == kind)
            .map(|w| *w.state.borrow())
    }

    /// Resolves once every forwarder has left `Idle`.
    pub async fn ready(&self) {
        for worker in &self.workers {
            let mut state = worker.state.clone();
            let _ = state.wait_for(|s| *s != FlowState::Idle).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every forwarder to finish. Returns the first failure.
    pub async fn join(self) -> Result<()> {
        let (kinds, tasks): (Vec<_>, Vec<_>) =
            self.workers.into_iter().map(|w| (w.kind, w.task)).unzip();

        let mut first_error = None;
        for (kind, joined) in kinds.into_iter().zip(futures::future::join_all(tasks).await) {
            let result = joined
                .map_err(|e| VoxBridgeError::Other(anyhow::anyhow!("{kind} worker panicked: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(flow = %kind, %e, "Worker failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
