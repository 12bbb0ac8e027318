//! Broker-side plumbing of the two flows.
//!
//! Callers go through a [`Dispatcher`] (or the [`Client`] facade), which
//! publishes a request and returns a [`PendingResponse`]. Workers run a
//! [`Forwarder`] per flow that calls the external endpoint and publishes the
//! response under the request's token.

pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod forwarder;
pub mod output;
pub mod router;
pub mod worker;

pub use client::{Client, Synthesized};
pub use correlator::{CorrelationOutcome, Correlator};
pub use dispatcher::{Dispatcher, PendingResponse};
pub use forwarder::{FlowHandler, FlowState, Forwarder, RecognitionHandler, SynthesisHandler};
pub use router::ResponseRouter;
pub use worker::WorkerSet;
