//! Core types for voxbridge: config, errors, correlation tokens, wire envelopes,
//! and the flow protocol that ties a request shape to its response shape.

pub mod config;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod token;
