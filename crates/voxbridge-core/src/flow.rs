//! Flows: a named request/response queue pair and the envelope types that
//! travel over it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::{
    Envelope, RecognitionRequest, RecognitionResponse, SynthesisRequest, SynthesisResponse,
};
use crate::token::CorrelationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Speech to text.
    Recognition,
    /// Text to speech.
    Synthesis,
}

impl FlowKind {
    pub const ALL: [FlowKind; 2] = [FlowKind::Recognition, FlowKind::Synthesis];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for FlowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recognition" | "stt" => Ok(Self::Recognition),
            "synthesis" | "tts" => Ok(Self::Synthesis),
            other => Err(format!("unknown flow '{other}'")),
        }
    }
}

/// Static queue binding of one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub kind: FlowKind,
    pub request_queue: String,
    pub response_queue: String,
}

impl FlowSpec {
    pub fn new(
        kind: FlowKind,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
        }
    }
}

/// Binds a flow kind to the shapes that travel through it.
///
/// `Payload` is what a caller hands to the dispatcher, `Output` is what the
/// worker's endpoint produces. `wrap` and `respond` stamp the token so a
/// response can only ever be built with the token of its request.
pub trait FlowProtocol: Send + Sync + 'static {
    const KIND: FlowKind;

    type Payload: Send + 'static;
    type Request: Envelope;
    type Response: Envelope;
    type Output: Send + 'static;

    fn wrap(payload: Self::Payload, token: CorrelationToken) -> Self::Request;

    fn respond(output: Self::Output, token: CorrelationToken) -> Self::Response;
}

/// Audio bytes in, transcript out.
pub struct RecognitionFlow;

impl FlowProtocol for RecognitionFlow {
    const KIND: FlowKind = FlowKind::Recognition;

    type Payload = Vec<u8>;
    type Request = RecognitionRequest;
    type Response = RecognitionResponse;
    type Output = String;

    fn wrap(payload: Vec<u8>, token: CorrelationToken) -> RecognitionRequest {
        RecognitionRequest::from_audio(&payload, token)
    }

    fn respond(output: String, token: CorrelationToken) -> RecognitionResponse {
        RecognitionResponse {
            result: output,
            hash: token,
        }
    }
}

/// Text in, audio bytes out.
pub struct SynthesisFlow;

impl FlowProtocol for SynthesisFlow {
    const KIND: FlowKind = FlowKind::Synthesis;

    type Payload = String;
    type Request = SynthesisRequest;
    type Response = SynthesisResponse;
    type Output = Vec<u8>;

    fn wrap(payload: String, token: CorrelationToken) -> SynthesisRequest {
        SynthesisRequest {
            text: payload,
            hash: token,
        }
    }

    fn respond(output: Vec<u8>, token: CorrelationToken) -> SynthesisResponse {
        SynthesisResponse::from_audio(&output, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_kind_parsing() {
        assert_eq!("recognition".parse::<FlowKind>(), Ok(FlowKind::Recognition));
        assert_eq!("tts".parse::<FlowKind>(), Ok(FlowKind::Synthesis));
        assert!("video".parse::<FlowKind>().is_err());
    }

    #[test]
    fn test_respond_keeps_request_token() {
        let token = CorrelationToken::generate();
        let req = SynthesisFlow::wrap("hello".into(), token.clone());
        let resp = SynthesisFlow::respond(vec![1, 2, 3], req.token().clone());
        assert_eq!(resp.token(), &token);
        assert_eq!(resp.audio_bytes().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_recognition_wrap_sets_length() {
        let req = RecognitionFlow::wrap(vec![0u8; 320], CorrelationToken::from("t"));
        assert_eq!(req.audio_len, 320);
    }
}
