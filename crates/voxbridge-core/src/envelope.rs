//! Wire envelopes exchanged over the request and response queues.
//!
//! Field names are fixed by the wire format and must not change. Every
//! envelope carries the correlation token in its `hash` field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::token::CorrelationToken;

/// A message body that carries a correlation token.
pub trait Envelope: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn token(&self) -> &CorrelationToken;
}

/// Serialize an envelope to its JSON wire form.
pub fn encode<E: Envelope>(envelope: &E) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse a wire body into an envelope. Missing fields, wrong types and
/// non-JSON bodies are all codec errors.
pub fn decode<E: Envelope>(body: &[u8]) -> Result<E> {
    Ok(serde_json::from_slice(body)?)
}

/// Speech-to-text request. `audioLen` is the decoded audio size in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionRequest {
    pub audio_len: u64,
    pub audio_base64: String,
    pub hash: CorrelationToken,
}

impl RecognitionRequest {
    pub fn from_audio(audio: &[u8], hash: CorrelationToken) -> Self {
        Self {
            audio_len: audio.len() as u64,
            audio_base64: STANDARD.encode(audio),
            hash,
        }
    }

    pub fn audio_bytes(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(&self.audio_base64)?)
    }
}

impl Envelope for RecognitionRequest {
    fn token(&self) -> &CorrelationToken {
        &self.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionResponse {
    pub result: String,
    pub hash: CorrelationToken,
}

impl Envelope for RecognitionResponse {
    fn token(&self) -> &CorrelationToken {
        &self.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub hash: CorrelationToken,
}

impl Envelope for SynthesisRequest {
    fn token(&self) -> &CorrelationToken {
        &self.hash
    }
}

/// Text-to-speech result; `audioData` is base64 of the raw audio stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResponse {
    pub audio_data: String,
    pub hash: CorrelationToken,
}

impl SynthesisResponse {
    pub fn from_audio(audio: &[u8], hash: CorrelationToken) -> Self {
        Self {
            audio_data: STANDARD.encode(audio),
            hash,
        }
    }

    pub fn audio_bytes(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(&self.audio_data)?)
    }
}

impl Envelope for SynthesisResponse {
    fn token(&self) -> &CorrelationToken {
        &self.hash
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::VoxBridgeError;

    #[test]
    fn test_recognition_request_wire_names() {
        let req = RecognitionRequest::from_audio(b"RIFF", CorrelationToken::from("t1"));
        let value: serde_json::Value = serde_json::from_slice(&encode(&req).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"audioLen": 4, "audioBase64": "UklGRg==", "hash": "t1"})
        );
    }

    #[test]
    fn test_synthesis_response_wire_names() {
        let resp = SynthesisResponse::from_audio(&[0, 1, 2], CorrelationToken::from("t2"));
        let value: serde_json::Value = serde_json::from_slice(&encode(&resp).unwrap()).unwrap();
        assert_eq!(value["audioData"], "AAEC");
        assert_eq!(value["hash"], "t2");
    }

    #[test]
    fn test_audio_survives_the_wire() {
        let audio: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let req = RecognitionRequest::from_audio(&audio, CorrelationToken::generate());
        let decoded: RecognitionRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(decoded.audio_bytes().unwrap(), audio);
        assert_eq!(decoded.audio_len, 4096);

        let resp = SynthesisResponse::from_audio(&audio, CorrelationToken::generate());
        let decoded: SynthesisResponse = decode(&encode(&resp).unwrap()).unwrap();
        assert_eq!(decoded.audio_bytes().unwrap(), audio);
    }

    #[test]
    fn test_text_survives_the_wire() {
        let req = SynthesisRequest {
            text: "你好, \"world\"\n".into(),
            hash: CorrelationToken::from("t3"),
        };
        let decoded: SynthesisRequest = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_length_as_string_is_rejected() {
        let body = br#"{"audioLen": "4", "audioBase64": "UklGRg==", "hash": "t1"}"#;
        let err = decode::<RecognitionRequest>(body).unwrap_err();
        assert!(matches!(err, VoxBridgeError::Codec(_)));
    }

    #[test]
    fn test_missing_hash_is_rejected() {
        let err = decode::<RecognitionResponse>(br#"{"result": "hi"}"#).unwrap_err();
        assert!(matches!(err, VoxBridgeError::Codec(_)));
    }

    #[test]
    fn test_garbage_body_is_rejected() {
        assert!(decode::<SynthesisResponse>(b"\x00\xffnot json").is_err());
    }

    #[test]
    fn test_bad_base64_is_codec_error() {
        let resp = SynthesisResponse {
            audio_data: "***".into(),
            hash: CorrelationToken::from("t4"),
        };
        assert!(matches!(resp.audio_bytes(), Err(VoxBridgeError::Codec(_))));
    }
}
