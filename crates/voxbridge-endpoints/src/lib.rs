//! External speech endpoints called by the relay workers.
//!
//! Both endpoints are plain HTTP services. The traits exist so workers can
//! be driven by test doubles instead of a live service.

use async_trait::async_trait;

pub mod audio;
pub mod recognition;
pub mod synthesis;

pub use recognition::HttpRecognitionEndpoint;
pub use synthesis::HttpSynthesisEndpoint;

/// Turns speech into text.
#[async_trait]
pub trait RecognitionEndpoint: Send + Sync + 'static {
    /// `speech_base64` is the base64 form of the raw audio, `len` the length
    /// of the raw audio in bytes.
    async fn recognize(&self, speech_base64: &str, len: u64) -> anyhow::Result<String>;
}

/// Turns text into encoded audio.
#[async_trait]
pub trait SynthesisEndpoint: Send + Sync + 'static {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}
