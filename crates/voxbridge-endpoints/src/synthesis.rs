//! Text-to-speech over HTTP. The service answers a `{text, text_language}`
//! POST with the encoded audio as the response body.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use voxbridge_core::config::SynthesisConfig;

use crate::SynthesisEndpoint;

pub struct HttpSynthesisEndpoint {
    client: reqwest::Client,
    url: String,
    language: String,
}

impl HttpSynthesisEndpoint {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building synthesis HTTP client")?;
        Ok(Self {
            client,
            url: config.url.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl SynthesisEndpoint for HttpSynthesisEndpoint {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        debug!(url = %self.url, text_len = text.len(), "Requesting synthesis");

        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "text": text,
                "text_language": self.language,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Synthesis API error {status}: {body}");
        }

        let audio = resp.bytes().await?;
        Ok(audio.to_vec())
    }
}
