//! Speech recognition over HTTP (Baidu `pro_api` request shape).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use voxbridge_core::config::RecognitionConfig;

use crate::RecognitionEndpoint;

#[derive(Debug, Serialize)]
struct RecognitionCall<'a> {
    format: &'a str,
    rate: u32,
    channel: u16,
    cuid: &'a str,
    token: &'a str,
    dev_pid: u32,
    speech: &'a str,
    len: u64,
}

#[derive(Debug, Deserialize)]
struct RecognitionReply {
    #[serde(default)]
    err_no: i64,
    #[serde(default)]
    err_msg: String,
    #[serde(default)]
    result: Vec<String>,
    #[serde(default)]
    sn: Option<String>,
}

pub struct HttpRecognitionEndpoint {
    client: reqwest::Client,
    config: RecognitionConfig,
    token: String,
}

impl HttpRecognitionEndpoint {
    pub fn new(config: RecognitionConfig) -> Result<Self> {
        let token = config.resolve_token().unwrap_or_default();
        if token.is_empty() {
            tracing::warn!("No recognition access token configured");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building recognition HTTP client")?;
        Ok(Self {
            client,
            config,
            token,
        })
    }
}

#[async_trait]
impl RecognitionEndpoint for HttpRecognitionEndpoint {
    async fn recognize(&self, speech_base64: &str, len: u64) -> Result<String> {
        let call = RecognitionCall {
            format: &self.config.format,
            rate: self.config.sample_rate,
            channel: self.config.channels,
            cuid: &self.config.speaker_id,
            token: &self.token,
            dev_pid: self.config.device_profile_id,
            speech: speech_base64,
            len,
        };

        debug!(url = %self.config.url, len, "Sending audio for recognition");

        let resp = self.client.post(&self.config.url).json(&call).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Recognition API error {status}: {body}");
        }

        let reply: RecognitionReply = resp
            .json()
            .await
            .context("decoding recognition reply")?;

        if reply.err_no != 0 {
            anyhow::bail!(
                "Recognition failed (err_no {}): {}",
                reply.err_no,
                reply.err_msg
            );
        }

        debug!(sn = ?reply.sn, candidates = reply.result.len(), "Recognition reply");

        reply
            .result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Recognition returned no results"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/pro_api")
    }

    fn endpoint(url: String) -> HttpRecognitionEndpoint {
        HttpRecognitionEndpoint::new(RecognitionConfig {
            url,
            token: Some("secret".into()),
            ..RecognitionConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_shape_and_first_result() {
        let app = Router::new().route(
            "/pro_api",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["format"], "wav");
                assert_eq!(body["rate"], 16000);
                assert_eq!(body["channel"], 1);
                assert_eq!(body["token"], "secret");
                assert_eq!(body["dev_pid"], 80001);
                assert_eq!(body["speech"], "AAEC");
                assert_eq!(body["len"], 3);
                Json(json!({
                    "corpus_no": "1",
                    "err_msg": "success.",
                    "err_no": 0,
                    "result": ["hello world", "hello word"],
                    "sn": "abc"
                }))
            }),
        );
        let url = serve(app).await;

        let text = endpoint(url).recognize("AAEC", 3).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_error_number_is_failure() {
        let app = Router::new().route(
            "/pro_api",
            post(|| async {
                Json(json!({"err_no": 3302, "err_msg": "authentication failed", "result": []}))
            }),
        );
        let url = serve(app).await;

        let err = endpoint(url).recognize("AAEC", 3).await.unwrap_err();
        assert!(err.to_string().contains("3302"));
    }

    #[tokio::test]
    async fn test_empty_result_is_failure() {
        let app = Router::new().route("/pro_api", post(|| async { Json(json!({"err_no": 0})) }));
        let url = serve(app).await;

        assert!(endpoint(url).recognize("AAEC", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_http_status_is_failure() {
        let app = Router::new().route(
            "/pro_api",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let url = serve(app).await;

        let err = endpoint(url).recognize("AAEC", 3).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
