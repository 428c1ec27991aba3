//! Summarization and embedding models behind an OpenAI-compatible HTTP API.

use crate::config::LlmConfig;
use crate::error::UpstreamError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the raw JSON text produced under `schema`.
    async fn summarize(&self, model: &str, prompt: &str, transcript: &str, schema: &Value) -> Result<String, UpstreamError>;
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, UpstreamError>;
}

pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(Duration::from_millis(cfg.request_timeout_ms)).build()?;
        let api_key = cfg.api_key_env.as_deref().and_then(|name| std::env::var(name).ok());
        Ok(Self { http, endpoint: cfg.endpoint.trim_end_matches('/').to_string(), api_key })
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, UpstreamError> {
        let mut req = self.http.post(format!("{}{}", self.endpoint, path)).json(&body);
        if let Some(key) = &self.api_key { req = req.bearer_auth(key); }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let txt = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(status, format!("{} -> {}", path, txt)));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn summarize(&self, model: &str, prompt: &str, transcript: &str, schema: &Value) -> Result<String, UpstreamError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": prompt},
                {"role": "user", "content": transcript}
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {"name": "memory_summary", "schema": schema, "strict": true}
            }
        });
        let v = self.post("/chat/completions", body).await?;
        v.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| UpstreamError::Protocol("completion without message content".into()))
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let v = self.post("/embeddings", json!({"model": model, "input": text})).await?;
        let arr = v
            .pointer("/data/0/embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| UpstreamError::Protocol("embedding response without data".into()))?;
        Ok(arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
    }
}
