//! Live backend: streams chat-completions from a LiteLLM-compatible HTTP
//! endpoint via `reqwest`'s byte stream.

use anyhow::{Context, Result};
use futures_util::StreamExt;

use crate::{ChatRequest, ChunkStream, LlmBackend};

pub struct ReqwestLlmBackend {
    client: reqwest::Client,
    api_base: String,
}

impl ReqwestLlmBackend {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
        }
    }
}

#[async_trait::async_trait]
impl LlmBackend for ReqwestLlmBackend {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ChunkStream> {
        let payload = serde_json::json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user},
            ],
            "stream": true,
            "max_tokens": req.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.api_base))
            .json(&payload)
            .send()
            .await
            .context("litellm request failed")?
            .error_for_status()
            .context("litellm returned an error status")?;

        let bytes_stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .context("litellm stream chunk was not valid bytes")
        });

        Ok(Box::pin(bytes_stream))
    }
}
