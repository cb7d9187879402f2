//! Deterministic fake backend for tests: lets gateway/workflow logic be
//! exercised without a live LiteLLM endpoint.

use anyhow::Result;
use futures_util::stream;

use crate::{ChatRequest, ChunkStream, LlmBackend};

/// Always yields the same fixed chunk sequence regardless of the request.
pub struct FakeLlmBackend {
    chunks: Vec<String>,
}

impl FakeLlmBackend {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks }
    }

    /// Convenience fake that emits one chunk containing a single
    /// `exact_search_replace` patch-edit-schema operation.
    pub fn single_patch_op() -> Self {
        Self::new(vec![serde_json::json!({
            "op": "exact_search_replace",
            "search": "",
            "replace": "",
            "max_occurrences": 1,
        })
        .to_string()])
    }
}

#[async_trait::async_trait]
impl LlmBackend for FakeLlmBackend {
    async fn stream_chat(&self, _req: ChatRequest) -> Result<ChunkStream> {
        let items: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}
