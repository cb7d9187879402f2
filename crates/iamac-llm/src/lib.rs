//! LLM Gateway — the SINGLE choke-point for all chat-completions calls.
//!
//! # Architecture
//!
//! `LlmGateway` owns a private [`LlmBackend`]. The only way to reach a
//! concrete backend (the live streaming HTTP client, or the deterministic
//! fake behind `testkit`) is through the gateway's public methods, which
//! resolve the effective model class (tier/phase gating) before ever
//! constructing a request.
//!
//! ```text
//! Caller
//!   └──► LlmGateway::generate_patch / generate_proposals / convert_nl_to_spec
//!            ├── model_for_phase (tier gate: L3 downgrades to L2 off MAX/ENTERPRISE)
//!            └── StreamingChat::run  ◄── only reached after gating
//!                     └── LlmBackend::stream_chat
//! ```
//!
//! Streaming calls run under a mandatory cancellation discipline: the body
//! is spawned as its own `tokio::task` so a caller's cancellation can
//! `abort()` it outright (closing the connection immediately, rather than
//! waiting on a cooperative check), and every chunk drives a heartbeat.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use iamac_schemas::{model_for_phase, Phase, Tier};
use tokio_util::sync::CancellationToken;

#[cfg(feature = "testkit")]
pub mod fake;
pub mod live;

/// A single chat-completions request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: &'static str,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

pub type ChunkStream = std::pin::Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Pluggable backend for chat-completions. The live backend streams from a
/// LiteLLM-compatible HTTP endpoint; the fake backend (behind `testkit`)
/// yields a fixed sequence of chunks for deterministic tests.
#[async_trait::async_trait]
pub trait LlmBackend: Send + Sync {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ChunkStream>;
}

/// Drives one streaming call under the cancellation/heartbeat discipline.
///
/// The stream is consumed inside a spawned task; `cancel` being triggered
/// causes the task to be aborted rather than waited out, so a connection is
/// torn down immediately instead of draining to completion.
pub struct StreamingChat {
    backend: Arc<dyn LlmBackend>,
}

impl StreamingChat {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    pub async fn run(
        &self,
        req: ChatRequest,
        cancel: CancellationToken,
        mut heartbeat: impl FnMut() + Send + 'static,
    ) -> Result<String> {
        let backend = self.backend.clone();
        let handle = tokio::spawn(async move {
            let mut stream = backend.stream_chat(req).await?;
            let mut full_text = String::new();
            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    return Ok(full_text);
                }
                heartbeat();
                full_text.push_str(&chunk?);
            }
            Ok::<_, anyhow::Error>(full_text)
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_cancelled() => {
                anyhow::bail!("llm stream task was aborted")
            }
            Err(join_err) => Err(join_err).context("llm stream task panicked"),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmGateway
// ---------------------------------------------------------------------------

pub struct LlmGateway {
    chat: StreamingChat,
}

#[derive(Debug, Clone)]
pub struct PatchGenOutcome {
    pub model_class: &'static str,
    pub effective_phase: Phase,
    pub raw_text: String,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            chat: StreamingChat::new(backend),
        }
    }

    /// `generate_patch` per the 30-minute/90-second heartbeat contract:
    /// resolves model class by phase+tier, then streams the completion.
    pub async fn generate_patch(
        &self,
        job_id: &str,
        attempt_number: u32,
        phase: Phase,
        tier: Tier,
        is_deep_fix: bool,
        cancel: CancellationToken,
        heartbeat: impl FnMut() + Send + 'static,
    ) -> Result<PatchGenOutcome> {
        let (model, effective_phase) = model_for_phase(phase, tier);

        let system = "You are IAMA, a senior refactoring engineer. \
             Produce ONLY patch_edit_schema operations (symbolic_replace, exact_search_replace, \
             insert_after_symbol, delete_symbol, create_file, delete_file). \
             NEVER produce line-number unified diffs."
            .to_string();
        let user = format!(
            "Generate patch for job {job_id} attempt {attempt_number} (deep_fix={is_deep_fix})."
        );

        let raw_text = self
            .chat
            .run(
                ChatRequest {
                    model,
                    system,
                    user,
                    max_tokens: 30_000,
                },
                cancel,
                heartbeat,
            )
            .await?;

        Ok(PatchGenOutcome {
            model_class: model,
            effective_phase,
            raw_text,
        })
    }

    /// `generate_proposals` / `convert_nl_to_spec` / `generate_tests` share
    /// the same streaming discipline but each has a fixed model class (no
    /// phase/tier escalation applies to the prologue) — the caller picks
    /// `model` from `"iama-router-l1"`/`"iama-router-l2"` per §4.2's table.
    pub async fn generate_text(
        &self,
        model: &'static str,
        system: String,
        user: String,
        max_tokens: u32,
        cancel: CancellationToken,
        heartbeat: impl FnMut() + Send + 'static,
    ) -> Result<String> {
        self.chat
            .run(
                ChatRequest {
                    model,
                    system,
                    user,
                    max_tokens,
                },
                cancel,
                heartbeat,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    struct FixedChunksBackend {
        chunks: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl LlmBackend for FixedChunksBackend {
        async fn stream_chat(&self, _req: ChatRequest) -> Result<ChunkStream> {
            let items: Vec<Result<String>> = self
                .chunks
                .iter()
                .map(|c| Ok(c.to_string()))
                .collect();
            Ok(Box::pin(stream::iter(items)))
        }
    }

    #[tokio::test]
    async fn generate_patch_downgrades_l3_for_free_tier() {
        let backend = Arc::new(FixedChunksBackend {
            chunks: vec!["hello", " world"],
        });
        let gateway = LlmGateway::new(backend);

        let outcome = gateway
            .generate_patch(
                "job_1",
                1,
                3,
                Tier::Free,
                false,
                CancellationToken::new(),
                || {},
            )
            .await
            .expect("stream succeeds");

        assert_eq!(outcome.model_class, "iama-router-l2");
        assert_eq!(outcome.effective_phase, 2);
        assert_eq!(outcome.raw_text, "hello world");
    }

    #[tokio::test]
    async fn generate_patch_keeps_l3_for_max_tier() {
        let backend = Arc::new(FixedChunksBackend { chunks: vec!["ok"] });
        let gateway = LlmGateway::new(backend);

        let outcome = gateway
            .generate_patch(
                "job_2",
                1,
                3,
                Tier::Max,
                false,
                CancellationToken::new(),
                || {},
            )
            .await
            .expect("stream succeeds");

        assert_eq!(outcome.model_class, "iama-router-l3");
        assert_eq!(outcome.effective_phase, 3);
    }

    #[tokio::test]
    async fn cancellation_stops_accumulation_without_erroring() {
        struct SlowBackend;

        #[async_trait::async_trait]
        impl LlmBackend for SlowBackend {
            async fn stream_chat(&self, _req: ChatRequest) -> Result<ChunkStream> {
                let items: Vec<Result<String>> = vec![Ok("a".to_string()), Ok("b".to_string())];
                Ok(Box::pin(stream::iter(items)))
            }
        }

        let backend = Arc::new(SlowBackend);
        let chat = StreamingChat::new(backend);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = chat
            .run(
                ChatRequest {
                    model: "iama-router-l1",
                    system: String::new(),
                    user: String::new(),
                    max_tokens: 10,
                },
                cancel,
                || {},
            )
            .await
            .expect("already-cancelled run returns the partial text, not an error");
        assert_eq!(result, "");
    }
}
