// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider registry: routes a model id to the provider that serves it.
//!
//! Resolution order:
//! 1. the model index built from each provider's `list_models` at init;
//! 2. prefix heuristics (`claude-` → anthropic, `gpt-`/`o1`/`o3`/`o4` →
//!    openai, `gemini-` → google, `<namespace>/<name>` → openrouter);
//! 3. everything else → ollama (local models have arbitrary names).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::provider::{ChunkStream, Provider};
use crate::types::{ChatChunk, ChatRequest, ChatResponse};

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    model_index: HashMap<String, String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Build the model → provider index from every registered provider's
    /// model list.  Providers that fail to list (endpoint down) keep working
    /// through the heuristics.
    pub async fn init_index(&mut self) {
        for (id, provider) in &self.providers {
            match provider.list_models().await {
                Ok(models) => {
                    for m in models {
                        self.model_index.insert(m.id, id.clone());
                    }
                }
                Err(e) => warn!(provider = %id, "list_models failed: {e}"),
            }
        }
        debug!(models = self.model_index.len(), "provider index built");
    }

    pub fn provider(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }

    /// Resolve the provider for a model id.
    pub fn resolve(&self, model: &str) -> Option<Arc<dyn Provider>> {
        if let Some(provider_id) = self.model_index.get(model) {
            return self.provider(provider_id);
        }
        self.provider(heuristic_provider(model))
    }

    /// Non-streaming chat on the provider that serves `req.model`.
    pub async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let provider = self
            .resolve(&req.model)
            .with_context(|| format!("no provider for model {}", req.model))?;
        if !provider.is_available().await {
            bail!("provider {} unavailable for model {}", provider.id(), req.model);
        }
        provider.chat(req).await
    }

    pub async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream> {
        let provider = self
            .resolve(&req.model)
            .with_context(|| format!("no provider for model {}", req.model))?;
        if !provider.is_available().await {
            bail!("provider {} unavailable for model {}", provider.id(), req.model);
        }
        provider.chat_stream(req).await
    }

    /// Try the request's model, then each fallback in order, continuing on
    /// any error.  Fails only when every attempt failed.
    pub async fn chat_with_failover(
        &self,
        req: ChatRequest,
        fallback_models: &[String],
    ) -> anyhow::Result<ChatResponse> {
        let mut last_err = None;
        for model in std::iter::once(&req.model).chain(fallback_models.iter()) {
            let attempt = req.clone().with_model(model.clone());
            match self.chat(attempt).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(model = %model, "chat attempt failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no models in failover chain"))
            .context("all models in failover chain failed"))
    }

    /// Streaming failover.  Each candidate's stream is probed on its first
    /// chunk: a call error or an immediate error chunk abandons the stream
    /// (dropping it releases the connection) and moves to the next model.
    /// Returns the model that answered and its stream with the probed chunk
    /// stitched back on.
    pub async fn chat_stream_with_failover(
        &self,
        req: ChatRequest,
        fallback_models: &[String],
    ) -> anyhow::Result<(String, ChunkStream)> {
        let mut last_err: Option<anyhow::Error> = None;
        for model in std::iter::once(&req.model).chain(fallback_models.iter()) {
            let attempt = req.clone().with_model(model.clone());
            let mut stream = match self.chat_stream(attempt).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(model = %model, "stream open failed: {e}");
                    last_err = Some(e);
                    continue;
                }
            };
            match stream.next().await {
                Some(Ok(ChatChunk::Error(e))) => {
                    warn!(model = %model, "stream failed on first chunk: {e}");
                    last_err = Some(anyhow::anyhow!(e));
                    continue;
                }
                Some(Err(e)) => {
                    warn!(model = %model, "stream failed on first chunk: {e}");
                    last_err = Some(e);
                    continue;
                }
                Some(Ok(first)) => {
                    let stitched: ChunkStream =
                        Box::pin(futures::stream::once(async move { Ok(first) }).chain(stream));
                    return Ok((model.clone(), stitched));
                }
                None => {
                    last_err = Some(anyhow::anyhow!("empty stream from {model}"));
                    continue;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("no models in failover chain"))
            .context("all models in failover chain failed"))
    }
}

fn heuristic_provider(model: &str) -> &'static str {
    if model.starts_with("claude-") {
        "anthropic"
    } else if model.starts_with("gpt-")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
    {
        "openai"
    } else if model.starts_with("gemini-") {
        "google"
    } else if model.contains('/') {
        "openrouter"
    } else {
        "ollama"
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{text_turn, ScriptedProvider};
    use crate::provider::collect_stream;
    use crate::types::StopReason;

    #[test]
    fn heuristics_cover_the_prefix_rules() {
        assert_eq!(heuristic_provider("claude-sonnet-4-5"), "anthropic");
        assert_eq!(heuristic_provider("gpt-4o"), "openai");
        assert_eq!(heuristic_provider("o1-preview"), "openai");
        assert_eq!(heuristic_provider("o3"), "openai");
        assert_eq!(heuristic_provider("o4-mini"), "openai");
        assert_eq!(heuristic_provider("gemini-2.5-pro"), "google");
        assert_eq!(heuristic_provider("meta-llama/llama-3.3-70b"), "openrouter");
        assert_eq!(heuristic_provider("qwen2.5-coder"), "ollama");
    }

    #[tokio::test]
    async fn index_resolution_beats_heuristics() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(ScriptedProvider::always_text("x")));
        reg.init_index().await;
        // "mock-model" has no heuristic prefix, but the index routes it.
        let p = reg.resolve("mock-model").unwrap();
        assert_eq!(p.id(), "mock");
    }

    #[tokio::test]
    async fn chat_rejects_unknown_model() {
        let reg = ProviderRegistry::new();
        let err = reg
            .chat(ChatRequest::default().with_model("claude-sonnet-4-5"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no provider"));
    }

    #[tokio::test]
    async fn failover_tries_models_in_order() {
        let mut reg = ProviderRegistry::new();
        // First script errors at call time, second answers.
        reg.register(Arc::new(ScriptedProvider::failing_first(
            "upstream 500",
            vec![text_turn("recovered")],
        )));
        reg.init_index().await;

        let req = ChatRequest::default().with_model("mock-model");
        let resp = reg
            .chat_with_failover(req, &["mock-model".to_string()])
            .await
            .unwrap();
        assert_eq!(resp.text(), "recovered");
        assert_eq!(resp.model, "mock-model");
    }

    #[tokio::test]
    async fn failover_fails_only_when_all_models_fail() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(ScriptedProvider::failing_first(
            "boom",
            vec![],
        )));
        reg.init_index().await;
        // Single model, single failing script ("[script exhausted]" would
        // answer the second call, so only pass one attempt).
        let err = reg
            .chat_with_failover(ChatRequest::default().with_model("mock-model"), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failover"));
    }

    #[tokio::test]
    async fn stream_failover_abandons_error_first_stream() {
        let mut reg = ProviderRegistry::new();
        reg.register(Arc::new(ScriptedProvider::new(vec![
            vec![ChatChunk::Error("500 from vendor".into())],
            text_turn("second model wins"),
        ])));
        reg.init_index().await;

        let (model, stream) = reg
            .chat_stream_with_failover(
                ChatRequest::default().with_model("mock-model"),
                &["mock-model".to_string()],
            )
            .await
            .unwrap();
        let resp = collect_stream(&model, stream).await.unwrap();
        assert_eq!(resp.text(), "second model wins");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
    }
}
