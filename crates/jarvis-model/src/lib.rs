// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming LLM provider abstraction.
//!
//! One [`Provider`] trait over every vendor, a canonical [`ChatChunk`] stream
//! decoded from each vendor's native SSE protocol, and a
//! [`ProviderRegistry`] that routes model ids and drives the failover chain.

mod anthropic;
mod catalog;
mod google;
pub mod mock;
mod openai_compat;
mod provider;
mod registry;
mod types;
mod usage;

pub use anthropic::AnthropicProvider;
pub use catalog::{for_provider, lookup, static_catalog};
pub use google::GoogleProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{collect_stream, ChunkStream, Provider, ToolUseAccumulator};
pub use registry::ProviderRegistry;
pub use types::{ChatChunk, ChatRequest, ChatResponse, ModelInfo, StopReason, ToolSpec};
pub use usage::UsageAccumulator;

/// Registry pre-populated with every driver, keyed from the environment.
pub async fn registry_from_env() -> ProviderRegistry {
    use std::sync::Arc;
    let mut reg = ProviderRegistry::new();
    reg.register(Arc::new(AnthropicProvider::from_env()));
    reg.register(Arc::new(OpenAiCompatProvider::openai(
        std::env::var("OPENAI_API_KEY").ok(),
    )));
    reg.register(Arc::new(OpenAiCompatProvider::openrouter(
        std::env::var("OPENROUTER_API_KEY").ok(),
    )));
    reg.register(Arc::new(OpenAiCompatProvider::ollama(
        std::env::var("OLLAMA_BASE_URL").ok(),
    )));
    reg.register(Arc::new(GoogleProvider::from_env()));
    reg.init_index().await;
    reg
}
