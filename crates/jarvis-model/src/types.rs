// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jarvis_proto::{ContentBlock, Message, Usage};

/// A tool schema handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

/// Request sent to a provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Model id, resolved through the provider registry.
    pub model: String,
    pub messages: Vec<Message>,
    /// System preamble, separated out because several vendor APIs take it
    /// out-of-band rather than as a conversation turn.
    pub system: Option<String>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Why the model stopped emitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// One streamed chunk, decoded from the provider's native wire protocol.
///
/// Tool-call chunks are keyed by the provider's parallel-tool-call `index` so
/// interleaved argument fragments can be reassembled; the terminal
/// [`ChatChunk::ToolUseEnd`] always carries the full concatenated argument
/// string, so consumers that only care about completed calls can ignore the
/// start/delta chunks entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatChunk {
    TextDelta(String),
    ToolUseStart {
        index: u32,
        id: String,
        name: String,
    },
    ToolUseDelta {
        index: u32,
        arguments: String,
    },
    ToolUseEnd {
        index: u32,
        id: String,
        name: String,
        /// Complete JSON argument string for this call.
        arguments: String,
    },
    MessageEnd {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Terminal stream error; no further chunks follow.
    Error(String),
}

/// Non-streaming response, assembled from the chunk stream.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The model that actually answered (relevant after failover).
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl ChatResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Catalog metadata for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    /// Model identifier (e.g. `claude-sonnet-4-5`, `gpt-4o`).
    pub id: String,
    pub name: String,
    /// Provider id the model routes to.
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// USD per input token, when the rate is known.
    #[serde(default)]
    pub cost_per_input_token: Option<f64>,
    /// USD per output token, when the rate is known.
    #[serde(default)]
    pub cost_per_output_token: Option<f64>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
