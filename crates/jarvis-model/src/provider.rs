// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use jarvis_proto::{ContentBlock, Usage};

use crate::types::{ChatChunk, ChatRequest, ChatResponse, ModelInfo, StopReason};

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<ChatChunk>> + Send>>;

/// Uniform streaming chat surface over one LLM vendor.
///
/// The stream contract: chunks arrive in order, the stream is finite and
/// single-pass, and dropping it cancels the underlying request and releases
/// the connection.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider id used by the registry (e.g. `"anthropic"`).
    fn id(&self) -> &str;

    /// Human-readable name for status display.
    fn name(&self) -> &str;

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Whether the provider can currently serve requests (credentials
    /// present, endpoint configured).
    async fn is_available(&self) -> bool;

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream>;

    /// Non-streaming chat.  The default implementation drains the stream and
    /// assembles the response; providers with a cheaper native path may
    /// override.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let model = req.model.clone();
        let stream = self.chat_stream(req).await?;
        collect_stream(&model, stream).await
    }
}

/// Assemble a [`ChatResponse`] from a chunk stream.
pub async fn collect_stream(model: &str, mut stream: ChunkStream) -> anyhow::Result<ChatResponse> {
    let mut text = String::new();
    // Keyed by tool-call index so interleaved deltas cannot cross wires.
    let mut tool_uses: BTreeMap<u32, ContentBlock> = BTreeMap::new();
    let mut stop_reason = StopReason::EndTurn;
    let mut usage = Usage::default();

    while let Some(chunk) = stream.next().await {
        match chunk? {
            ChatChunk::TextDelta(delta) => text.push_str(&delta),
            ChatChunk::ToolUseStart { .. } | ChatChunk::ToolUseDelta { .. } => {}
            ChatChunk::ToolUseEnd {
                index,
                id,
                name,
                arguments,
            } => {
                let input = serde_json::from_str(&arguments)
                    .unwrap_or(serde_json::Value::Object(Default::default()));
                tool_uses.insert(index, ContentBlock::tool_use(id, name, input));
            }
            ChatChunk::MessageEnd {
                stop_reason: sr,
                usage: u,
            } => {
                stop_reason = sr;
                usage = u;
            }
            ChatChunk::Error(e) => anyhow::bail!("provider stream error: {e}"),
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    content.extend(tool_uses.into_values());
    Ok(ChatResponse {
        model: model.to_string(),
        content,
        stop_reason,
        usage,
    })
}

/// Per-index accumulation state for streamed tool calls.  Drivers whose wire
/// protocol has no explicit block-end marker flush this at end of message.
#[derive(Debug, Default)]
pub struct ToolUseAccumulator {
    pending: BTreeMap<u32, PendingToolUse>,
}

#[derive(Debug, Default)]
struct PendingToolUse {
    id: String,
    name: String,
    arguments: String,
}

impl ToolUseAccumulator {
    pub fn start(&mut self, index: u32, id: &str, name: &str) -> ChatChunk {
        let slot = self.pending.entry(index).or_default();
        if !id.is_empty() {
            slot.id = id.to_string();
        }
        if !name.is_empty() {
            slot.name = name.to_string();
        }
        ChatChunk::ToolUseStart {
            index,
            id: slot.id.clone(),
            name: slot.name.clone(),
        }
    }

    pub fn delta(&mut self, index: u32, fragment: &str) -> ChatChunk {
        let slot = self.pending.entry(index).or_default();
        slot.arguments.push_str(fragment);
        ChatChunk::ToolUseDelta {
            index,
            arguments: fragment.to_string(),
        }
    }

    /// Close one block (protocols with explicit block ends).
    pub fn end(&mut self, index: u32) -> Option<ChatChunk> {
        self.pending.remove(&index).map(|p| ChatChunk::ToolUseEnd {
            index,
            id: p.id,
            name: p.name,
            arguments: p.arguments,
        })
    }

    /// Close every open block, ordered by index (protocols that only signal
    /// the end of the whole message).
    pub fn finish(&mut self) -> Vec<ChatChunk> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(index, p)| ChatChunk::ToolUseEnd {
                index,
                id: p.id,
                name: p.name,
                arguments: p.arguments,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(items: Vec<ChatChunk>) -> ChunkStream {
        let items: Vec<anyhow::Result<ChatChunk>> = items.into_iter().map(Ok).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn collect_assembles_text_and_tools() {
        let s = chunks(vec![
            ChatChunk::TextDelta("he".into()),
            ChatChunk::TextDelta("llo".into()),
            ChatChunk::ToolUseEnd {
                index: 0,
                id: "u1".into(),
                name: "calc".into(),
                arguments: r#"{"expr":"2+2"}"#.into(),
            },
            ChatChunk::MessageEnd {
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 4,
                    cache_tokens: 0,
                    total_tokens: 7,
                },
            },
        ]);
        let r = collect_stream("m", s).await.unwrap();
        assert_eq!(r.text(), "hello");
        assert_eq!(r.stop_reason, StopReason::ToolUse);
        assert_eq!(r.usage.total_tokens, 7);
        let uses: Vec<_> = r
            .content
            .iter()
            .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
            .collect();
        assert_eq!(uses.len(), 1);
    }

    #[tokio::test]
    async fn collect_surfaces_stream_error() {
        let s = chunks(vec![
            ChatChunk::TextDelta("partial".into()),
            ChatChunk::Error("boom".into()),
        ]);
        assert!(collect_stream("m", s).await.is_err());
    }

    #[tokio::test]
    async fn collect_tolerates_malformed_tool_arguments() {
        let s = chunks(vec![
            ChatChunk::ToolUseEnd {
                index: 0,
                id: "u1".into(),
                name: "t".into(),
                arguments: "{not json".into(),
            },
            ChatChunk::MessageEnd {
                stop_reason: StopReason::ToolUse,
                usage: Usage::default(),
            },
        ]);
        let r = collect_stream("m", s).await.unwrap();
        match &r.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert!(input.is_object(), "malformed args become an empty object");
            }
            _ => panic!("wrong block"),
        }
    }

    #[test]
    fn accumulator_reassembles_interleaved_deltas_by_index() {
        let mut acc = ToolUseAccumulator::default();
        acc.start(0, "u0", "alpha");
        acc.start(1, "u1", "beta");
        acc.delta(0, r#"{"a":"#);
        acc.delta(1, r#"{"b":"#);
        acc.delta(0, "1}");
        acc.delta(1, "2}");
        let done = acc.finish();
        assert_eq!(done.len(), 2);
        match &done[0] {
            ChatChunk::ToolUseEnd { name, arguments, .. } => {
                assert_eq!(name, "alpha");
                assert_eq!(arguments, r#"{"a":1}"#);
            }
            _ => panic!("wrong chunk"),
        }
        match &done[1] {
            ChatChunk::ToolUseEnd { name, arguments, .. } => {
                assert_eq!(name, "beta");
                assert_eq!(arguments, r#"{"b":2}"#);
            }
            _ => panic!("wrong chunk"),
        }
    }

    #[test]
    fn accumulator_explicit_end_removes_block() {
        let mut acc = ToolUseAccumulator::default();
        acc.start(0, "u0", "t");
        acc.delta(0, "{}");
        let end = acc.end(0).unwrap();
        assert!(matches!(end, ChatChunk::ToolUseEnd { .. }));
        assert!(acc.is_empty());
        assert!(acc.end(0).is_none());
    }
}
