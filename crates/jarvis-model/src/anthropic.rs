// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use jarvis_proto::{ContentBlock, Message, MessageContent, Role, ToolResultContent, Usage};

use crate::catalog;
use crate::provider::{ChunkStream, Provider, ToolUseAccumulator};
use crate::types::{ChatChunk, ChatRequest, ModelInfo, StopReason};

const STREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("ANTHROPIC_API_KEY").ok(), None)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn name(&self) -> &str {
        "Anthropic"
    }

    /// Anthropic exposes no metadata-rich list endpoint; serve the catalog.
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::for_provider("anthropic"))
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;

        let messages = build_messages(&req.messages);
        let max_tokens = req.max_output_tokens.unwrap_or(4096);

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }
        if !req.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(req.stop_sequences);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(model = %req.model, "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .timeout(STREAM_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {text}");
        }

        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward; only complete lines are parsed.
        let byte_stream = resp.bytes_stream();
        let chunk_stream = byte_stream
            .scan(
                (String::new(), DecodeState::default()),
                |(buf, state), chunk| {
                    let text = match chunk {
                        Ok(b) => String::from_utf8_lossy(&b).to_string(),
                        Err(e) => {
                            return futures::future::ready(Some(vec![Ok(ChatChunk::Error(
                                e.to_string(),
                            ))]));
                        }
                    };
                    buf.push_str(&text);
                    let mut out = Vec::new();
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        if let Some(data) = line.strip_prefix("data: ") {
                            if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                                out.extend(state.feed(&v).into_iter().map(Ok));
                            }
                        }
                    }
                    futures::future::ready(Some(out))
                },
            )
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Streaming decode state: tool-call accumulation plus usage gathered across
/// `message_start` and `message_delta` events.
#[derive(Default)]
struct DecodeState {
    acc: ToolUseAccumulator,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl DecodeState {
    fn feed(&mut self, v: &Value) -> Vec<ChatChunk> {
        match v["type"].as_str().unwrap_or("") {
            "message_start" => {
                if let Some(usage) = v["message"].get("usage") {
                    self.usage.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0);
                    self.usage.cache_tokens =
                        usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
                }
                vec![]
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let id = block["id"].as_str().unwrap_or("");
                    let name = block["name"].as_str().unwrap_or("");
                    vec![self.acc.start(index, id, name)]
                } else {
                    vec![]
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or("");
                        if text.is_empty() {
                            vec![]
                        } else {
                            vec![ChatChunk::TextDelta(text.to_string())]
                        }
                    }
                    "input_json_delta" => {
                        let partial = delta["partial_json"].as_str().unwrap_or("");
                        vec![self.acc.delta(index, partial)]
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                self.acc.end(index).into_iter().collect()
            }
            "message_delta" => {
                if let Some(sr) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(match sr {
                        "tool_use" => StopReason::ToolUse,
                        "max_tokens" => StopReason::MaxTokens,
                        "stop_sequence" => StopReason::StopSequence,
                        _ => StopReason::EndTurn,
                    });
                }
                if let Some(usage) = v.get("usage") {
                    self.usage.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0);
                }
                vec![]
            }
            "message_stop" => {
                // Flush any tool blocks that never saw an explicit stop, then
                // terminate the canonical stream.
                let mut out = self.acc.finish();
                self.usage.total_tokens = self.usage.input_tokens
                    + self.usage.output_tokens
                    + self.usage.cache_tokens;
                out.push(ChatChunk::MessageEnd {
                    stop_reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
                    usage: self.usage,
                });
                out
            }
            "error" => {
                let msg = v["error"]["message"].as_str().unwrap_or("unknown error");
                vec![ChatChunk::Error(msg.to_string())]
            }
            _ => vec![],
        }
    }
}

/// Convert fabric messages to the Anthropic wire format.  System turns are
/// folded into the out-of-band `system` field by the caller; here they are
/// skipped defensively.
fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        let role = match m.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        match &m.content {
            MessageContent::Text(t) => out.push(json!({ "role": role, "content": t })),
            MessageContent::Blocks(blocks) => {
                let content: Vec<Value> = blocks.iter().map(block_to_wire).collect();
                out.push(json!({ "role": role, "content": content }));
            }
        }
    }
    out
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::Image { data, media_type } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data }
        }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let content_value = match content {
                ToolResultContent::Text(t) => json!(t),
                ToolResultContent::Blocks(blocks) => {
                    json!(blocks.iter().map(block_to_wire).collect::<Vec<_>>())
                }
            };
            json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content_value,
                "is_error": is_error,
            })
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(state: &mut DecodeState, events: &[Value]) -> Vec<ChatChunk> {
        events.iter().flat_map(|e| state.feed(e)).collect()
    }

    #[test]
    fn text_stream_decodes_to_deltas_and_end() {
        let mut state = DecodeState::default();
        let chunks = feed_all(
            &mut state,
            &[
                json!({"type":"message_start","message":{"usage":{"input_tokens":12}}}),
                json!({"type":"content_block_start","index":0,
                       "content_block":{"type":"text"}}),
                json!({"type":"content_block_delta","index":0,
                       "delta":{"type":"text_delta","text":"Hel"}}),
                json!({"type":"content_block_delta","index":0,
                       "delta":{"type":"text_delta","text":"lo"}}),
                json!({"type":"content_block_stop","index":0}),
                json!({"type":"message_delta","delta":{"stop_reason":"end_turn"},
                       "usage":{"output_tokens":2}}),
                json!({"type":"message_stop"}),
            ],
        );
        assert_eq!(chunks[0], ChatChunk::TextDelta("Hel".into()));
        assert_eq!(chunks[1], ChatChunk::TextDelta("lo".into()));
        match chunks.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, usage } => {
                assert_eq!(*stop_reason, StopReason::EndTurn);
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 2);
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn tool_use_arguments_accumulate_across_deltas() {
        let mut state = DecodeState::default();
        let chunks = feed_all(
            &mut state,
            &[
                json!({"type":"content_block_start","index":0,
                       "content_block":{"type":"tool_use","id":"tu_1","name":"calculator"}}),
                json!({"type":"content_block_delta","index":0,
                       "delta":{"type":"input_json_delta","partial_json":"{\"expr\":"}}),
                json!({"type":"content_block_delta","index":0,
                       "delta":{"type":"input_json_delta","partial_json":"\"2+2\"}"}}),
                json!({"type":"content_block_stop","index":0}),
                json!({"type":"message_delta","delta":{"stop_reason":"tool_use"},
                       "usage":{"output_tokens":9}}),
                json!({"type":"message_stop"}),
            ],
        );
        let end = chunks
            .iter()
            .find(|c| matches!(c, ChatChunk::ToolUseEnd { .. }))
            .unwrap();
        match end {
            ChatChunk::ToolUseEnd {
                id,
                name,
                arguments,
                ..
            } => {
                assert_eq!(id, "tu_1");
                assert_eq!(name, "calculator");
                assert_eq!(arguments, "{\"expr\":\"2+2\"}");
            }
            _ => unreachable!(),
        }
        match chunks.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, StopReason::ToolUse)
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn max_tokens_stop_reason_is_preserved() {
        let mut state = DecodeState::default();
        let chunks = feed_all(
            &mut state,
            &[
                json!({"type":"message_delta","delta":{"stop_reason":"max_tokens"},
                       "usage":{"output_tokens":4096}}),
                json!({"type":"message_stop"}),
            ],
        );
        match chunks.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, StopReason::MaxTokens)
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn error_event_becomes_error_chunk() {
        let mut state = DecodeState::default();
        let chunks = state.feed(&json!({
            "type":"error","error":{"type":"overloaded_error","message":"overloaded"}
        }));
        assert_eq!(chunks, vec![ChatChunk::Error("overloaded".into())]);
    }

    #[test]
    fn wire_messages_separate_tool_results() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant_blocks(vec![ContentBlock::tool_use(
                "u1",
                "calc",
                json!({"expr":"2+2"}),
            )]),
            Message::user_blocks(vec![ContentBlock::tool_result("u1", "4")]),
        ];
        let wire = build_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "u1");
    }

    #[test]
    fn system_turns_are_not_sent_as_messages() {
        let wire = build_messages(&[Message::system("preamble"), Message::user("q")]);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }
}
