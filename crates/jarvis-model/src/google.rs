// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for the Google Generative Language API (`streamGenerateContent`
//! with SSE framing).  Gemini sends function calls whole rather than as
//! argument deltas, so each one maps to an immediate start/end pair.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use jarvis_proto::{ContentBlock, Message, MessageContent, Role, ToolResultContent, Usage};

use crate::catalog;
use crate::provider::{ChunkStream, Provider};
use crate::types::{ChatChunk, ChatRequest, ModelInfo, StopReason};

const STREAM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(600);

pub struct GoogleProvider {
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("GEMINI_API_KEY").ok(), None)
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn id(&self) -> &str {
        "google"
    }

    fn name(&self) -> &str {
        "Google Gemini"
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::for_provider("google"))
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream> {
        let key = self.api_key.as_deref().context("GEMINI_API_KEY not set")?;

        let mut body = json!({
            "contents": build_contents(&req.messages),
        });
        if let Some(system) = &req.system {
            if !system.is_empty() {
                body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
            }
        }
        let mut generation: serde_json::Map<String, Value> = Default::default();
        if let Some(t) = req.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(m) = req.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(m));
        }
        if !req.stop_sequences.is_empty() {
            generation.insert("stopSequences".into(), json!(req.stop_sequences));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        if !req.tools.is_empty() {
            let decls: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }

        debug!(model = %req.model, "sending gemini request");

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, req.model
        );
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .timeout(STREAM_TIMEOUT)
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Gemini error {status}: {text}");
        }

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

#[derive(Default)]
struct DecodeState {
    usage: Usage,
    saw_tool_use: bool,
    next_call: u32,
    finished: bool,
}

impl DecodeState {
    fn feed(&mut self, v: &Value) -> Vec<ChatChunk> {
        let mut out = Vec::new();

        if let Some(usage) = v.get("usageMetadata") {
            self.usage.input_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0);
            self.usage.output_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0);
            self.usage.total_tokens = usage["totalTokenCount"].as_u64().unwrap_or(0);
        }

        let Some(candidate) = v["candidates"].get(0) else {
            return out;
        };

        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        out.push(ChatChunk::TextDelta(text.to_string()));
                    }
                }
                if let Some(call) = part.get("functionCall") {
                    // Gemini has no call ids; synthesize stable ones.
                    let index = self.next_call;
                    self.next_call += 1;
                    self.saw_tool_use = true;
                    let id = format!("call_{index}");
                    let name = call["name"].as_str().unwrap_or("").to_string();
                    let arguments = call
                        .get("args")
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "{}".into());
                    out.push(ChatChunk::ToolUseStart {
                        index,
                        id: id.clone(),
                        name: name.clone(),
                    });
                    out.push(ChatChunk::ToolUseEnd {
                        index,
                        id,
                        name,
                        arguments,
                    });
                }
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            if !self.finished {
                self.finished = true;
                let stop_reason = if self.saw_tool_use {
                    StopReason::ToolUse
                } else {
                    match reason {
                        "MAX_TOKENS" => StopReason::MaxTokens,
                        _ => StopReason::EndTurn,
                    }
                };
                out.push(ChatChunk::MessageEnd {
                    stop_reason,
                    usage: self.usage,
                });
            }
        }
        out
    }
}

fn build_contents(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();
    for m in messages {
        let role = match m.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "model",
        };
        let parts: Vec<Value> = match &m.content {
            MessageContent::Text(t) => vec![json!({ "text": t })],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => json!({ "text": text }),
                    ContentBlock::Image { data, media_type } => json!({
                        "inlineData": { "mimeType": media_type, "data": data }
                    }),
                    ContentBlock::ToolUse { name, input, .. } => json!({
                        "functionCall": { "name": name, "args": input }
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        let text = match content {
                            ToolResultContent::Text(t) => t.clone(),
                            ToolResultContent::Blocks(_) => String::new(),
                        };
                        // Gemini correlates function responses by name, which
                        // callers encode as `<name>` in the id's prefix when
                        // they need it; the raw text response is carried here.
                        json!({
                            "functionResponse": {
                                "name": tool_use_id,
                                "response": { "content": text }
                            }
                        })
                    }
                })
                .collect(),
        };
        out.push(json!({ "role": role, "parts": parts }));
    }
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_parts_become_deltas() {
        let mut state = DecodeState::default();
        let chunks = state.feed(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }]
        }));
        assert_eq!(chunks, vec![ChatChunk::TextDelta("hello".into())]);
    }

    #[test]
    fn function_call_maps_to_start_end_pair() {
        let mut state = DecodeState::default();
        let chunks = state.feed(&json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "calculator", "args": { "expr": "2+2" } } }
            ]}}]
        }));
        assert_eq!(chunks.len(), 2);
        match &chunks[1] {
            ChatChunk::ToolUseEnd {
                id,
                name,
                arguments,
                ..
            } => {
                assert_eq!(id, "call_0");
                assert_eq!(name, "calculator");
                assert!(arguments.contains("2+2"));
            }
            other => panic!("expected ToolUseEnd, got {other:?}"),
        }
    }

    #[test]
    fn finish_with_tool_use_reports_tool_use_stop() {
        let mut state = DecodeState::default();
        state.feed(&json!({
            "candidates": [{ "content": { "parts": [
                { "functionCall": { "name": "t", "args": {} } }
            ]}}]
        }));
        let chunks = state.feed(&json!({
            "candidates": [{ "finishReason": "STOP" }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2,
                               "totalTokenCount": 7 }
        }));
        match chunks.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, usage } => {
                assert_eq!(*stop_reason, StopReason::ToolUse);
                assert_eq!(usage.total_tokens, 7);
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn max_tokens_finish_reason_maps() {
        let mut state = DecodeState::default();
        let chunks = state.feed(&json!({ "candidates": [{ "finishReason": "MAX_TOKENS" }] }));
        match chunks.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, StopReason::MaxTokens)
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let contents = build_contents(&[Message::user("q"), Message::assistant("a")]);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }
}
