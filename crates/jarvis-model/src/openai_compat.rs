// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for the OpenAI Chat Completions wire format.
//!
//! Besides api.openai.com this serves every compatible endpoint the fabric
//! routes to — OpenRouter and local Ollama — differing only in provider id,
//! base URL, and key handling.

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

pub struct OpenAiCompatProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    base_url: String,
    requires_key: bool,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn openai(api_key: Option<String>) -> Self {
        Self {
            id: "openai".into(),
            name: "OpenAI".into(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            requires_key: true,
            client: reqwest::Client::new(),
        }
    }

    pub fn openrouter(api_key: Option<String>) -> Self {
        Self {
            id: "openrouter".into(),
            name: "OpenRouter".into(),
            api_key,
            base_url: "https://openrouter.ai/api/v1".into(),
            requires_key: true,
            client: reqwest::Client::new(),
        }
    }

    pub fn ollama(base_url: Option<String>) -> Self {
        Self {
            id: "ollama".into(),
            name: "Ollama".into(),
            api_key: None,
            base_url: base_url.unwrap_or_else(|| "http://localhost:11434/v1".into()),
            requires_key: false,
            client: reqwest::Client::new(),
        }
    }

    /// Custom endpoint (tests, proxies).
    pub fn custom(id: &str, base_url: String, api_key: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: id.into(),
            api_key,
            base_url,
            requires_key: false,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::for_provider(&self.id))
    }

    async fn is_available(&self) -> bool {
        !self.requires_key || self.api_key.is_some()
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream> {
        let mut body = json!({
            "model": req.model,
            "messages": build_messages(&req.messages, req.system.as_deref()),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_output_tokens {
            body["max_tokens"] = json!(m);
        }
        if !req.stop_sequences.is_empty() {
            body["stop"] = json!(req.stop_sequences);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(provider = %self.id, model = %req.model, "sending chat completion request");

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(STREAM_TIMEOUT);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let resp = builder
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.name);
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
                            let data = data.trim();
                            if data == "[DONE]" {
                                out.extend(state.finish().into_iter().map(Ok));
                            } else if let Ok(v) = serde_json::from_str::<Value>(data) {
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

/// Decode state: the Chat Completions protocol has no per-block end marker,
/// so tool calls flush when `[DONE]` arrives.
#[derive(Default)]
struct DecodeState {
    acc: ToolUseAccumulator,
    usage: Usage,
    stop_reason: Option<StopReason>,
    done: bool,
}

impl DecodeState {
    fn feed(&mut self, v: &Value) -> Vec<ChatChunk> {
        let mut out = Vec::new();

        // The usage-only final chunk has an empty choices array.
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
            self.usage.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
            self.usage.total_tokens = usage["total_tokens"].as_u64().unwrap_or(0);
            self.usage.cache_tokens = usage["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0);
        }

        let Some(choice) = v["choices"].get(0) else {
            return out;
        };

        let delta = &choice["delta"];
        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                out.push(ChatChunk::TextDelta(content.to_string()));
            }
        }
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as u32;
                let id = tc["id"].as_str().unwrap_or("");
                let name = tc["function"]["name"].as_str().unwrap_or("");
                if !id.is_empty() || !name.is_empty() {
                    out.push(self.acc.start(index, id, name));
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        out.push(self.acc.delta(index, args));
                    }
                }
            }
        }
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(match reason {
                "tool_calls" => StopReason::ToolUse,
                "length" => StopReason::MaxTokens,
                "content_filter" | "stop" => StopReason::EndTurn,
                other if other == "stop_sequence" => StopReason::StopSequence,
                _ => StopReason::EndTurn,
            });
        }
        out
    }

    fn finish(&mut self) -> Vec<ChatChunk> {
        if self.done {
            return vec![];
        }
        self.done = true;
        let mut out = self.acc.finish();
        if self.usage.total_tokens == 0 {
            self.usage.total_tokens = self.usage.input_tokens + self.usage.output_tokens;
        }
        out.push(ChatChunk::MessageEnd {
            stop_reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
            usage: self.usage,
        });
        out
    }
}

fn build_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(s) = system {
        if !s.is_empty() {
            out.push(json!({ "role": "system", "content": s }));
        }
    }
    for m in messages {
        match (&m.role, &m.content) {
            (Role::System, MessageContent::Text(t)) => {
                out.push(json!({ "role": "system", "content": t }));
            }
            (Role::System, _) => {}
            (role, MessageContent::Text(t)) => {
                out.push(json!({ "role": role_str(role), "content": t }));
            }
            (role, MessageContent::Blocks(blocks)) => {
                push_block_message(&mut out, role, blocks);
            }
        }
    }
    out
}

/// Blocks don't map one-to-one: assistant tool_use becomes `tool_calls`,
/// user tool_result becomes a `tool` role message.
fn push_block_message(out: &mut Vec<Value>, role: &Role, blocks: &[ContentBlock]) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() },
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = match content {
                    ToolResultContent::Text(t) => t.clone(),
                    ToolResultContent::Blocks(inner) => inner
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                };
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
            ContentBlock::Image { data, media_type } => {
                // Data-URL form; only meaningful in user turns.
                let media = serde_json::to_value(media_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "image/png".into());
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "image_url",
                        "image_url": { "url": format!("data:{media};base64,{data}") }
                    }],
                }));
            }
        }
    }

    if !tool_calls.is_empty() {
        let mut msg = json!({ "role": "assistant", "tool_calls": tool_calls });
        if !text_parts.is_empty() {
            msg["content"] = json!(text_parts.join(""));
        }
        out.push(msg);
    } else if !text_parts.is_empty() {
        out.push(json!({ "role": role_str(role), "content": text_parts.join("") }));
    }
}

fn role_str(role: &Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaved_parallel_tool_calls_rekey_by_index() {
        let mut state = DecodeState::default();
        state.feed(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"a","function":{"name":"first","arguments":""}}]}}]}));
        state.feed(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":1,"id":"b","function":{"name":"second","arguments":""}}]}}]}));
        // Fragments for the two calls arrive interleaved.
        state.feed(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"function":{"arguments":"{\"x\":"}},
            {"index":1,"function":{"arguments":"{\"y\":"}}]}}]}));
        state.feed(&json!({"choices":[{"delta":{"tool_calls":[
            {"index":1,"function":{"arguments":"2}"}},
            {"index":0,"function":{"arguments":"1}"}}]}}]}));
        state.feed(&json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}));

        let done = state.finish();
        let ends: Vec<_> = done
            .iter()
            .filter_map(|c| match c {
                ChatChunk::ToolUseEnd {
                    id, arguments, ..
                } => Some((id.clone(), arguments.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0], ("a".into(), "{\"x\":1}".into()));
        assert_eq!(ends[1], ("b".into(), "{\"y\":2}".into()));
        match done.last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, StopReason::ToolUse)
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn usage_only_chunk_is_captured() {
        let mut state = DecodeState::default();
        state.feed(&json!({"choices":[{"delta":{"content":"hi"}}]}));
        state.feed(&json!({"choices":[{"delta":{},"finish_reason":"stop"}]}));
        state.feed(&json!({"choices":[],"usage":{
            "prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}));
        let done = state.finish();
        match done.last().unwrap() {
            ChatChunk::MessageEnd { usage, .. } => {
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 3);
                assert_eq!(usage.total_tokens, 10);
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn length_finish_reason_maps_to_max_tokens() {
        let mut state = DecodeState::default();
        state.feed(&json!({"choices":[{"delta":{},"finish_reason":"length"}]}));
        match state.finish().last().unwrap() {
            ChatChunk::MessageEnd { stop_reason, .. } => {
                assert_eq!(*stop_reason, StopReason::MaxTokens)
            }
            other => panic!("expected MessageEnd, got {other:?}"),
        }
    }

    #[test]
    fn finish_is_idempotent() {
        let mut state = DecodeState::default();
        assert!(!state.finish().is_empty());
        assert!(state.finish().is_empty(), "double [DONE] must not re-emit");
    }

    #[test]
    fn tool_results_become_tool_role_messages() {
        let messages = vec![
            Message::assistant_blocks(vec![ContentBlock::tool_use(
                "c1",
                "calc",
                json!({"expr":"2+2"}),
            )]),
            Message::user_blocks(vec![ContentBlock::tool_result("c1", "4")]),
        ];
        let wire = build_messages(&messages, Some("sys"));
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "c1");
        assert_eq!(wire[2]["content"], "4");
    }

    #[test]
    fn ollama_is_available_without_key() {
        let p = OpenAiCompatProvider::ollama(None);
        assert!(futures::executor::block_on(p.is_available()));
        let o = OpenAiCompatProvider::openai(None);
        assert!(!futures::executor::block_on(o.is_available()));
    }
}
