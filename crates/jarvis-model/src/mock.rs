// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use jarvis_proto::Usage;

use crate::catalog;
use crate::provider::{ChunkStream, Provider};
use crate::types::{ChatChunk, ChatRequest, ModelInfo, StopReason};

/// A pre-scripted provider.  Each `chat_stream` call pops the next script
/// from the front of the queue, so tests can specify exact chunk sequences —
/// including tool calls and mid-stream errors — without network access.
pub struct ScriptedProvider {
    id: String,
    scripts: Arc<Mutex<VecDeque<Script>>>,
    /// The last request seen, for assertions on what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

enum Script {
    Chunks(Vec<ChatChunk>),
    /// The call itself fails (e.g. a 500 before any chunk).
    CallError(String),
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ChatChunk>>) -> Self {
        Self {
            id: "mock".into(),
            scripts: Arc::new(Mutex::new(
                scripts.into_iter().map(Script::Chunks).collect(),
            )),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.into();
        self
    }

    /// Queue a call-level failure before the given scripts.
    pub fn failing_first(error: impl Into<String>, then: Vec<Vec<ChatChunk>>) -> Self {
        let mut queue: VecDeque<Script> = VecDeque::new();
        queue.push_back(Script::CallError(error.into()));
        queue.extend(then.into_iter().map(Script::Chunks));
        Self {
            id: "mock".into(),
            scripts: Arc::new(Mutex::new(queue)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider that always answers with a single text turn.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_turn(reply)])
    }

    /// Round 1 emits a tool call, round 2 a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            tool_turn(tool_id, tool_name, args_json),
            text_turn(final_text),
        ])
    }

    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

/// Script for one plain text turn.
pub fn text_turn(reply: impl Into<String>) -> Vec<ChatChunk> {
    vec![
        ChatChunk::TextDelta(reply.into()),
        ChatChunk::MessageEnd {
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
                cache_tokens: 0,
                total_tokens: 15,
            },
        },
    ]
}

/// Script for one turn that requests a single tool call.
pub fn tool_turn(
    id: impl Into<String>,
    name: impl Into<String>,
    args_json: impl Into<String>,
) -> Vec<ChatChunk> {
    let id = id.into();
    let name = name.into();
    let args = args_json.into();
    vec![
        ChatChunk::ToolUseStart {
            index: 0,
            id: id.clone(),
            name: name.clone(),
        },
        ChatChunk::ToolUseDelta {
            index: 0,
            arguments: args.clone(),
        },
        ChatChunk::ToolUseEnd {
            index: 0,
            id,
            name,
            arguments: args,
        },
        ChatChunk::MessageEnd {
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 8,
                cache_tokens: 0,
                total_tokens: 18,
            },
        },
    ]
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Mock"
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(catalog::for_provider("mock"))
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Chunks(chunks)) => {
                let events: Vec<anyhow::Result<ChatChunk>> =
                    chunks.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(events)))
            }
            Some(Script::CallError(e)) => anyhow::bail!("{e}"),
            None => {
                let events: Vec<anyhow::Result<ChatChunk>> = text_turn("[script exhausted]")
                    .into_iter()
                    .map(Ok)
                    .collect();
                Ok(Box::pin(stream::iter(events)))
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::collect_stream;

    #[tokio::test]
    async fn scripted_turns_pop_in_order() {
        let p = ScriptedProvider::new(vec![text_turn("one"), text_turn("two")]);
        let r1 = collect_stream(
            "mock-model",
            p.chat_stream(ChatRequest::default()).await.unwrap(),
        )
        .await
        .unwrap();
        let r2 = collect_stream(
            "mock-model",
            p.chat_stream(ChatRequest::default()).await.unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(r1.text(), "one");
        assert_eq!(r2.text(), "two");
    }

    #[tokio::test]
    async fn failing_first_errors_then_recovers() {
        let p = ScriptedProvider::failing_first("upstream 500", vec![text_turn("ok")]);
        assert!(p.chat_stream(ChatRequest::default()).await.is_err());
        let r = collect_stream(
            "mock-model",
            p.chat_stream(ChatRequest::default()).await.unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(r.text(), "ok");
    }

    #[tokio::test]
    async fn last_request_records_what_was_sent() {
        let p = ScriptedProvider::always_text("hi");
        let req = ChatRequest::default().with_model("mock-model");
        let _ = p.chat_stream(req).await.unwrap();
        assert_eq!(
            p.last_request.lock().unwrap().as_ref().unwrap().model,
            "mock-model"
        );
    }
}
