// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use jarvis_proto::Usage;

/// Streaming progress events published on the task's progress subject while
/// a task runs.  Dashboards subscribe through the hub's event fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TextDelta {
        task_id: String,
        delta: String,
    },
    ToolCallStarted {
        task_id: String,
        call_id: String,
        tool: String,
    },
    ToolCallFinished {
        task_id: String,
        call_id: String,
        tool: String,
        is_error: bool,
        duration_ms: u64,
    },
    TokenUsage {
        task_id: String,
        usage: Usage,
    },
    TurnComplete {
        task_id: String,
    },
}
