// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared wire types for the jarvis fabric.
//!
//! This crate is the bottom of the dependency graph: every other crate in the
//! workspace speaks these types.  It deliberately contains no I/O — encoding
//! is plain `serde_json`, transport lives in `jarvis-bus` and `jarvis-hub`.

pub mod coordination;
pub mod frames;
pub mod keys;
pub mod model;
pub mod subjects;

pub use coordination::{
    AgentMessage, AgentMessageKind, DelegationRequest, Discovery, FollowUpQuery, FollowUpReply,
    Heartbeat, TaskResult,
};
pub use frames::{ErrorBody, Frame};
pub use model::{
    AgentIdentity, AgentRole, AgentState, AgentStatus, ContentBlock, JournalRecord, Message,
    MessageContent, Role, SessionEntry, Task, TaskPriority, TaskStatus, ToolResultContent, Usage,
};
