// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in tools shipped with every agent.

mod calculator;
mod fs;
mod http_fetch;
mod shell;

pub use calculator::CalculatorTool;
pub use fs::{ReadFileTool, WriteFileTool};
pub use http_fetch::HttpFetchTool;
pub use shell::ShellTool;

use std::sync::Arc;

use jarvis_auth::AuditLog;

use crate::sandbox::PathSandbox;
use crate::ToolRegistry;

/// Shared context handed to built-ins that touch the filesystem, the
/// network, or a subprocess.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub sandbox: Arc<PathSandbox>,
    pub audit: AuditLog,
}

/// Register the full built-in set on `registry`.
pub fn register_builtins(registry: &mut ToolRegistry, ctx: &ToolContext) {
    registry.register(CalculatorTool);
    registry.register(ReadFileTool::new(ctx.clone()));
    registry.register(WriteFileTool::new(ctx.clone()));
    registry.register(HttpFetchTool::new(ctx.clone()));
    registry.register(ShellTool::new(ctx.clone()));
}
