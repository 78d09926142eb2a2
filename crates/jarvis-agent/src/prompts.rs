// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System prompt assembly.
//!
//! Layout, in order: fixed safety preamble → role template → network/peer
//! table → plugin-contributed sections (ascending priority) → current task
//! and runtime facts.

use jarvis_plugin::PromptSection;
use jarvis_proto::{AgentRole, Discovery, Task};

/// Literal an agent may answer with when a heartbeat poll needs no reply.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
/// Literal an agent may answer with when an inbound message needs no reply.
pub const NO_REPLY: &str = "NO_REPLY";

const SAFETY_PREAMBLE: &str = "\
You are an autonomous agent in a multi-agent fabric. Ground rules:\n\
- Never exfiltrate credentials, tokens, or private keys; tools will refuse\n\
  and the attempt is logged.\n\
- Stay inside your workspace and the shared storage tree.\n\
- Prefer small, verifiable steps; report failures honestly.\n\
- When another agent is better suited for a task, delegate instead of\n\
  guessing.";

fn role_template(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Orchestrator => {
            "Role: orchestrator. You decompose incoming work, delegate tasks to\n\
             specialist agents with the message_agent tool, and track their\n\
             completion. After delegating you MUST verify progress with the\n\
             check_delegated_task tool before reporting back — never\n\
             fire-and-forget. If a heartbeat poll carries nothing that needs\n\
             attention, reply with exactly HEARTBEAT_OK. If a message needs no\n\
             reply at all, reply with exactly NO_REPLY."
        }
        AgentRole::Dev => {
            "Role: dev. You implement, build, and debug software. Use the\n\
             calculator, file, and shell tools to do the work rather than\n\
             describing it. Report concrete results: file paths, exit codes,\n\
             test output."
        }
        AgentRole::Marketing => {
            "Role: marketing. You draft copy, plan campaigns, and analyze\n\
             reach. Store deliverables as artifacts in shared storage and\n\
             reference them by path in your final answer."
        }
    }
}

/// Context assembled fresh for every request; never journaled.
#[derive(Debug, Default)]
pub struct PromptInputs<'a> {
    pub agent_id: &'a str,
    pub host_label: &'a str,
    pub peers: &'a [Discovery],
    pub sections: Vec<PromptSection>,
    pub task: Option<&'a Task>,
}

pub fn system_prompt(role: AgentRole, inputs: &PromptInputs<'_>) -> String {
    let mut out = String::new();
    out.push_str(SAFETY_PREAMBLE);
    out.push_str("\n\n");
    out.push_str(role_template(role));

    out.push_str("\n\n## Network\n");
    out.push_str(&format!(
        "You are `{}` on host `{}`.\n",
        inputs.agent_id, inputs.host_label
    ));
    if inputs.peers.is_empty() {
        out.push_str("No peer agents are currently online.\n");
    } else {
        out.push_str("Peers:\n");
        for peer in inputs.peers {
            out.push_str(&format!(
                "- {} ({:?}, {}) [{}] — {}\n",
                peer.agent_id,
                peer.role,
                peer.host,
                peer.status,
                if peer.capabilities.is_empty() {
                    "no declared capabilities".to_string()
                } else {
                    peer.capabilities.join(", ")
                },
            ));
        }
    }

    for section in &inputs.sections {
        out.push_str(&format!("\n## {}\n{}\n", section.title, section.content));
    }

    if let Some(task) = inputs.task {
        out.push_str(&format!(
            "\n## Current task\nid: {}\ntitle: {}\npriority: {}\n{}\n",
            task.id,
            task.title,
            task.priority.as_str(),
            task.description
        ));
    }

    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use jarvis_proto::TaskPriority;

    #[test]
    fn orchestrator_prompt_mandates_follow_up() {
        let p = system_prompt(AgentRole::Orchestrator, &PromptInputs::default());
        assert!(p.contains("check_delegated_task"));
        assert!(p.contains(HEARTBEAT_OK));
        assert!(p.contains(NO_REPLY));
    }

    #[test]
    fn dev_prompt_does_not_carry_orchestrator_contract() {
        let p = system_prompt(AgentRole::Dev, &PromptInputs::default());
        assert!(!p.contains("check_delegated_task"));
    }

    #[test]
    fn peer_table_lists_agents() {
        let peers = vec![Discovery {
            agent_id: "dev-1".into(),
            role: AgentRole::Dev,
            host: "workstation".into(),
            ip: None,
            status: "online".into(),
            capabilities: vec!["code".into()],
        }];
        let inputs = PromptInputs {
            agent_id: "orchestrator-1",
            host_label: "hub-host",
            peers: &peers,
            ..Default::default()
        };
        let p = system_prompt(AgentRole::Orchestrator, &inputs);
        assert!(p.contains("dev-1"));
        assert!(p.contains("code"));
    }

    #[test]
    fn plugin_sections_and_task_are_injected() {
        let mut task = Task::new("sum numbers", "compute 2+2");
        task.priority = TaskPriority::High;
        let inputs = PromptInputs {
            agent_id: "dev-1",
            host_label: "box",
            peers: &[],
            sections: vec![PromptSection {
                title: "House rules".into(),
                content: "always rhyme".into(),
                priority: 0,
            }],
            task: Some(&task),
        };
        let p = system_prompt(AgentRole::Dev, &inputs);
        assert!(p.contains("## House rules"));
        assert!(p.contains("always rhyme"));
        assert!(p.contains("sum numbers"));
        assert!(p.contains("priority: high"));
    }
}
