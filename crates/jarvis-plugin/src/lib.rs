// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process plugin runtime.
//!
//! A plugin is `{id, name, register(api)}`.  `register` receives a
//! [`PluginApi`] capability object and declares tools, hook handlers,
//! background services, and prompt sections; the runtime then drains those
//! declarations into the tool registry, the [`HookRunner`], the
//! [`ServiceSupervisor`], and the prompt assembler.  The relationship is
//! strictly one-way — the runtime holds no plugin internals and plugins hold
//! no runtime pointers beyond the api object passed to them.

mod hooks;
mod service;

pub use hooks::{FnHook, Hook, HookContext, HookEvent, HookHandler, HookRunner};
pub use service::{ServiceHandle, ServiceSpec, ServiceSupervisor};

use std::future::Future;
use std::sync::Arc;

use jarvis_tools::{Tool, ToolRegistry};

/// An in-process extension.
pub trait Plugin: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn register(&self, api: &mut PluginApi);
}

/// A fragment of the assembled system prompt.  Sections are ordered by
/// ascending `priority`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSection {
    pub title: String,
    pub content: String,
    pub priority: i32,
}

/// Capability object passed to [`Plugin::register`].
#[derive(Default)]
pub struct PluginApi {
    tools: Vec<Arc<dyn Tool>>,
    hook_handlers: Vec<(Hook, Arc<dyn HookHandler>)>,
    services: Vec<ServiceSpec>,
    sections: Vec<PromptSection>,
}

impl PluginApi {
    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.tools.push(Arc::new(tool));
    }

    pub fn on(&mut self, hook: Hook, handler: impl HookHandler + 'static) {
        self.hook_handlers.push((hook, Arc::new(handler)));
    }

    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        future: impl Future<Output = ()> + Send + 'static,
    ) {
        self.services.push(ServiceSpec::new(name, future));
    }

    pub fn register_prompt_section(&mut self, section: PromptSection) {
        self.sections.push(section);
    }
}

/// Everything loaded from the plugin set, ready to wire into the agent.
///
/// The supervisor sits behind a lock so shutdown works through the shared
/// handle the agent runtime holds.
pub struct PluginHost {
    hooks: HookRunner,
    supervisor: tokio::sync::Mutex<ServiceSupervisor>,
    sections: Vec<PromptSection>,
    pending_services: std::sync::Mutex<Vec<ServiceSpec>>,
    tools: Vec<Arc<dyn Tool>>,
}

impl PluginHost {
    /// Run every plugin's `register` and collect the declarations.  Services
    /// are not started yet — call [`PluginHost::start_services`] once the
    /// agent is up.
    pub fn load(plugins: &[Box<dyn Plugin>]) -> Self {
        let mut hooks = HookRunner::new();
        let mut sections = Vec::new();
        let mut pending_services = Vec::new();
        let mut tools = Vec::new();

        for plugin in plugins {
            let mut api = PluginApi::default();
            plugin.register(&mut api);
            tracing::debug!(
                plugin = plugin.id(),
                tools = api.tools.len(),
                hooks = api.hook_handlers.len(),
                services = api.services.len(),
                "plugin registered"
            );
            for (hook, handler) in api.hook_handlers {
                hooks.register(plugin.id(), hook, handler);
            }
            sections.extend(api.sections);
            pending_services.extend(api.services);
            tools.extend(api.tools);
        }

        Self {
            hooks,
            supervisor: tokio::sync::Mutex::new(ServiceSupervisor::new()),
            sections,
            pending_services: std::sync::Mutex::new(pending_services),
            tools,
        }
    }

    /// Move plugin tools into the shared registry.
    pub fn install_tools(&mut self, registry: &mut ToolRegistry) {
        for tool in self.tools.drain(..) {
            registry.register_arc(tool);
        }
    }

    /// Prompt sections sorted ascending by priority (stable for ties).
    pub fn prompt_sections(&self) -> Vec<PromptSection> {
        let mut sections = self.sections.clone();
        sections.sort_by_key(|s| s.priority);
        sections
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    pub async fn emit(&self, event: &HookEvent, ctx: &HookContext) {
        self.hooks.emit(event, ctx).await;
    }

    /// Start declared services.  Call once, before sharing the host.
    pub fn start_services(&mut self) {
        let supervisor = self.supervisor.get_mut();
        for spec in self.pending_services.lock().expect("pending services lock").drain(..) {
            supervisor.start(spec);
        }
    }

    pub async fn services_running(&self) -> usize {
        self.supervisor.lock().await.running()
    }

    pub async fn shutdown(&self) {
        self.supervisor.lock().await.shutdown().await;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
