// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

type ServiceFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A background service declared by a plugin.  Started by the supervisor,
/// cancelled at agent shutdown.
pub struct ServiceSpec {
    pub name: String,
    pub(crate) future: ServiceFuture,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, future: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

/// Cancel handle for one running service.
pub struct ServiceHandle {
    pub name: String,
    handle: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Owns every running plugin service for one agent.
#[derive(Default)]
pub struct ServiceSupervisor {
    running: Vec<ServiceHandle>,
}

impl ServiceSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, spec: ServiceSpec) {
        debug!(service = %spec.name, "starting plugin service");
        let name = spec.name.clone();
        let handle = tokio::spawn(spec.future);
        self.running.push(ServiceHandle { name, handle });
    }

    pub fn running(&self) -> usize {
        self.running.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel everything.  Called once at agent shutdown.
    pub async fn shutdown(&mut self) {
        for service in self.running.drain(..) {
            service.cancel();
            let name = service.name;
            match service.handle.await {
                Ok(()) => debug!(service = %name, "service stopped"),
                Err(e) if e.is_cancelled() => debug!(service = %name, "service cancelled"),
                Err(e) => warn!(service = %name, "service panicked: {e}"),
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
