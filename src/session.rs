//! Per-client build state
//!
//! A [`ClientSession`] exists for each connected device. It owns the set of
//! modules that device already holds ([`ClientKnownModules`]) and turns
//! file-change batches into minimal payloads through the shared
//! [`BuildOrchestrator`].

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::bundler::{BuildOrchestrator, HmrPayload};
use crate::error::Result;
use crate::module_id::ModuleId;

/// Modules believed to be already delivered to one client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientKnownModules {
    modules: BTreeSet<ModuleId>,
}

impl ClientKnownModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules.contains(id)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleId> {
        self.modules.iter()
    }

    pub fn as_set(&self) -> &BTreeSet<ModuleId> {
        &self.modules
    }

    pub fn clear(&mut self) {
        self.modules.clear();
    }

    /// Forget everything and hold exactly `ids`
    pub fn replace<I: IntoIterator<Item = ModuleId>>(&mut self, ids: I) {
        self.modules = ids.into_iter().collect();
    }

    /// Record modules that were just streamed to the client
    pub fn record<I: IntoIterator<Item = ModuleId>>(&mut self, ids: I) {
        self.modules.extend(ids);
    }

    /// Split a change batch: returns the known subset (batch order, no
    /// duplicates) and drops every changed id from the set
    pub fn begin_hmr(&mut self, changed: &[ModuleId]) -> Vec<ModuleId> {
        let mut to_replace: Vec<ModuleId> = Vec::new();
        for id in changed {
            if self.modules.contains(id) && !to_replace.contains(id) {
                to_replace.push(id.clone());
            }
        }
        for id in changed {
            self.modules.remove(id);
        }
        to_replace
    }

    /// Drop modules that turned out not to reach the client
    pub fn forget<'a, I: IntoIterator<Item = &'a ModuleId>>(&mut self, ids: I) {
        for id in ids {
            self.modules.remove(id);
        }
    }

    pub fn snapshot(&self) -> BTreeSet<ModuleId> {
        self.modules.clone()
    }

    /// Put back a set taken with [`ClientKnownModules::snapshot`]
    pub fn restore(&mut self, snapshot: BTreeSet<ModuleId>) {
        self.modules = snapshot;
    }
}

/// Build state for one connected device
#[derive(Debug)]
pub struct ClientSession {
    client_id: String,
    socket_url: String,
    orchestrator: Arc<BuildOrchestrator>,
    known: ClientKnownModules,
    last_hmr_failed: bool,
}

impl ClientSession {
    pub fn new(orchestrator: Arc<BuildOrchestrator>, client_id: &str, socket_url: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            socket_url: socket_url.to_string(),
            orchestrator,
            known: ClientKnownModules::new(),
            last_hmr_failed: false,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn socket_url(&self) -> &str {
        &self.socket_url
    }

    pub fn known(&self) -> &ClientKnownModules {
        &self.known
    }

    pub fn orchestrator(&self) -> &Arc<BuildOrchestrator> {
        &self.orchestrator
    }

    /// Stream a full bundle and reset the known set to what it contains
    pub async fn build_full_bundle<W>(&mut self, output: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.orchestrator
            .build_full_bundle(&self.socket_url, &self.client_id, &mut self.known, output)
            .await
    }

    /// Compute the payload for a change batch, or `None` when the client
    /// holds none of the changed modules
    pub async fn build_hmr_payload(&mut self, changed: &[ModuleId]) -> Result<Option<HmrPayload>> {
        let result = self.orchestrator.build_hmr_payload(&mut self.known, changed).await;
        match result {
            Ok(Some(_)) if self.last_hmr_failed => {
                self.last_hmr_failed = false;
                info!(client = %self.client_id, "Error fixed, serving hot modules again");
            }
            Err(ref e) => {
                self.last_hmr_failed = true;
                warn!(client = %self.client_id, error = %e, "hot update build failed");
            }
            _ => {}
        }
        result
    }

    /// Undo the bookkeeping of a payload that was never delivered. The
    /// changed modules stay invalidated; the modules the payload carried are
    /// no longer counted as held, so a later payload ships them again.
    pub fn discard_undelivered(&mut self, payload: &HmrPayload) {
        self.known.forget(&payload.shipped);
        debug!(client = %self.client_id, dropped = payload.shipped.len(), "hot update not delivered");
    }
}
