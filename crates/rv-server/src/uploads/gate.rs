//! Per-session admission gate.
//!
//! Chunk writes hold the read side, so any number run in parallel.
//! Completion, cancellation and the expiry sweep take the write side, which
//! waits for in-flight writes to drain, and then close the gate for good.

use dashmap::DashMap;
use rv_core::{Error, SessionId};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Why a gate was closed. Decides the error later writers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closed(CloseReason),
}

impl GateState {
    /// `Ok` while open; otherwise the error a late writer should get.
    pub fn check(&self, id: SessionId) -> rv_core::Result<()> {
        match self {
            GateState::Open => Ok(()),
            GateState::Closed(CloseReason::Expired) => Err(Error::session_expired(id)),
            GateState::Closed(_) => Err(Error::not_found("upload_session", id)),
        }
    }
}

#[derive(Debug)]
pub struct SessionGate {
    pub state: RwLock<GateState>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self {
            state: RwLock::new(GateState::Open),
        }
    }
}

/// Gates for the sessions that currently have writers or finalizers.
#[derive(Debug, Default)]
pub struct GateMap {
    gates: DashMap<SessionId, Arc<SessionGate>>,
}

impl GateMap {
    /// Gate for `id`, created open on first use.
    pub fn get(&self, id: SessionId) -> Arc<SessionGate> {
        self.gates.entry(id).or_default().clone()
    }

    /// Drop the map entry once the session is gone. Holders of the `Arc`
    /// still observe the closed state.
    pub fn forget(&self, id: SessionId) {
        self.gates.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
