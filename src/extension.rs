//! Sub-protocol extension registry.
//!
//! A PROTOCOL hand-off names a 32-bit sub-protocol id. Two ids are built
//! into the session (cluster membership, dispatch) and one performs the
//! messaging hand-off; everything else resolves through this registry.
//!
//! Entries are held weakly: the registry never keeps a handler alive, so
//! an owner can drop its extension and a later lookup simply reports "not
//! found", which the session answers with EXIT. No explicit
//! deregistration is required.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::protocol::Connection;

/// What an extension wants done with the connection when it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolResult {
    /// Keep the connection if policy allows.
    Quit,
    /// Close the connection.
    Exit,
    /// Answer the peer's flow-control probe and resume scanning.
    Yield,
}

/// A pluggable sub-protocol handler. Once invoked it owns the rest of the
/// exchange on the connection.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn handle(&self, conn: &mut Connection) -> Result<ProtocolResult>;
}

/// Registry mapping sub-protocol ids to weakly-held handlers.
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: RwLock<HashMap<u32, Weak<dyn Extension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an id. The registry holds only a weak
    /// reference; the caller keeps ownership.
    pub fn register(&self, id: u32, extension: &Arc<dyn Extension>) {
        self.entries.write().insert(id, Arc::downgrade(extension));
    }

    /// Resolve an id. Dead entries are pruned on the way.
    pub fn lookup(&self, id: u32) -> Option<Arc<dyn Extension>> {
        {
            let entries = self.entries.read();
            match entries.get(&id) {
                Some(weak) => {
                    if let Some(ext) = weak.upgrade() {
                        return Some(ext);
                    }
                }
                None => return None,
            }
        }
        // Entry exists but its owner is gone; drop it.
        self.entries.write().remove(&id);
        None
    }

    /// Number of live entries (dead ones included until next lookup).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
