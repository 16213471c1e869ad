//! Role engine interface
//!
//! The actual catalog/consensus machinery behind a role is an external
//! collaborator. This module defines the seam: [`RoleEngine`] opens and
//! destroys role storage, [`RoleInstance`] is the opaque running role
//! that processes messages. The management layer never looks inside
//! either; it only routes, borrows, and tears down.

use std::path::Path;
use std::sync::Arc;

use crate::config::{NodeId, Replica};
use crate::{ErrorCode, Result};

/// Options a role instance is opened or altered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleOptions {
    pub node_id: NodeId,
    pub cluster_id: u64,
    /// Consensus group members; empty on reopen, when the engine
    /// re-derives the set from its own storage
    pub replicas: Vec<Replica>,
    /// Index of this node within `replicas`
    pub self_index: usize,
}

/// Credentials returned by the catalog for transport authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub spi: u8,
    pub encrypt: u8,
    pub secret: Vec<u8>,
    pub cipher_key: Vec<u8>,
}

/// Per-message processing outcome; each message in a batch gets its own.
pub type ProcessResult = std::result::Result<Vec<u8>, ErrorCode>;

/// A running role instance.
///
/// Processing methods are invoked from lane workers while the caller
/// holds a borrowed handle, so implementations must be safe for
/// concurrent calls. Batch methods receive one ordered drain of the
/// lane's queue and must return exactly one result per message.
pub trait RoleInstance: Send + Sync {
    /// Apply a replica-set change in place.
    fn alter(&self, opts: &RoleOptions) -> Result<()>;

    /// Stop serving; called once, after the last borrower is gone.
    fn close(&self);

    fn process_read(&self, payload: &[u8]) -> ProcessResult;

    fn process_sync(&self, payload: &[u8]) -> ProcessResult;

    /// Commit a batch of writes as one unit, preserving order.
    fn process_write_batch(&self, payloads: &[&[u8]]) -> Vec<ProcessResult>;

    /// Apply a batch of consensus entries as one unit, preserving order.
    fn process_apply_batch(&self, payloads: &[&[u8]]) -> Vec<ProcessResult>;

    /// Monitoring snapshot; only roles with a monitor lane implement it.
    fn monitor_info(&self) -> ProcessResult {
        Err(ErrorCode::NotHandled)
    }

    /// Credential lookup for transport authentication.
    fn retrieve_auth(&self, user: &str) -> Result<Credentials>;
}

/// Factory for role instances and their on-disk storage.
pub trait RoleEngine: Send + Sync {
    /// Open (or create) the role's storage under `dir` and start an
    /// instance.
    fn open(&self, dir: &Path, opts: &RoleOptions) -> Result<Arc<dyn RoleInstance>>;

    /// Remove the role's persisted storage under `dir`.
    fn destroy(&self, dir: &Path) -> Result<()>;
}

/// Which lanes a role runs.
///
/// The catalog role serves reads and drives consensus, so it runs the
/// full read/write/apply/sync set. The background role only batches
/// writes, plus a monitor lane when roles run in separate processes.
#[derive(Debug, Clone, Copy)]
pub struct RoleProfile {
    pub name: &'static str,
    pub read: bool,
    pub write: bool,
    pub apply: bool,
    pub sync: bool,
    /// Monitor lane; only started under multi-process topology
    pub monitor: bool,
}

impl RoleProfile {
    /// The metadata/catalog role.
    pub fn catalog() -> Self {
        Self {
            name: "catalog",
            read: true,
            write: true,
            apply: true,
            sync: true,
            monitor: false,
        }
    }

    /// The background task execution role.
    pub fn background() -> Self {
        Self {
            name: "background",
            read: false,
            write: true,
            apply: false,
            sync: false,
            monitor: true,
        }
    }
}
