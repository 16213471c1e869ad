//! BasaltDB Node Role Management
//!
//! The node-local management layer of a BasaltDB server process. A node
//! hosts pluggable sub-node roles (the catalog role and the background
//! worker role) whose lifecycle (deployed, dropped, absent) can change
//! at runtime while requests are in flight. This crate provides the
//! acquire/release protocol that lets concurrent message processing
//! safely borrow the active role instance, the per-stream queue/worker
//! lanes that carry those messages, and the deploy/alter/drop state
//! machine with its crash-safe on-disk marker.
//!
//! The consensus engine behind a role, the wire transport, and message
//! codecs are external collaborators reached through the traits in
//! [`role`].

pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod role;
pub mod state;
pub mod worker;

// Re-export main types
pub use config::{NodeConfig, NodeId, Replica};
pub use dispatch::Dispatcher;
pub use lifecycle::{ControlRequest, LifecycleController};
pub use message::{Envelope, MsgKind, Reply};
pub use registry::{HandleRegistry, RoleHandle, RoleState};
pub use role::{Credentials, RoleEngine, RoleInstance, RoleOptions, RoleProfile};
pub use state::{PersistedRecord, RoleStateFile};
pub use worker::{Lane, LaneConfig, Processor};

/// Role management error type
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("role is not deployed")]
    Unavailable,

    #[error("role is already deployed")]
    AlreadyDeployed,

    #[error("request targets node {requested}, this node is {local}")]
    IdentityMismatch { requested: NodeId, local: NodeId },

    #[error("node {local} does not appear in the request's replica set")]
    NotInReplicaSet { local: NodeId },

    #[error("out of resources: {0}")]
    ResourceExhausted(String),

    #[error("failed to persist role state: {0}")]
    Persistence(String),

    #[error("role state file is malformed: {0}")]
    MalformedState(String),

    #[error("role engine error: {0}")]
    Engine(String),

    #[error("invalid control request: {0}")]
    InvalidRequest(String),

    #[error("message kind not handled by this role")]
    NotHandled,
}

impl NodeError {
    /// Wire-level code for this error, suitable for a reply.
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::Unavailable => ErrorCode::Unavailable,
            NodeError::AlreadyDeployed => ErrorCode::AlreadyDeployed,
            NodeError::IdentityMismatch { .. } => ErrorCode::IdentityMismatch,
            NodeError::NotInReplicaSet { .. } => ErrorCode::IdentityMismatch,
            NodeError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            NodeError::Persistence(_) => ErrorCode::Persistence,
            NodeError::MalformedState(_) => ErrorCode::MalformedState,
            NodeError::Engine(_) => ErrorCode::Engine,
            NodeError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            NodeError::NotHandled => ErrorCode::NotHandled,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Compact error code carried in message replies.
///
/// Replies cross the (out-of-scope) transport boundary, so they carry a
/// copyable code rather than the full [`NodeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Role not deployed or already dropped; retry after redeploy or redirect.
    Unavailable,
    /// Create request hit a role that is already running.
    AlreadyDeployed,
    /// Request names a different node; caller must redirect.
    IdentityMismatch,
    /// Queue or message allocation failed; retryable.
    ResourceExhausted,
    /// Disk write or rename failed; the requested transition did not happen.
    Persistence,
    /// On-disk role record was unreadable.
    MalformedState,
    /// The role engine rejected the operation.
    Engine,
    /// Control request body could not be decoded.
    InvalidRequest,
    /// No lane or handler exists for this message kind.
    NotHandled,
}
