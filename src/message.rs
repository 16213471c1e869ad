//! Message envelope and reply plumbing
//!
//! The transport layer (out of scope here) turns a wire request into an
//! [`Envelope`]: a kind tag, an opaque payload, and a reply handle. The
//! envelope is moved into a lane on enqueue and consumed exactly once by
//! [`Envelope::respond`], so a message can never be answered twice or
//! leak without an answer on an error path.

use std::sync::mpsc;

use crate::ErrorCode;

/// Classifies an inbound message into its processing lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    /// Catalog read, answered by one worker per message
    Read,
    /// Write proposal, batch-committed by the role engine
    Write,
    /// Consensus apply, batch-applied in log order
    Apply,
    /// Consensus sync traffic
    Sync,
    /// Monitoring snapshot request
    Monitor,
    /// Control plane: deploy the role on this node
    CreateRole,
    /// Control plane: change the role's replica set
    AlterRole,
    /// Control plane: drop the role from this node
    DropRole,
}

impl MsgKind {
    /// Control-plane kinds go to the management lane and do not need a
    /// deployed instance.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MsgKind::CreateRole | MsgKind::AlterRole | MsgKind::DropRole
        )
    }
}

/// Outcome delivered to the requester: response payload or error code.
pub type Reply = std::result::Result<Vec<u8>, ErrorCode>;

/// Continuation for sending the reply back through the transport.
///
/// A handle either carries a sender (the request expects a reply) or
/// nothing (one-way message). Sending consumes the handle.
pub struct ReplyHandle {
    tx: Option<mpsc::Sender<Reply>>,
}

impl ReplyHandle {
    /// Handle/receiver pair for a request that expects a reply.
    pub fn channel() -> (Self, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Handle for a one-way message.
    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Whether the requester is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        self.tx.is_some()
    }

    fn send(self, reply: Reply) {
        if let Some(tx) = self.tx {
            // Receiver may be gone if the requester timed out; nothing
            // more to do for this message then.
            let _ = tx.send(reply);
        }
    }
}

/// An inbound message with its reply continuation.
pub struct Envelope {
    /// Message kind, decided by the transport layer
    pub kind: MsgKind,
    /// Opaque request body, interpreted only by the role engine
    pub payload: Vec<u8>,
    reply: ReplyHandle,
}

impl Envelope {
    /// Envelope for a request that expects a reply, plus the receiver
    /// the requester blocks on.
    pub fn request(kind: MsgKind, payload: Vec<u8>) -> (Self, mpsc::Receiver<Reply>) {
        let (reply, rx) = ReplyHandle::channel();
        (
            Self {
                kind,
                payload,
                reply,
            },
            rx,
        )
    }

    /// Envelope for a one-way message.
    pub fn one_way(kind: MsgKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            reply: ReplyHandle::none(),
        }
    }

    /// Whether the requester is waiting for a reply.
    pub fn expects_reply(&self) -> bool {
        self.reply.expects_reply()
    }

    /// Answer the message and free it.
    ///
    /// Consumes the envelope, so every processing path answers at most
    /// once; one-way messages are freed silently apart from a log line
    /// on failure.
    pub fn respond(self, reply: Reply) {
        if self.reply.expects_reply() {
            log::trace!("msg {:?} answered with {:?}", self.kind, reply.as_ref().err());
            self.reply.send(reply);
        } else if let Err(code) = reply {
            log::debug!("one-way msg {:?} failed: {:?}", self.kind, code);
        }
    }
}
