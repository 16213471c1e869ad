//! Message dispatch
//!
//! Classifies inbound messages into lanes and enforces the handle
//! window: a data message is enqueued only while a borrowed handle
//! proves the role is live, and the handle is released as soon as the
//! message is on the queue. The worker that later processes the message
//! borrows the instance again, so a message that outlives a teardown is
//! answered `Unavailable` instead of touching a dying instance.
//!
//! Control messages bypass the handle gate entirely (a create request
//! must work before any instance exists) and run on the dispatcher's
//! single-threaded management lane.

use std::sync::Arc;

use crate::lifecycle::LifecycleController;
use crate::message::Envelope;
use crate::registry::HandleRegistry;
use crate::role::Credentials;
use crate::worker::{Lane, LaneConfig, Processor};
use crate::{ErrorCode, Result};

/// Data stream a lane processor serves.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DataStream {
    Read,
    Write,
    Apply,
    Sync,
    Monitor,
}

/// Worker-side callback for single-item lanes: re-borrow the instance,
/// process, answer.
pub(crate) fn single_processor(registry: Arc<HandleRegistry>, stream: DataStream) -> Processor {
    Processor::Single(Arc::new(move |msg: Envelope| {
        match registry.acquire() {
            Ok(handle) => {
                let result = match stream {
                    DataStream::Read => handle.process_read(&msg.payload),
                    DataStream::Sync => handle.process_sync(&msg.payload),
                    DataStream::Monitor => handle.monitor_info(),
                    // Batched streams never run on a single-item lane
                    DataStream::Write | DataStream::Apply => Err(ErrorCode::NotHandled),
                };
                msg.respond(result);
            }
            Err(e) => msg.respond(Err(e.code())),
        }
    }))
}

/// Worker-side callback for batched lanes: one borrow covers the whole
/// drained batch; every message gets its own reply.
pub(crate) fn batch_processor(registry: Arc<HandleRegistry>, stream: DataStream) -> Processor {
    Processor::Batch(Arc::new(move |batch: Vec<Envelope>| {
        match registry.acquire() {
            Ok(handle) => {
                let payloads: Vec<&[u8]> = batch.iter().map(|m| m.payload.as_slice()).collect();
                let mut results = match stream {
                    DataStream::Write => handle.process_write_batch(&payloads),
                    DataStream::Apply => handle.process_apply_batch(&payloads),
                    DataStream::Read | DataStream::Sync | DataStream::Monitor => Vec::new(),
                };
                // The engine must answer every message; pad defensively
                // so none goes missing if it shorts the batch.
                results.resize(batch.len(), Err(ErrorCode::Engine));
                for (msg, result) in batch.into_iter().zip(results) {
                    msg.respond(result);
                }
            }
            Err(e) => {
                let code = e.code();
                for msg in batch {
                    msg.respond(Err(code));
                }
            }
        }
    }))
}

/// Front door for one role's inbound messages.
///
/// Owns the management lane; data lanes belong to the controller since
/// they exist only while the role is deployed.
pub struct Dispatcher {
    controller: Arc<LifecycleController>,
    mgmt: Lane,
}

impl Dispatcher {
    pub fn new(controller: Arc<LifecycleController>) -> Result<Self> {
        let handler = Arc::clone(&controller);
        let mgmt = Lane::start(
            LaneConfig {
                name: format!("{}-mgmt", controller.role_name()),
                min_workers: 1,
                max_workers: 1,
                capacity: None,
            },
            Processor::Single(Arc::new(move |msg: Envelope| handler.handle_control(msg))),
        )?;
        Ok(Self { controller, mgmt })
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Route one inbound message. Every message that expects a reply
    /// eventually gets exactly one, whatever path it takes.
    pub fn dispatch(&self, msg: Envelope) {
        if msg.kind.is_control() {
            if let Err(msg) = self.mgmt.enqueue(msg) {
                msg.respond(Err(ErrorCode::ResourceExhausted));
            }
            return;
        }

        // The handle is held only for the enqueue window; processing
        // re-borrows inside the worker.
        let handle = match self.controller.registry().acquire() {
            Ok(handle) => handle,
            Err(e) => {
                log::trace!(
                    "{}: dropping {:?} msg: {}",
                    self.controller.role_name(),
                    msg.kind,
                    e
                );
                msg.respond(Err(e.code()));
                return;
            }
        };

        match self.controller.lane_for(msg.kind) {
            Some(lane) => {
                if let Err(msg) = lane.enqueue(msg) {
                    msg.respond(Err(ErrorCode::ResourceExhausted));
                }
            }
            None => msg.respond(Err(ErrorCode::NotHandled)),
        }
        drop(handle);
    }

    /// Direct credential lookup; bypasses the queues.
    pub fn get_user_auth(&self, user: &str) -> Result<Credentials> {
        self.controller.get_user_auth(user)
    }

    /// Stop the management lane and tear down the role's live state
    /// without touching the durable record.
    pub fn shutdown(&self) {
        self.mgmt.wait_until_empty();
        self.mgmt.destroy();
        self.controller.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, NodeId, Replica};
    use crate::lifecycle::ControlRequest;
    use crate::message::{MsgKind, Reply};
    use crate::registry::RoleState;
    use crate::role::testing::{MockEngine, ReadGate};
    use crate::role::RoleProfile;
    use crate::state::{PersistedRecord, RoleStateFile};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(2);

    fn stack(
        dir: &std::path::Path,
        profile: RoleProfile,
        multi_process: bool,
    ) -> (Dispatcher, Arc<MockEngine>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let engine = MockEngine::new();
        let config = NodeConfig {
            node_id: 2,
            cluster_id: 9,
            data_dir: dir.to_path_buf(),
            multi_process,
            ..NodeConfig::default()
        };
        let controller = crate::lifecycle::LifecycleController::init(
            config,
            profile,
            engine.clone(),
        )
        .unwrap();
        (Dispatcher::new(controller).unwrap(), engine)
    }

    fn control_payload(node_id: NodeId, replica_ids: &[NodeId]) -> Vec<u8> {
        ControlRequest {
            node_id,
            replicas: replica_ids
                .iter()
                .map(|id| Replica {
                    id: *id,
                    endpoint: format!("node{}:7100", id),
                })
                .collect(),
        }
        .encode()
        .unwrap()
    }

    fn send(dispatcher: &Dispatcher, kind: MsgKind, payload: Vec<u8>) -> mpsc::Receiver<Reply> {
        let (msg, rx) = Envelope::request(kind, payload);
        dispatcher.dispatch(msg);
        rx
    }

    fn deploy(dispatcher: &Dispatcher) {
        let rx = send(
            dispatcher,
            MsgKind::CreateRole,
            control_payload(2, &[1, 2, 3]),
        );
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(Vec::new()));
    }

    #[test]
    fn test_data_msg_before_deploy_gets_unavailable() {
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), false);

        let rx = send(&dispatcher, MsgKind::Read, b"q".to_vec());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ErrorCode::Unavailable));
        dispatcher.shutdown();
    }

    #[test]
    fn test_create_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), false);
        deploy(&dispatcher);
        assert_eq!(dispatcher.controller().state(), RoleState::Deployed);

        let rx = send(&dispatcher, MsgKind::Read, b"ping".to_vec());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(b"ping".to_vec()));

        let rx = send(&dispatcher, MsgKind::Sync, b"entry".to_vec());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(b"entry".to_vec()));
        dispatcher.shutdown();
    }

    #[test]
    fn test_create_for_other_node_rejected() {
        let dir = tempdir().unwrap();
        let (dispatcher, engine) = stack(dir.path(), RoleProfile::catalog(), false);

        let rx = send(
            &dispatcher,
            MsgKind::CreateRole,
            control_payload(7, &[7]),
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(ErrorCode::IdentityMismatch)
        );
        assert_eq!(
            engine.opens.load(std::sync::atomic::Ordering::Acquire),
            0
        );
        // Record file untouched
        assert_eq!(
            RoleStateFile::new(dir.path(), "catalog").read().unwrap(),
            PersistedRecord::default()
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_malformed_control_body_is_answered() {
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), false);

        let rx = send(&dispatcher, MsgKind::CreateRole, b"{broken".to_vec());
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(ErrorCode::InvalidRequest)
        );
        dispatcher.shutdown();
    }

    #[test]
    fn test_writes_batch_in_order() {
        let dir = tempdir().unwrap();
        let (dispatcher, engine) = stack(dir.path(), RoleProfile::catalog(), false);
        deploy(&dispatcher);

        let receivers: Vec<_> = (0u8..10)
            .map(|i| send(&dispatcher, MsgKind::Write, vec![i]))
            .collect();
        for rx in receivers {
            assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(Vec::new()));
        }

        let writes = engine.instance().writes.lock().clone();
        assert_eq!(writes.len(), 10);
        for (i, payload) in writes.iter().enumerate() {
            assert_eq!(payload, &vec![i as u8]);
        }
        dispatcher.shutdown();
    }

    #[test]
    fn test_monitor_lane_gated_on_topology() {
        // Catalog role never runs a monitor lane
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), true);
        deploy(&dispatcher);
        let rx = send(&dispatcher, MsgKind::Monitor, Vec::new());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ErrorCode::NotHandled));
        dispatcher.shutdown();

        // Background role in multi-process topology serves it
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::background(), true);
        deploy(&dispatcher);
        let rx = send(&dispatcher, MsgKind::Monitor, Vec::new());
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Ok(b"mock-monitor".to_vec())
        );
        dispatcher.shutdown();

        // Same role single-process: lane never started
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::background(), false);
        deploy(&dispatcher);
        let rx = send(&dispatcher, MsgKind::Monitor, Vec::new());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ErrorCode::NotHandled));
        dispatcher.shutdown();
    }

    #[test]
    fn test_drop_then_read_unavailable() {
        let dir = tempdir().unwrap();
        let (dispatcher, engine) = stack(dir.path(), RoleProfile::catalog(), false);
        deploy(&dispatcher);

        let rx = send(&dispatcher, MsgKind::DropRole, control_payload(2, &[]));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(Vec::new()));
        assert!(engine.instance().closed());

        let rx = send(&dispatcher, MsgKind::Read, b"q".to_vec());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Err(ErrorCode::Unavailable));
        dispatcher.shutdown();
    }

    #[test]
    fn test_drop_waits_for_in_flight_read() {
        let dir = tempdir().unwrap();
        let (dispatcher, engine) = stack(dir.path(), RoleProfile::catalog(), false);
        deploy(&dispatcher);
        let instance = engine.instance();

        // Arm the gate so the next read blocks mid-processing
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *instance.read_gate.lock() = Some(ReadGate {
            entered: entered_tx,
            release: Mutex::new(release_rx),
        });

        let read_rx = send(&dispatcher, MsgKind::Read, b"held".to_vec());
        entered_rx.recv_timeout(WAIT).unwrap();

        // Read is mid-flight and holds a borrow; the drop must wait
        let drop_rx = send(&dispatcher, MsgKind::DropRole, control_payload(2, &[]));
        std::thread::sleep(Duration::from_millis(100));
        assert!(drop_rx.try_recv().is_err());
        assert!(!instance.closed());

        // Release the read; its reply still succeeds, then the drop
        // finishes
        release_tx.send(()).unwrap();
        assert_eq!(read_rx.recv_timeout(WAIT).unwrap(), Ok(b"held".to_vec()));
        assert_eq!(drop_rx.recv_timeout(WAIT).unwrap(), Ok(Vec::new()));
        assert!(instance.closed());
        dispatcher.shutdown();
    }

    #[test]
    fn test_get_user_auth_passthrough() {
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), false);

        assert!(dispatcher.get_user_auth("root").is_err());
        deploy(&dispatcher);

        let creds = dispatcher.get_user_auth("root").unwrap();
        assert_eq!(creds.user, "root");
        dispatcher.shutdown();
    }

    #[test]
    fn test_control_after_shutdown_gets_exhausted() {
        let dir = tempdir().unwrap();
        let (dispatcher, _engine) = stack(dir.path(), RoleProfile::catalog(), false);
        dispatcher.shutdown();

        let rx = send(
            &dispatcher,
            MsgKind::CreateRole,
            control_payload(2, &[2]),
        );
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Err(ErrorCode::ResourceExhausted)
        );
    }
}
