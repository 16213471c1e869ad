//! Role lifecycle control
//!
//! Orchestrates the deploy/alter/drop state machine for one hosted
//! role: builds instance options, starts and stops the role's lanes,
//! persists the lifecycle record, and swaps the handle registry. The
//! durable record always changes before any in-memory flag a
//! concurrent dispatcher could observe, with one deliberate inversion:
//! `dropped` is persisted before teardown starts, so a crash in the
//! middle of a drop restarts as "finish dropping", never as "still
//! deployed".
//!
//! Control requests are validated against this node's identity before
//! any state is touched; they arrive serialized through the
//! single-threaded management lane owned by the [`Dispatcher`].
//!
//! [`Dispatcher`]: crate::dispatch::Dispatcher

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{NodeConfig, NodeId, Replica};
use crate::dispatch::{batch_processor, single_processor, DataStream};
use crate::message::{Envelope, MsgKind};
use crate::registry::{HandleRegistry, RoleState};
use crate::role::{Credentials, RoleEngine, RoleOptions, RoleProfile};
use crate::state::{PersistedRecord, RoleStateFile};
use crate::worker::{Lane, LaneConfig};
use crate::{NodeError, Result};

/// Body of a create/alter/drop control message.
///
/// The kind tag on the envelope selects the operation; the body names
/// the target node and, for create/alter, the replica set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Node the request is addressed to; must match the local node id
    pub node_id: NodeId,
    /// Consensus group members; ignored for drop
    #[serde(default)]
    pub replicas: Vec<Replica>,
}

impl ControlRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| NodeError::InvalidRequest(e.to_string()))
    }
}

/// The data lanes of a deployed role. Started on deploy, destroyed on
/// drop; the management lane lives outside this set.
struct DataLanes {
    read: Option<Arc<Lane>>,
    write: Option<Arc<Lane>>,
    apply: Option<Arc<Lane>>,
    sync: Option<Arc<Lane>>,
    monitor: Option<Arc<Lane>>,
}

impl DataLanes {
    fn all(&self) -> Vec<Arc<Lane>> {
        [&self.read, &self.write, &self.apply, &self.sync, &self.monitor]
            .iter()
            .filter_map(|lane| lane.as_ref().map(Arc::clone))
            .collect()
    }
}

/// Lifecycle controller for one hosted role.
///
/// Owns the role's registry, data lanes, state file, and engine. Built
/// per role instance; nothing here is process-global.
pub struct LifecycleController {
    config: NodeConfig,
    profile: RoleProfile,
    engine: Arc<dyn RoleEngine>,
    registry: Arc<HandleRegistry>,
    state_file: RoleStateFile,
    lanes: RwLock<Option<DataLanes>>,
    role_dir: PathBuf,
}

impl LifecycleController {
    /// Construct the controller and run the startup decision: a
    /// dropped record finalizes cleanup and leaves the role permanently
    /// absent, a deployed record reopens the instance, and otherwise
    /// the role deploys only under the bootstrap condition.
    pub fn init(
        config: NodeConfig,
        profile: RoleProfile,
        engine: Arc<dyn RoleEngine>,
    ) -> Result<Arc<Self>> {
        log::info!("{}: lifecycle init", profile.name);
        fs::create_dir_all(&config.data_dir).map_err(|e| {
            NodeError::Persistence(format!("create {}: {}", config.data_dir.display(), e))
        })?;

        let controller = Arc::new(Self {
            state_file: RoleStateFile::new(&config.data_dir, profile.name),
            role_dir: config.data_dir.join(profile.name),
            registry: Arc::new(HandleRegistry::new(profile.name)),
            lanes: RwLock::new(None),
            config,
            profile,
            engine,
        });
        controller.startup()?;
        Ok(controller)
    }

    fn startup(&self) -> Result<()> {
        let record = self.state_file.load_or_default();

        if record.dropped {
            log::info!(
                "{}: previously dropped, finalizing cleanup",
                self.profile.name
            );
            self.registry.mark_dropped();
            self.registry.set_state(RoleState::Dropped);
            if let Err(e) = self.engine.destroy(&self.role_dir) {
                log::warn!("{}: residual storage cleanup failed: {}", self.profile.name, e);
            }
            return Ok(());
        }

        if record.deployed {
            log::info!("{}: reopening deployed role", self.profile.name);
            return self.open(&self.reopen_options());
        }

        if self.config.is_bootstrap_node() {
            log::info!("{}: bootstrap node, deploying", self.profile.name);
            return self.open(&self.bootstrap_options());
        }

        log::debug!("{}: no deployment needed", self.profile.name);
        Ok(())
    }

    pub fn role_name(&self) -> &'static str {
        self.profile.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn state(&self) -> RoleState {
        self.registry.state()
    }

    /// Lane carrying the given data message kind, if the role runs one.
    pub(crate) fn lane_for(&self, kind: MsgKind) -> Option<Arc<Lane>> {
        let lanes = self.lanes.read();
        let lanes = lanes.as_ref()?;
        let lane = match kind {
            MsgKind::Read => &lanes.read,
            MsgKind::Write => &lanes.write,
            MsgKind::Apply => &lanes.apply,
            MsgKind::Sync => &lanes.sync,
            MsgKind::Monitor => &lanes.monitor,
            _ => return None,
        };
        lane.as_ref().map(Arc::clone)
    }

    // ========================================================================
    // Option building
    // ========================================================================

    fn bootstrap_options(&self) -> RoleOptions {
        let node_id = if self.config.node_id == 0 { 1 } else { self.config.node_id };
        let cluster_id = if self.config.cluster_id == 0 { 1 } else { self.config.cluster_id };
        let replicas = if self.config.replicas.is_empty() {
            vec![Replica {
                id: node_id,
                endpoint: self.config.local_endpoint.clone(),
            }]
        } else {
            self.config.replicas.clone()
        };
        let self_index = replicas.iter().position(|r| r.id == node_id).unwrap_or(0);
        RoleOptions {
            node_id,
            cluster_id,
            replicas,
            self_index,
        }
    }

    /// On reopen the engine re-derives the replica set from its own
    /// storage, so no replicas are passed.
    fn reopen_options(&self) -> RoleOptions {
        RoleOptions {
            node_id: self.config.node_id,
            cluster_id: self.config.cluster_id,
            replicas: Vec::new(),
            self_index: 0,
        }
    }

    fn request_options(&self, req: &ControlRequest) -> Result<RoleOptions> {
        let self_index = req
            .replicas
            .iter()
            .position(|r| r.id == self.config.node_id)
            .ok_or(NodeError::NotInReplicaSet {
                local: self.config.node_id,
            })?;
        Ok(RoleOptions {
            node_id: self.config.node_id,
            cluster_id: self.config.cluster_id,
            replicas: req.replicas.clone(),
            self_index,
        })
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Deploy (or reopen) the role: start lanes, open the instance,
    /// persist the record, then publish the instance to the registry.
    /// Any failure rolls everything back and leaves the role absent.
    pub fn open(&self, opts: &RoleOptions) -> Result<()> {
        if self.registry.is_dropped() {
            return Err(NodeError::Unavailable);
        }
        if self.registry.is_deployed() {
            return Err(NodeError::AlreadyDeployed);
        }

        self.registry.set_state(RoleState::Deploying);
        let lanes = match self.start_lanes() {
            Ok(lanes) => lanes,
            Err(e) => {
                log::error!("{}: failed to start lanes: {}", self.profile.name, e);
                self.registry.set_state(RoleState::Absent);
                return Err(e);
            }
        };
        *self.lanes.write() = Some(lanes);

        let instance = match self.engine.open(&self.role_dir, opts) {
            Ok(instance) => instance,
            Err(e) => {
                log::error!("{}: engine open failed: {}", self.profile.name, e);
                self.stop_lanes();
                self.registry.set_state(RoleState::Absent);
                return Err(e);
            }
        };

        if let Err(e) = self.state_file.write(PersistedRecord {
            deployed: true,
            dropped: false,
        }) {
            log::error!("{}: failed to persist deploy: {}", self.profile.name, e);
            self.stop_lanes();
            instance.close();
            if let Err(de) = self.engine.destroy(&self.role_dir) {
                log::warn!("{}: rollback destroy failed: {}", self.profile.name, de);
            }
            self.registry.set_state(RoleState::Absent);
            return Err(e);
        }

        // Durable record is in place; now the role becomes visible
        self.registry.install(instance);
        log::info!("{}: deployed", self.profile.name);
        Ok(())
    }

    /// Apply a replica-set change to the live instance. Failure leaves
    /// all state untouched.
    pub fn alter(&self, opts: &RoleOptions) -> Result<()> {
        let handle = self.registry.acquire()?;
        handle.alter(opts)?;
        log::info!(
            "{}: altered to {} replicas",
            self.profile.name,
            opts.replicas.len()
        );
        Ok(())
    }

    /// Drop the role from this node.
    ///
    /// The `dropped` flag is persisted before teardown begins; from
    /// that point a crash resumes as "finish dropping". Teardown waits
    /// for in-flight borrowers and queued messages, then closes the
    /// instance and destroys role storage.
    pub fn drop_role(&self) -> Result<()> {
        let handle = self.registry.acquire()?;
        log::info!("{}: dropping", self.profile.name);

        self.registry.mark_dropped();
        if let Err(e) = self.state_file.write(PersistedRecord {
            deployed: true,
            dropped: true,
        }) {
            log::error!("{}: failed to persist drop: {}", self.profile.name, e);
            self.registry.clear_dropped();
            return Err(e);
        }

        // Release our own borrow before waiting for quiescence
        drop(handle);

        let instance = self.registry.begin_teardown();
        self.registry.await_quiescent();
        self.stop_lanes();

        if let Err(e) = self.state_file.write(PersistedRecord {
            deployed: false,
            dropped: true,
        }) {
            log::warn!("{}: final record write failed: {}", self.profile.name, e);
        }

        if let Some(instance) = instance {
            instance.close();
        }
        if let Err(e) = self.engine.destroy(&self.role_dir) {
            log::warn!("{}: storage destroy failed: {}", self.profile.name, e);
        }
        self.registry.set_state(RoleState::Dropped);
        log::info!("{}: dropped", self.profile.name);
        Ok(())
    }

    /// Node shutdown: tear down the live instance without touching the
    /// durable record, so the next start reopens the role.
    pub fn shutdown(&self) {
        if let Some(instance) = self.registry.begin_teardown() {
            self.registry.await_quiescent();
            self.stop_lanes();
            instance.close();
            self.registry.set_state(RoleState::Absent);
            log::info!("{}: shut down, record untouched", self.profile.name);
        } else {
            self.stop_lanes();
        }
    }

    /// Direct credential lookup against the live instance; not queued.
    pub fn get_user_auth(&self, user: &str) -> Result<Credentials> {
        let handle = self.registry.acquire().map_err(|e| {
            log::trace!("{}: auth lookup failed: {}", self.profile.name, e);
            e
        })?;
        handle.retrieve_auth(user)
    }

    // ========================================================================
    // Control message handling (management lane callback)
    // ========================================================================

    /// Process one control message. Runs on the single-threaded
    /// management lane, so transitions never race each other.
    pub(crate) fn handle_control(&self, msg: Envelope) {
        let result = self.process_control(&msg);
        if let Err(e) = &result {
            log::warn!(
                "{}: control msg {:?} failed: {}",
                self.profile.name,
                msg.kind,
                e
            );
        }
        let reply = result.map(|_| Vec::new()).map_err(|e| e.code());
        msg.respond(reply);
    }

    fn process_control(&self, msg: &Envelope) -> Result<()> {
        let req: ControlRequest = serde_json::from_slice(&msg.payload)
            .map_err(|e| NodeError::InvalidRequest(e.to_string()))?;

        if req.node_id != self.config.node_id {
            return Err(NodeError::IdentityMismatch {
                requested: req.node_id,
                local: self.config.node_id,
            });
        }

        match msg.kind {
            MsgKind::CreateRole => self.open(&self.request_options(&req)?),
            MsgKind::AlterRole => self.alter(&self.request_options(&req)?),
            MsgKind::DropRole => self.drop_role(),
            _ => Err(NodeError::NotHandled),
        }
    }

    // ========================================================================
    // Lane management
    // ========================================================================

    fn start_lanes(&self) -> Result<DataLanes> {
        let mut lanes = DataLanes {
            read: None,
            write: None,
            apply: None,
            sync: None,
            monitor: None,
        };
        let role = self.profile.name;

        let start_single = |suffix: &str, stream: DataStream| -> Result<Arc<Lane>> {
            Ok(Arc::new(Lane::start(
                LaneConfig {
                    name: format!("{}-{}", role, suffix),
                    min_workers: 0,
                    max_workers: 1,
                    capacity: None,
                },
                single_processor(Arc::clone(&self.registry), stream),
            )?))
        };
        let start_batch = |suffix: &str, stream: DataStream| -> Result<Arc<Lane>> {
            Ok(Arc::new(Lane::start(
                LaneConfig {
                    name: format!("{}-{}", role, suffix),
                    min_workers: 0,
                    max_workers: 1,
                    capacity: None,
                },
                batch_processor(Arc::clone(&self.registry), stream),
            )?))
        };

        let started = (|| -> Result<()> {
            if self.profile.read {
                lanes.read = Some(start_single("read", DataStream::Read)?);
            }
            if self.profile.write {
                lanes.write = Some(start_batch("write", DataStream::Write)?);
            }
            if self.profile.apply {
                lanes.apply = Some(start_batch("apply", DataStream::Apply)?);
            }
            if self.profile.sync {
                lanes.sync = Some(start_single("sync", DataStream::Sync)?);
            }
            if self.profile.monitor && self.config.multi_process {
                lanes.monitor = Some(start_single("monitor", DataStream::Monitor)?);
            }
            Ok(())
        })();

        if let Err(e) = started {
            for lane in lanes.all() {
                lane.destroy();
            }
            return Err(e);
        }
        Ok(lanes)
    }

    fn stop_lanes(&self) {
        let lanes = self.lanes.write().take();
        if let Some(lanes) = lanes {
            for lane in lanes.all() {
                lane.wait_until_empty();
                lane.destroy();
            }
        }
    }
}
