//! The database: open, recover, run, shut down.

use crate::assembly::{
    self, AssemblyBundle, AssemblyRegistry, InstalledBundle, UpdateOutcome,
};
use crate::operations::{ExecutionService, OperationRegistry};
use crate::snapshotter::{self, Snapshotter};
use crate::txn::Txn;
use helio_concurrency::{CommitSink, LocalDurabilitySink, TransactionManager};
use helio_core::config::PersistenceConfig;
use helio_core::context::{EngineContext, TraceLevel};
use helio_core::error::{ClusterKind, Error, Result};
use helio_core::model::ModelDescriptor;
use helio_core::types::{ClassId, TxnKind, Version};
use helio_durability::{recover, DurabilityMode, LogRecord, SnapshotData, StreamSet};
use helio_replication::{
    ElectionManager, GlobalWriteRole, GlobalWriteState, LocalWriteRole, NodeRoles, RecordApplier,
    ReplicationHub, StateProvider, Witness,
};
use helio_rpc::ServiceRegistry;
use helio_storage::{GarbageCollector, IndexSet, ObjectStore, StoredVersion};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything needed to open a database.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// This node's name; expands `${NodeName}` in stream directories.
    pub node_name: String,
    /// System directory: database identity, installed bundle, persisted
    /// persistence configuration.
    pub system_dir: PathBuf,
    /// Log stream configuration.
    pub persistence: PersistenceConfig,
    /// fsync policy.
    pub durability: DurabilityMode,
    /// Replication hub tuning.
    pub hub: helio_replication::hub::HubConfig,
    /// Garbage collection cadence.
    pub gc_interval: Duration,
    /// Periodic snapshot cadence; `None` disables the background task.
    pub snapshot_interval: Option<Duration>,
}

impl DatabaseConfig {
    /// A standalone single-stream database rooted at `base`.
    pub fn standalone(node_name: &str, base: &std::path::Path) -> Self {
        let base_str = base.to_string_lossy();
        DatabaseConfig {
            node_name: node_name.to_string(),
            system_dir: base.join("system"),
            persistence: PersistenceConfig::main_only(&base_str),
            durability: DurabilityMode::Strict,
            hub: helio_replication::hub::HubConfig::default(),
            gc_interval: Duration::from_secs(1),
            snapshot_interval: None,
        }
    }
}

/// Commit durability composition: sync replicas acknowledge first, then
/// the record lands in the local streams. An acknowledgement timeout
/// therefore aborts with no durable local trace.
struct EngineSink {
    local: LocalDurabilitySink,
    hub: Arc<ReplicationHub>,
}

impl CommitSink for EngineSink {
    fn append(&self, record: &LogRecord) -> Result<()> {
        self.hub.ship(record)?;
        self.local.append(record)
    }
}

/// The running database.
pub struct Database {
    config: DatabaseConfig,
    uuid: [u8; 16],
    assemblies: AssemblyRegistry,
    model: RwLock<Arc<ModelDescriptor>>,
    manager: Arc<TransactionManager>,
    streams: Arc<StreamSet>,
    hub: Arc<ReplicationHub>,
    global_role: GlobalWriteState,
    election: RwLock<Option<Arc<ElectionManager>>>,
    witness: RwLock<Option<Arc<dyn Witness>>>,
    operations: Arc<OperationRegistry>,
    persistence: RwLock<PersistenceConfig>,
    gc: GarbageCollector,
    gc_handle: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    snapshotter: RwLock<Option<Snapshotter>>,
    /// Set on read-only replication children: they tail a source and
    /// never accept writes of their own.
    read_only: std::sync::atomic::AtomicBool,
}

impl Database {
    /// Open (or create) the database, running recovery.
    pub fn open(config: DatabaseConfig, initial_bundle: AssemblyBundle) -> Result<Arc<Database>> {
        std::fs::create_dir_all(&config.system_dir)?;
        let uuid = load_or_create_uuid(&config.system_dir)?;

        // The installed bundle wins over the initial one across restarts.
        let installed = match assembly::load_bundle(&config.system_dir)? {
            Some(b) => b,
            None => {
                let registry = AssemblyRegistry::new(initial_bundle)?;
                let installed = registry.installed();
                assembly::save_bundle(&config.system_dir, &installed)?;
                InstalledBundle {
                    bundle: installed.bundle.clone(),
                    version_guid: installed.version_guid,
                }
            }
        };
        let assemblies = AssemblyRegistry::new(installed.bundle.clone())?;
        // Keep the persisted identity rather than the fresh one.
        assemblies.restore_guid(installed.version_guid);
        let model = assemblies.model();
        model.validate()?;

        let persistence = load_persistence(&config.system_dir, &config.persistence)?;
        let streams = Arc::new(StreamSet::open(
            &persistence,
            &config.node_name,
            uuid,
            config.durability,
        )?);

        let store = Arc::new(ObjectStore::for_model(&model));
        let indexes = Arc::new(IndexSet::for_model(&model));
        let hub = ReplicationHub::new(config.hub.clone());

        let stream_model = Arc::clone(&model);
        let stream_of: Arc<dyn Fn(ClassId) -> u8 + Send + Sync> = Arc::new(move |class| {
            stream_model
                .class(class)
                .map(|c| c.log_stream)
                .unwrap_or(0)
        });
        let sink = Arc::new(EngineSink {
            local: LocalDurabilitySink::new(Arc::clone(&streams), stream_of),
            hub: Arc::clone(&hub),
        });

        // Recovery: snapshots first, then the merged log suffix.
        let recovered = recover(&streams, uuid)?;
        let manager = Arc::new(TransactionManager::with_recovered(
            Arc::clone(&store),
            Arc::clone(&indexes),
            sink,
            recovered.max_commit_version,
            recovered.max_txn_id,
        ));
        for snapshot in &recovered.snapshots {
            apply_snapshot(&model, &store, &indexes, snapshot)?;
        }
        for record in &recovered.records {
            manager.apply_record(&model, record)?;
        }
        if !recovered.records.is_empty() || !recovered.snapshots.is_empty() {
            info!(
                committed = manager.current_version(),
                "recovery replay complete"
            );
        }
        hub.set_latest_version(manager.current_version());

        let min_read = {
            let manager = Arc::clone(&manager);
            Arc::new(move || manager.min_read_version())
        };
        let gc = GarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&indexes),
            min_read,
            config.gc_interval,
        );

        let db = Arc::new(Database {
            uuid,
            assemblies,
            model: RwLock::new(model),
            manager,
            streams,
            hub,
            global_role: GlobalWriteState::new(GlobalWriteRole::None),
            election: RwLock::new(None),
            witness: RwLock::new(None),
            operations: Arc::new(OperationRegistry::new()),
            persistence: RwLock::new(persistence),
            gc,
            gc_handle: parking_lot::Mutex::new(None),
            snapshotter: RwLock::new(None),
            read_only: std::sync::atomic::AtomicBool::new(false),
            config,
        });

        *db.gc_handle.lock() = Some(db.gc.start());
        if let Some(interval) = db.config.snapshot_interval {
            let snapshotter = Snapshotter::new(Arc::downgrade(&db), interval);
            snapshotter.start();
            *db.snapshotter.write() = Some(snapshotter);
        }
        db.hub
            .set_state_provider(Arc::new(EngineStateProvider(Arc::downgrade(&db))));
        Ok(db)
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// The database UUID shared by its logs and snapshots.
    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    /// The transaction manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// The open log streams.
    pub fn streams(&self) -> &Arc<StreamSet> {
        &self.streams
    }

    /// The replication hub.
    pub fn hub(&self) -> &Arc<ReplicationHub> {
        &self.hub
    }

    /// The user-operation registry.
    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.operations
    }

    /// The installed model descriptor.
    pub fn model(&self) -> Arc<ModelDescriptor> {
        Arc::clone(&self.model.read())
    }

    /// Current persistence configuration.
    pub fn persistence(&self) -> PersistenceConfig {
        self.persistence.read().clone()
    }

    // === Roles ===

    /// Wire this node into a local-write cluster.
    pub fn set_election(&self, election: Arc<ElectionManager>, witness: Arc<dyn Witness>) {
        *self.election.write() = Some(election);
        *self.witness.write() = Some(witness);
    }

    /// The election manager, when clustered.
    pub fn election(&self) -> Option<Arc<ElectionManager>> {
        self.election.read().clone()
    }

    /// Global-write site role state.
    pub fn global_role(&self) -> &GlobalWriteState {
        &self.global_role
    }

    /// Combined roles right now.
    pub fn roles(&self) -> NodeRoles {
        let local = self
            .election
            .read()
            .as_ref()
            .map(|e| e.role())
            .unwrap_or(LocalWriteRole::None);
        NodeRoles {
            local,
            global: self.global_role.role(),
        }
    }

    // === Transactions ===

    /// Mark this node a read-only replication child.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only
            .store(read_only, std::sync::atomic::Ordering::Relaxed);
    }

    /// Begin a transaction. Writes require this node to be the write
    /// master.
    pub fn begin(&self, kind: TxnKind) -> Result<Txn<'_>> {
        let writable = self.roles().write_master()
            && !self.read_only.load(std::sync::atomic::Ordering::Relaxed);
        if kind == TxnKind::ReadWrite && !writable {
            return Err(Error::Cluster(ClusterKind::NotApplicable));
        }
        let ctx = self.manager.begin(kind, self.model());
        Ok(Txn::new(self, ctx))
    }

    /// Apply a record that committed elsewhere (replication tail or a
    /// snapshot-transfer catch-up): persist locally, then publish.
    pub fn apply_replicated(&self, record: &LogRecord) -> Result<()> {
        let model = self.model();
        let stream_of = {
            let model = Arc::clone(&model);
            move |class: ClassId| model.class(class).map(|c| c.log_stream).unwrap_or(0)
        };
        self.streams.append(record, stream_of)?;
        self.manager.apply_record(&model, record)?;
        self.hub.set_latest_version(record.commit_version);
        Ok(())
    }

    // === Snapshots ===

    /// Take a snapshot of every stream now. Returns the snapshot version.
    pub fn snapshot_now(&self) -> Result<Version> {
        let version = self.manager.current_version();
        let captured = snapshotter::capture(self, version);
        for (index, data) in captured.into_iter().enumerate() {
            self.streams.stream(index as u8)?.write_snapshot(self.uuid, &data)?;
        }
        Ok(version)
    }

    // === Administration ===

    /// Update the user-assembly bundle. Idempotent; an effective change
    /// swaps the model descriptor atomically and bumps the version GUID
    /// exactly once. Transactions already running keep their pinned model.
    pub fn update_assemblies(&self, bundle: AssemblyBundle) -> Result<UpdateOutcome> {
        let outcome = self.assemblies.update(bundle)?;
        if outcome == UpdateOutcome::Installed {
            let model = self.assemblies.model();
            self.manager.store().adopt_model(&model);
            self.manager.indexes().adopt_model(&model);
            *self.model.write() = model;
            assembly::save_bundle(&self.config.system_dir, &self.assemblies.installed())?;
        }
        Ok(outcome)
    }

    /// The installed bundle, packed for transfer.
    pub fn packed_assemblies(&self) -> Result<Vec<u8>> {
        assembly::pack_bundle(&self.assemblies.installed())
    }

    /// The installed model-version GUID.
    pub fn model_guid(&self) -> Uuid {
        self.assemblies.version_guid()
    }

    /// Replace the persistence configuration. Validated and persisted
    /// now; stream layout changes take effect at the next start.
    pub fn apply_persistence(&self, config: PersistenceConfig) -> Result<()> {
        config.validate()?;
        save_persistence(&self.config.system_dir, &config)?;
        *self.persistence.write() = config;
        info!("persistence configuration updated");
        Ok(())
    }

    /// Set the engine trace level.
    pub fn set_trace_level(&self, level: TraceLevel) {
        EngineContext::global().set_trace_level(level);
    }

    /// Set the user-code trace level.
    pub fn set_user_trace_level(&self, level: TraceLevel) {
        EngineContext::global().set_user_trace_level(level);
    }

    /// A point-in-time picture for the admin surface.
    pub fn node_state(&self) -> crate::node_state::NodeState {
        let witness_reachable = self.witness.read().as_ref().map(|w| w.is_reachable());
        crate::node_state::NodeState {
            node: self.config.node_name.clone(),
            roles: self.roles(),
            committed_version: self.manager.current_version(),
            live_transactions: self.manager.live().len(),
            replicas: self.hub.statuses(),
            witness_reachable,
            model_guid: self.model_guid().to_string(),
            model_version: self.model().version,
        }
    }

    /// Build the execution-service registry: one RPC service per
    /// registered operation service, plus discovery metadata.
    pub fn execution_registry(self: &Arc<Self>) -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        for service in self.operations.service_names() {
            registry.register(
                &service,
                Arc::new(ExecutionService::new(
                    Arc::clone(self),
                    Arc::clone(&self.operations),
                    &service,
                )),
            );
        }
        registry.set_model_info(Arc::new(EngineModelInfo(Arc::clone(self))));
        registry
    }

    /// Terminal handling for critical errors: flush the logs once, then
    /// end the process. Broken engine invariants must not keep serving.
    pub fn fail_fast(&self, error: &Error) -> ! {
        tracing::error!(%error, "critical failure, terminating");
        if let Err(e) = self.streams.sync_all() {
            warn!(error = %e, "final log flush failed");
        }
        std::process::abort();
    }

    /// Stop background work. Idempotent.
    pub fn shutdown(&self) {
        self.gc.shutdown();
        if let Some(handle) = self.gc_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(snapshotter) = self.snapshotter.read().as_ref() {
            snapshotter.shutdown();
        }
        if let Some(election) = self.election.read().as_ref() {
            election.shutdown();
        }
        if let Err(e) = self.streams.sync_all() {
            warn!(error = %e, "final log flush failed");
        }
    }
}

struct EngineModelInfo(Arc<Database>);

impl helio_rpc::service::ModelInfo for EngineModelInfo {
    fn model_guid(&self) -> String {
        self.0.model_guid().to_string()
    }
    fn model_version(&self) -> u32 {
        self.0.model().version
    }
}

// Weak: the hub is owned by the database, so a strong reference here
// would keep the database (and its WAL locks) alive forever.
struct EngineStateProvider(std::sync::Weak<Database>);

impl StateProvider for EngineStateProvider {
    fn full_state(&self) -> Result<(Version, Vec<SnapshotData>)> {
        let db = self
            .0
            .upgrade()
            .ok_or_else(|| Error::InvalidState("database is shut down".to_string()))?;
        let version = db.manager.current_version();
        Ok((version, snapshotter::capture(&db, version)))
    }
}

/// The replica-side applier: tailed records persist locally and publish
/// through the normal apply path.
pub struct EngineApplier(pub Arc<Database>);

impl RecordApplier for EngineApplier {
    fn applied_version(&self) -> Version {
        self.0.manager.current_version()
    }

    fn apply(&self, record: &LogRecord) -> Result<()> {
        self.0.apply_replicated(record)
    }

    fn install_snapshot(&self, commit_version: Version, snapshots: Vec<SnapshotData>) -> Result<()> {
        let model = self.0.model();
        for snapshot in &snapshots {
            apply_snapshot(&model, self.0.manager.store(), self.0.manager.indexes(), snapshot)?;
            self.0
                .streams
                .stream(0)?
                .write_snapshot(self.0.uuid, snapshot)?;
        }
        self.0.manager.apply_record(
            &model,
            &LogRecord {
                commit_version,
                tx_id: 0,
                writes: Vec::new(),
            },
        )?;
        Ok(())
    }
}

fn apply_snapshot(
    model: &ModelDescriptor,
    store: &ObjectStore,
    indexes: &IndexSet,
    snapshot: &SnapshotData,
) -> Result<()> {
    for (class_id, objects) in &snapshot.classes {
        let partition = store.partition(*class_id)?;
        for object in objects {
            partition.observe_id(object.object_id);
            match &object.block {
                Some(block) => {
                    partition.publish(
                        object.object_id,
                        StoredVersion::live(object.commit_version, block.clone()),
                    );
                    indexes.apply_write(
                        model,
                        *class_id,
                        object.object_id,
                        None,
                        Some(block),
                        object.commit_version,
                    )?;
                }
                None => {
                    partition.publish(
                        object.object_id,
                        StoredVersion::tombstone(object.commit_version),
                    );
                }
            }
        }
    }
    Ok(())
}

fn load_or_create_uuid(system_dir: &std::path::Path) -> Result<[u8; 16]> {
    let path = system_dir.join("db.uuid");
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        let uuid: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
            Error::Persistence(helio_core::error::PersistenceKind::CorruptLog(
                "bad database uuid file".to_string(),
            ))
        })?;
        Ok(uuid)
    } else {
        let uuid = *Uuid::new_v4().as_bytes();
        std::fs::write(&path, uuid)?;
        Ok(uuid)
    }
}

fn load_persistence(
    system_dir: &std::path::Path,
    fallback: &PersistenceConfig,
) -> Result<PersistenceConfig> {
    let path = system_dir.join("persistence.json");
    if path.exists() {
        let text = std::fs::read_to_string(&path)?;
        let config: PersistenceConfig =
            serde_json::from_str(&text).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    } else {
        fallback.validate()?;
        Ok(fallback.clone())
    }
}

fn save_persistence(system_dir: &std::path::Path, config: &PersistenceConfig) -> Result<()> {
    let text =
        serde_json::to_string_pretty(config).map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(system_dir.join("persistence.json"), text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helio_core::model::{ClassDescriptor, PropertyDescriptor, PropertyKind};
    use helio_core::value::{PropertyBlock, PropertyValue};

    fn book_model() -> ModelDescriptor {
        let mut m = ModelDescriptor::empty();
        m.version = 1;
        m.classes.push(ClassDescriptor {
            id: 1,
            name: "Book".to_string(),
            properties: vec![
                PropertyDescriptor {
                    id: 0,
                    name: "Title".to_string(),
                    kind: PropertyKind::Str,
                },
                PropertyDescriptor {
                    id: 1,
                    name: "Author".to_string(),
                    kind: PropertyKind::Str,
                },
            ],
            log_stream: 0,
        });
        m
    }

    fn open(dir: &std::path::Path) -> Arc<Database> {
        Database::open(
            DatabaseConfig::standalone("n1", dir),
            AssemblyBundle::for_model(book_model()),
        )
        .unwrap()
    }

    fn book(title: &str, author: &str) -> PropertyBlock {
        PropertyBlock::new(vec![
            PropertyValue::string(title),
            PropertyValue::string(author),
        ])
    }

    #[test]
    fn create_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
        let id = txn.create(1, book("Gatsby", "Fitzegarld")).unwrap();
        assert_eq!(txn.commit().unwrap(), 1);

        let mut read = db.begin(TxnKind::Read).unwrap();
        let block = read.get(id).unwrap().unwrap();
        assert_eq!(block.get(0).unwrap().as_str().as_deref(), Some("Gatsby"));
        db.shutdown();
    }

    #[test]
    fn restart_replays_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let db = open(dir.path());
            let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
            let id = txn.create(1, book("Gatsby", "Fitzegarld")).unwrap();
            txn.commit().unwrap();
            db.shutdown();
            id
        };

        let db = open(dir.path());
        assert_eq!(db.manager().current_version(), 1);
        let mut read = db.begin(TxnKind::Read).unwrap();
        let block = read.get(id).unwrap().unwrap();
        assert_eq!(
            block.get(1).unwrap().as_str().as_deref(),
            Some("Fitzegarld")
        );
        db.shutdown();
    }

    #[test]
    fn restart_after_snapshot_prunes_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let db = open(dir.path());
            let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
            let id = txn.create(1, book("One", "A")).unwrap();
            txn.commit().unwrap();
            db.snapshot_now().unwrap();

            let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
            txn.update(id, book("Two", "A")).unwrap();
            txn.commit().unwrap();
            db.shutdown();
            id
        };

        let db = open(dir.path());
        assert_eq!(db.manager().current_version(), 2);
        let mut read = db.begin(TxnKind::Read).unwrap();
        let block = read.get(id).unwrap().unwrap();
        assert_eq!(block.get(0).unwrap().as_str().as_deref(), Some("Two"));
        db.shutdown();
    }

    #[test]
    fn assembly_update_swaps_model_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let guid_before = db.model_guid();

        // Zero diff: nothing changes.
        let same = AssemblyBundle::for_model(book_model());
        assert_eq!(db.update_assemblies(same).unwrap(), UpdateOutcome::Unchanged);
        assert_eq!(db.model_guid(), guid_before);

        // A new class arrives with the updated bundle.
        let mut model = book_model();
        model.version = 2;
        model.classes.push(ClassDescriptor {
            id: 2,
            name: "Reader".to_string(),
            properties: vec![PropertyDescriptor {
                id: 0,
                name: "Name".to_string(),
                kind: PropertyKind::Str,
            }],
            log_stream: 0,
        });
        assert_eq!(
            db.update_assemblies(AssemblyBundle::for_model(model)).unwrap(),
            UpdateOutcome::Installed
        );
        assert_ne!(db.model_guid(), guid_before);

        // The new class is usable immediately.
        let mut txn = db.begin(TxnKind::ReadWrite).unwrap();
        let reader = txn
            .create(2, PropertyBlock::new(vec![PropertyValue::string("Nick")]))
            .unwrap();
        txn.commit().unwrap();
        let mut read = db.begin(TxnKind::Read).unwrap();
        assert!(read.get(reader).unwrap().is_some());
        db.shutdown();
    }

    #[test]
    fn writes_rejected_off_the_write_master() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        db.global_role().become_primary(None, false).unwrap_err();
        // Not in a global cluster: the node stays a write master.
        assert!(db.begin(TxnKind::ReadWrite).is_ok());
        db.shutdown();
    }
}
