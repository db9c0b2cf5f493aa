//! In-process replica engine.
//!
//! Clones of the same domain share a hub: one graph, one tick counter,
//! one write gate and one follower set. A write through any clone is
//! observed by every clone's followers, which is how the tests (and
//! single-process deployments) exercise remote-origin updates without a
//! network transport.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use warren_core::{Error, Iri, Result, Subject};

use crate::replica::{
    CloneFactory, Pattern, Replica, ReplicaConfig, ReplicaLock, ReplicaUpdate, ReusableConfig,
    UpdateStream, WriteRequest,
};

/// Shared state of one domain across all its in-process clones.
struct DomainHub {
    graph: RwLock<BTreeMap<Iri, Subject>>,
    tick: AtomicU64,
    gate: Arc<tokio::sync::Mutex<()>>,
    followers: Mutex<Vec<mpsc::UnboundedSender<ReplicaUpdate>>>,
}

impl DomainHub {
    fn new() -> Self {
        Self {
            graph: RwLock::new(BTreeMap::new()),
            tick: AtomicU64::new(0),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            followers: Mutex::new(Vec::new()),
        }
    }

    /// Apply a write to the graph, returning the actually-applied delta.
    /// A request that changes nothing does not bump the tick.
    fn apply(&self, request: WriteRequest) -> Option<ReplicaUpdate> {
        let mut graph = self.graph.write();
        let mut deleted = Vec::new();
        let mut inserted = Vec::new();

        for del in &request.delete {
            let Some(existing) = graph.get_mut(&del.id) else {
                continue;
            };
            let mut removed = Subject::new(&del.id);
            if del.typ.is_some() && del.typ == existing.typ {
                existing.typ = None;
                removed.typ.clone_from(&del.typ);
            }
            for (prop, _) in del.properties.clone() {
                for value in del.values(&prop).into_iter().cloned().collect::<Vec<_>>() {
                    if existing.remove_value(&prop, &value) {
                        removed.insert_value(&prop, value);
                    }
                }
            }
            if existing.is_empty() {
                graph.remove(&del.id);
            }
            if !removed.is_empty() {
                deleted.push(removed);
            }
        }

        for ins in &request.insert {
            let existing = graph
                .entry(ins.id.clone())
                .or_insert_with(|| Subject::new(&ins.id));
            let mut added = Subject::new(&ins.id);
            if existing.typ.is_none() && ins.typ.is_some() {
                existing.typ.clone_from(&ins.typ);
                added.typ.clone_from(&ins.typ);
            }
            for (prop, _) in ins.properties.clone() {
                for value in ins.values(&prop).into_iter().cloned().collect::<Vec<_>>() {
                    if existing.insert_value(&prop, value.clone()) {
                        added.insert_value(&prop, value);
                    }
                }
            }
            if added.is_empty() {
                // Nothing asserted; do not leave a bare identity behind
                if graph.get(&ins.id).is_some_and(Subject::is_empty) {
                    graph.remove(&ins.id);
                }
            } else {
                inserted.push(added);
            }
        }

        if deleted.is_empty() && inserted.is_empty() {
            return None;
        }
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let update = ReplicaUpdate {
            insert: inserted,
            delete: deleted,
            tick,
        };
        drop(graph);
        self.broadcast(&update);
        Some(update)
    }

    fn broadcast(&self, update: &ReplicaUpdate) {
        self.followers
            .lock()
            .retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// One clone handle onto a shared in-process domain.
pub struct MemoryReplica {
    id: String,
    domain: String,
    hub: Arc<DomainHub>,
    closed: AtomicBool,
}

impl MemoryReplica {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::internal(format!(
                "replica {} of {} is closed",
                self.id, self.domain
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    fn id(&self) -> &str {
        &self.id
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    fn tick(&self) -> u64 {
        self.hub.tick.load(Ordering::SeqCst)
    }

    async fn get(&self, id: &str) -> Result<Option<Subject>> {
        self.check_open()?;
        Ok(self.hub.graph.read().get(id).cloned())
    }

    async fn query(&self, pattern: &Pattern) -> Result<Vec<Subject>> {
        self.check_open()?;
        Ok(self
            .hub
            .graph
            .read()
            .values()
            .filter(|s| pattern.matches(s))
            .cloned()
            .collect())
    }

    async fn ask(&self, pattern: &Pattern) -> Result<bool> {
        self.check_open()?;
        Ok(self.hub.graph.read().values().any(|s| pattern.matches(s)))
    }

    async fn lock(&self) -> Result<ReplicaLock> {
        self.check_open()?;
        let guard = self.hub.gate.clone().lock_owned().await;
        Ok(ReplicaLock::new(guard))
    }

    async fn apply(&self, request: WriteRequest) -> Result<u64> {
        let lock = self.lock().await?;
        self.apply_locked(&lock, request).await
    }

    async fn apply_locked(&self, _lock: &ReplicaLock, request: WriteRequest) -> Result<u64> {
        self.check_open()?;
        self.hub.apply(request);
        Ok(self.tick())
    }

    fn follow(&self) -> UpdateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.followers.lock().push(tx);
        rx
    }

    async fn online(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for in-process replicas. Holds the hub for every domain it
/// has ever created, so re-attaching clones see existing state.
pub struct MemoryCloneFactory {
    hubs: Mutex<HashMap<String, Arc<DomainHub>>>,
    reusable: ReusableConfig,
}

impl MemoryCloneFactory {
    /// Create a factory with default engine tuning.
    pub fn new() -> Self {
        Self::with_config(ReusableConfig::default())
    }

    /// Create a factory with the given shareable tuning.
    pub fn with_config(reusable: ReusableConfig) -> Self {
        Self {
            hubs: Mutex::new(HashMap::new()),
            reusable,
        }
    }
}

impl Default for MemoryCloneFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloneFactory for MemoryCloneFactory {
    async fn create(&self, config: &ReplicaConfig, _data_dir: &Path) -> Result<Arc<dyn Replica>> {
        let hub = self
            .hubs
            .lock()
            .entry(config.domain.clone())
            .or_insert_with(|| Arc::new(DomainHub::new()))
            .clone();
        Ok(Arc::new(MemoryReplica {
            id: config.id.clone(),
            domain: config.domain.clone(),
            hub,
            closed: AtomicBool::new(false),
        }))
    }

    fn reusable_config(&self) -> ReusableConfig {
        self.reusable.clone()
    }
}
