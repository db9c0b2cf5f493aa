//! Mediated access to one live sub-domain replica.
//!
//! A replica is an asynchronous, continuously-updating object, but
//! request/response callers need serialized read-after-write access and
//! a way to pull the changes since they last looked, safely across
//! process restarts. [`SubdomainClone`] provides both: an explicit
//! advisory lock layered over the engine's native write serialization,
//! and a durable update queue replayed by [`SubdomainClone::poll`].
//!
//! Updates surface through three disjoint paths under normal operation:
//! the echo of a caller's own [`SubdomainClone::write`], delivery to a
//! live [`SubdomainClone::subscribe`]r, and silent capture for a later
//! poll.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use warren_core::{Error, OwnedId, Result, Subject};

use crate::queue::UpdateQueue;
use crate::replica::{Pattern, Replica, ReplicaLock, ReplicaUpdate, UpdateStream, WriteRequest};

/// Registry subject type for sub-domains.
pub const SUBDOMAIN_TYPE: &str = "Subdomain";

/// Registry property carrying the signature-attribution policy.
pub const USE_SIGNATURES_PROP: &str = "useSignatures";

/// Default bound on waiting for the advisory lock before a stale hold is
/// forcibly released.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity and policy of a sub-domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubdomainSpec {
    /// Owning account name
    pub account: String,
    /// Sub-domain name
    pub name: String,
    /// Whether writes to this sub-domain require signature attribution.
    /// Immutable once the sub-domain is first created.
    #[serde(default)]
    pub use_signatures: bool,
}

impl SubdomainSpec {
    /// Create a spec.
    pub fn new(account: impl Into<String>, name: impl Into<String>, use_signatures: bool) -> Self {
        Self {
            account: account.into(),
            name: name.into(),
            use_signatures,
        }
    }

    /// The owned identity of this sub-domain under a gateway domain.
    pub fn owned_id(&self, gateway: &str) -> OwnedId {
        OwnedId::new(gateway, &self.account, &self.name)
    }

    /// Render as a registry subject.
    pub fn to_subject(&self) -> Subject {
        Subject::new(format!("{}/{}", self.account, self.name))
            .with_type(SUBDOMAIN_TYPE)
            .with(USE_SIGNATURES_PROP, self.use_signatures.into())
    }

    /// Reconstruct from a registry subject.
    pub fn from_subject(subject: &Subject) -> Result<Self> {
        let id = OwnedId::from_iri(&subject.id, None);
        if id.account.is_empty() || id.name.is_empty() {
            return Err(Error::bad_request(format!(
                "not a sub-domain identity: {:?}",
                subject.id
            )));
        }
        Ok(Self {
            account: id.account,
            name: id.name,
            use_signatures: subject.boolean(USE_SIGNATURES_PROP).unwrap_or(false),
        })
    }
}

/// A state delta surfaced to a consumer, carrying the number of times it
/// has been emitted. A count greater than one indicates a timeout or
/// restart has led to uncertainty whether the update was processed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubdomainUpdate {
    /// Asserted partial subjects
    pub insert: Vec<Subject>,
    /// Un-asserted partial subjects
    pub delete: Vec<Subject>,
    /// End tick of this transition
    pub tick: u64,
    /// Times this update has been surfaced to a consumer
    pub emit_count: u32,
}

impl From<ReplicaUpdate> for SubdomainUpdate {
    fn from(update: ReplicaUpdate) -> Self {
        Self {
            insert: update.insert,
            delete: update.delete,
            tick: update.tick,
            emit_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Unlocked,
    Read,
    Write,
}

struct LockState {
    kind: LockKind,
    /// Held while locked; blocks external writers of the same domain
    replica_lock: Option<Arc<ReplicaLock>>,
}

struct Inner {
    replica: Arc<dyn Replica>,
    /// Taken on close, releasing the store's file lock so a later clone
    /// of the same sub-domain can reopen the queue
    queue: Mutex<Option<UpdateQueue>>,
    state: Mutex<LockState>,
    notify: Notify,
    /// Armed during a write: updates past this tick are echoes
    echo: Mutex<Option<(u64, oneshot::Sender<SubdomainUpdate>)>>,
    subscriber: Mutex<Option<mpsc::UnboundedSender<SubdomainUpdate>>>,
    lock_timeout: Option<Duration>,
}

impl Inner {
    /// Acquire the advisory lock. `Write` re-enters an existing write
    /// hold (batched writes); `Read` is shared with an existing read
    /// hold (repeated polls). Waiters past the configured bound force
    /// the stale hold open.
    async fn acquire(&self, want: LockKind) -> Result<Arc<ReplicaLock>> {
        let deadline = self
            .lock_timeout
            .map(|t| tokio::time::Instant::now() + t);
        loop {
            // Register for wakeup before inspecting state, so a release
            // between the check and the await is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            enum Step {
                Acquire,
                Enter(Arc<ReplicaLock>),
                Wait,
            }
            let step = {
                let mut st = self.state.lock();
                match (st.kind, want) {
                    (LockKind::Unlocked, _) => {
                        st.kind = want;
                        Step::Acquire
                    }
                    (LockKind::Write, LockKind::Write) | (LockKind::Read, LockKind::Read) => {
                        match &st.replica_lock {
                            Some(lock) => Step::Enter(lock.clone()),
                            // Another acquirer is mid-flight
                            None => Step::Wait,
                        }
                    }
                    _ => Step::Wait,
                }
            };
            match step {
                Step::Acquire => match self.replica.lock().await {
                    Ok(lock) => {
                        let lock = Arc::new(lock);
                        self.state.lock().replica_lock = Some(lock.clone());
                        self.notify.notify_waiters();
                        return Ok(lock);
                    }
                    Err(e) => {
                        self.release();
                        return Err(e);
                    }
                },
                Step::Enter(lock) => return Ok(lock),
                Step::Wait => match deadline {
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            tracing::warn!(
                                domain = self.replica.domain(),
                                "advisory lock held past timeout, forcing release"
                            );
                            self.release();
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    /// Release the advisory lock without touching the queue, waking
    /// waiters. Safe to call when not locked.
    fn release(&self) {
        {
            let mut st = self.state.lock();
            st.kind = LockKind::Unlocked;
            st.replica_lock = None;
        }
        self.notify.notify_waiters();
    }

    fn with_queue<T>(&self, f: impl FnOnce(&UpdateQueue) -> Result<T>) -> Result<T> {
        let guard = self.queue.lock();
        let queue = guard
            .as_ref()
            .ok_or_else(|| Error::internal("sub-domain clone is closed"))?;
        f(queue)
    }

    /// Persist an update, incrementing its emit count when it is being
    /// surfaced to a consumer.
    fn enqueue(&self, mut update: SubdomainUpdate, emitting: bool) -> Result<SubdomainUpdate> {
        if emitting {
            update.emit_count += 1;
        }
        self.with_queue(|queue| queue.put(&update))?;
        Ok(update)
    }

    /// Route one followed update to its consumer path.
    async fn route(&self, update: ReplicaUpdate) -> Result<()> {
        let sdu = SubdomainUpdate::from(update);
        // A write in flight expects its echo: any update past the tick
        // observed before submission is one
        let echo = {
            let mut slot = self.echo.lock();
            let is_echo = matches!(&*slot, Some((before, _)) if sdu.tick > *before);
            if is_echo {
                slot.take()
            } else {
                None
            }
        };
        if let Some((_, tx)) = echo {
            let bumped = self.enqueue(sdu, true)?;
            let _ = tx.send(bumped);
            return Ok(());
        }
        let subscriber = self.subscriber.lock().clone();
        if let Some(tx) = subscriber {
            // Delivery engages the lock, so a slow subscriber
            // back-pressures remote-origin writes
            self.acquire(LockKind::Read).await?;
            let bumped = self.enqueue(sdu, true)?;
            if tx.send(bumped).is_err() {
                self.subscriber.lock().take();
                self.release();
            }
            return Ok(());
        }
        // Nobody is listening; a later poll will find it
        self.enqueue(sdu, false)?;
        Ok(())
    }
}

/// Wraps one live replica with the advisory lock and durable queue.
pub struct SubdomainClone {
    spec: SubdomainSpec,
    inner: Arc<Inner>,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl SubdomainClone {
    /// Wrap a replica, opening the durable queue at `queue_path` and
    /// following the replica for update capture. Must be called within
    /// an async runtime.
    pub fn new(
        spec: SubdomainSpec,
        replica: Arc<dyn Replica>,
        queue_path: &Path,
        lock_timeout: Option<Duration>,
    ) -> Result<Self> {
        let queue = UpdateQueue::open(queue_path)?;
        let updates = replica.follow();
        let inner = Arc::new(Inner {
            replica,
            queue: Mutex::new(Some(queue)),
            state: Mutex::new(LockState {
                kind: LockKind::Unlocked,
                replica_lock: None,
            }),
            notify: Notify::new(),
            echo: Mutex::new(None),
            subscriber: Mutex::new(None),
            lock_timeout,
        });
        let follower = tokio::spawn(follow_updates(inner.clone(), updates));
        Ok(Self {
            spec,
            inner,
            follower: Mutex::new(Some(follower)),
        })
    }

    /// The sub-domain identity and policy this clone serves.
    pub fn spec(&self) -> &SubdomainSpec {
        &self.spec
    }

    /// The replicated domain name.
    pub fn domain(&self) -> &str {
        self.inner.replica.domain()
    }

    /// The underlying replica.
    pub fn replica(&self) -> &Arc<dyn Replica> {
        &self.inner.replica
    }

    /// Latest replica tick.
    pub fn tick(&self) -> u64 {
        self.inner.replica.tick()
    }

    /// Whether the advisory lock is currently held.
    pub fn locked(&self) -> bool {
        self.inner.state.lock().kind != LockKind::Unlocked
    }

    /// Read a subject while possibly locked.
    pub async fn get(&self, id: &str) -> Result<Option<Subject>> {
        self.inner.replica.get(id).await
    }

    /// Query subjects while possibly locked.
    pub async fn query(&self, pattern: &Pattern) -> Result<Vec<Subject>> {
        self.inner.replica.query(pattern).await
    }

    /// Submit a write under the advisory lock and return its echo, or
    /// `None` for an absent or no-op request. The clone is left locked
    /// either way; locking is sticky across writes until
    /// [`SubdomainClone::unlock`], so a caller can batch several writes
    /// before other writers are unblocked.
    pub async fn write(&self, request: Option<WriteRequest>) -> Result<Option<SubdomainUpdate>> {
        let lock = self.inner.acquire(LockKind::Write).await?;
        let Some(request) = request.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        let before = self.inner.replica.tick();
        let (tx, rx) = oneshot::channel();
        *self.inner.echo.lock() = Some((before, tx));
        match self.inner.replica.apply_locked(&lock, request).await {
            // Every effective write produces exactly one echo
            Ok(after) if after != before => rx
                .await
                .map(Some)
                .map_err(|_| Error::internal("echo capture lost")),
            Ok(_) => {
                self.inner.echo.lock().take();
                Ok(None)
            }
            Err(e) => {
                self.inner.echo.lock().take();
                Err(e)
            }
        }
    }

    /// Report the update queue in tick order, re-persisting each entry
    /// with an incremented emit count before it is returned — a crash
    /// between yield and acknowledgement redelivers rather than loses.
    /// Leaves the clone locked until [`SubdomainClone::unlock`].
    pub async fn poll(&self) -> Result<Vec<SubdomainUpdate>> {
        let _lock = self.inner.acquire(LockKind::Read).await?;
        let mut out = Vec::new();
        for update in self.inner.with_queue(|queue| queue.entries())? {
            out.push(self.inner.enqueue(update, true)?);
        }
        Ok(out)
    }

    /// Attach the live subscriber. Each delivered update engages the
    /// advisory lock; the subscriber must unlock between updates.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SubdomainUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.subscriber.lock() = Some(tx);
        rx
    }

    /// Clear the persisted queue (only the queue, not replica state) and
    /// release the advisory lock, waking any blocked writer. Safe to
    /// call when not locked.
    pub async fn unlock(&self) -> Result<()> {
        self.inner.with_queue(|queue| queue.clear())?;
        self.inner.release();
        Ok(())
    }

    /// Release the advisory lock without clearing the queue, so
    /// un-acknowledged updates redeliver on the next poll. The rollback
    /// path for a caller that timed out.
    pub fn force_unlock(&self) {
        self.inner.release();
    }

    /// Number of queued, un-acknowledged updates.
    pub fn queued(&self) -> Result<usize> {
        self.inner.with_queue(|queue| queue.len())
    }

    /// Stop following, release the durable queue and shut the replica
    /// down.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.follower.lock().take() {
            handle.abort();
        }
        // Dropping the queue releases its file lock for a future clone
        self.inner.queue.lock().take();
        self.inner.replica.close().await
    }
}

impl std::fmt::Debug for SubdomainClone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubdomainClone")
            .field("spec", &self.spec)
            .field("domain", &self.inner.replica.domain())
            .field("locked", &self.locked())
            .finish()
    }
}

async fn follow_updates(inner: Arc<Inner>, mut updates: UpdateStream) {
    while let Some(update) = updates.recv().await {
        let tick = update.tick;
        if let Err(e) = inner.route(update).await {
            // Queue persistence failure: surfaced here because capture
            // is not on any caller's path; poll consumers will miss the
            // update, which is why this is loud
            tracing::error!(
                domain = inner.replica.domain(),
                tick,
                error = %e,
                "failed to capture replica update"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCloneFactory;
    use crate::replica::{CloneFactory, ReplicaConfig, ReusableConfig};
    use std::time::Duration;

    struct Fixture {
        sdc: SubdomainClone,
        external: Arc<dyn Replica>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let config = |id: &str| ReplicaConfig {
            id: id.to_string(),
            domain: "sd1.acme.ex.org".to_string(),
            genesis: true,
            reusable: ReusableConfig::default(),
        };
        let replica = factory
            .create(&config("gw"), dir.path())
            .await
            .unwrap();
        let external = factory
            .create(&config("ext"), dir.path())
            .await
            .unwrap();
        let sdc = SubdomainClone::new(
            SubdomainSpec::new("acme", "sd1", false),
            replica,
            &dir.path().join("queue.redb"),
            None,
        )
        .unwrap();
        Fixture {
            sdc,
            external,
            _dir: dir,
        }
    }

    fn fred() -> WriteRequest {
        WriteRequest::insert(Subject::new("fred").with("name", "Fred".into()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_poll_for_an_update() {
        let f = fixture().await;
        // An unmediated external write simulates a remote update
        f.external.apply(fred()).await.unwrap();
        settle().await;

        let updates = f.sdc.poll().await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].insert[0].id, "fred");
        assert_eq!(updates[0].emit_count, 1);
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_blocks_write_until_unlock() {
        let f = fixture().await;
        f.sdc.poll().await.unwrap();

        let external = f.external.clone();
        let pending = tokio::spawn(async move { external.apply(fred()).await });
        settle().await;
        assert!(!pending.is_finished());

        f.sdc.unlock().await.unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_polling_increments_emit_count() {
        let f = fixture().await;
        f.external.apply(fred()).await.unwrap();
        settle().await;

        let first = f.sdc.poll().await.unwrap();
        assert_eq!(first[0].emit_count, 1);
        // No unlock between the polls: same updates, counted again
        let second = f.sdc.poll().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].tick, first[0].tick);
        assert_eq!(second[0].emit_count, 2);
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_gets_update() {
        let f = fixture().await;
        let echo = f.sdc.write(Some(fred())).await.unwrap().unwrap();
        assert_eq!(echo.insert[0].id, "fred");
        assert_eq!(echo.insert[0].string("name").unwrap(), "Fred");
        assert_eq!(echo.emit_count, 1);
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_write_returns_none() {
        let f = fixture().await;
        assert!(f.sdc.write(None).await.unwrap().is_none());
        // A write that changes nothing is a no-op too
        f.sdc.write(Some(fred())).await.unwrap();
        assert!(f.sdc.write(Some(fred())).await.unwrap().is_none());
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_blocks_external_write_until_unlock() {
        let f = fixture().await;
        f.sdc
            .write(Some(WriteRequest::insert(
                Subject::new("wilma").with("name", "Wilma".into()),
            )))
            .await
            .unwrap();

        let external = f.external.clone();
        let pending = tokio::spawn(async move { external.apply(fred()).await });
        settle().await;
        assert!(!pending.is_finished());

        f.sdc.unlock().await.unwrap();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_writes_batch_under_sticky_lock() {
        let f = fixture().await;
        f.sdc.write(Some(fred())).await.unwrap();
        assert!(f.sdc.locked());
        // Second write re-enters the held lock
        let echo = f
            .sdc
            .write(Some(WriteRequest::insert(
                Subject::new("wilma").with("name", "Wilma".into()),
            )))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echo.tick, 2);
        f.sdc.unlock().await.unwrap();
        assert!(!f.sdc.locked());
    }

    #[tokio::test]
    async fn test_read_gets_write_before_unlock() {
        let f = fixture().await;
        f.sdc.write(Some(fred())).await.unwrap();
        assert_eq!(f.sdc.tick(), 1);
        let subject = f.sdc.get("fred").await.unwrap().unwrap();
        assert_eq!(subject.string("name").unwrap(), "Fred");
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_receives_update() {
        let f = fixture().await;
        let mut updates = f.sdc.subscribe();
        f.external.apply(fred()).await.unwrap();

        let update = updates.recv().await.unwrap();
        assert_eq!(update.insert[0].id, "fred");
        assert_eq!(update.emit_count, 1);
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_must_unlock_between_updates() {
        let f = fixture().await;
        let mut updates = f.sdc.subscribe();
        f.external.apply(fred()).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().tick, 1);

        // Second external write blocks on the delivery lock
        let external = f.external.clone();
        let pending = tokio::spawn(async move {
            external
                .apply(WriteRequest::insert(
                    Subject::new("wilma").with("name", "Wilma".into()),
                ))
                .await
        });
        settle().await;
        assert!(!pending.is_finished());

        f.sdc.unlock().await.unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(updates.recv().await.unwrap().tick, 2);
        f.sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_when_not_locked_is_harmless() {
        let f = fixture().await;
        f.sdc.unlock().await.unwrap();
        assert!(!f.sdc.locked());
    }

    #[tokio::test]
    async fn test_unlock_clears_queue_but_force_unlock_does_not() {
        let f = fixture().await;
        f.external.apply(fred()).await.unwrap();
        settle().await;
        assert_eq!(f.sdc.queued().unwrap(), 1);

        f.sdc.poll().await.unwrap();
        f.sdc.force_unlock();
        // Un-acknowledged update still queued, redelivered with a
        // higher count
        let redelivered = f.sdc.poll().await.unwrap();
        assert_eq!(redelivered[0].emit_count, 2);

        f.sdc.unlock().await.unwrap();
        assert_eq!(f.sdc.queued().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_lock_is_forced_open_after_timeout() {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicaConfig {
            id: "gw".to_string(),
            domain: "sd1.acme.ex.org".to_string(),
            genesis: true,
            reusable: ReusableConfig::default(),
        };
        let replica = factory.create(&config, dir.path()).await.unwrap();
        let sdc = SubdomainClone::new(
            SubdomainSpec::new("acme", "sd1", false),
            replica,
            &dir.path().join("queue.redb"),
            Some(Duration::from_millis(100)),
        )
        .unwrap();

        // Hold the lock and never unlock
        sdc.write(Some(fred())).await.unwrap();
        // A poll waits out the bound, then forces the stale hold open
        let updates = sdc.poll().await.unwrap();
        assert_eq!(updates.len(), 1);
        sdc.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_redelivers_across_restart() {
        let factory = MemoryCloneFactory::new();
        let dir = tempfile::tempdir().unwrap();
        let config = |id: &str| ReplicaConfig {
            id: id.to_string(),
            domain: "sd1.acme.ex.org".to_string(),
            genesis: true,
            reusable: ReusableConfig::default(),
        };
        let queue_path = dir.path().join("queue.redb");
        let spec = SubdomainSpec::new("acme", "sd1", false);
        {
            let replica = factory.create(&config("gw1"), dir.path()).await.unwrap();
            let sdc =
                SubdomainClone::new(spec.clone(), replica, &queue_path, None).unwrap();
            let external = factory.create(&config("ext"), dir.path()).await.unwrap();
            external.apply(fred()).await.unwrap();
            settle().await;
            // Poll but never acknowledge
            assert_eq!(sdc.poll().await.unwrap()[0].emit_count, 1);
            sdc.close().await.unwrap();
        }
        // "Restarted" clone on the same queue file
        let replica = factory.create(&config("gw2"), dir.path()).await.unwrap();
        let sdc = SubdomainClone::new(spec, replica, &queue_path, None).unwrap();
        let redelivered = sdc.poll().await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].emit_count, 2);
        sdc.unlock().await.unwrap();
    }

    #[test]
    fn test_subdomain_spec_subject_round_trip() {
        let spec = SubdomainSpec::new("acme", "sd1", true);
        let subject = spec.to_subject();
        assert_eq!(subject.id, "acme/sd1");
        assert_eq!(subject.typ.as_deref(), Some(SUBDOMAIN_TYPE));
        assert_eq!(SubdomainSpec::from_subject(&subject).unwrap(), spec);
    }
}
