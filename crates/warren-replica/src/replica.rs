//! The replica engine contract.
//!
//! The replication engine itself — creation, merge and transport of a
//! replica — is an external collaborator. This module defines the
//! narrow surface the gateway consumes: subject reads, serialized
//! writes, an ordered update stream, and lifecycle. The gateway never
//! inspects replica internals beyond tick numbers and insert/delete
//! subject sets.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use warren_core::{Iri, Result, Subject};

/// A pattern over graph subjects: identity, type and property-contains
/// constraints, all optional and conjunctive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Required subject identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Iri>,
    /// Required subject type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    /// Property values the subject must contain
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contains: Vec<(String, Value)>,
}

impl Pattern {
    /// Match a specific subject identity.
    pub fn id(iri: impl Into<Iri>) -> Self {
        Self {
            id: Some(iri.into()),
            ..Self::default()
        }
    }

    /// Match subjects of a type.
    pub fn typ(typ: impl Into<String>) -> Self {
        Self {
            typ: Some(typ.into()),
            ..Self::default()
        }
    }

    /// Builder: require a property to contain a value.
    pub fn containing(mut self, prop: impl Into<String>, value: Value) -> Self {
        self.contains.push((prop.into(), value));
        self
    }

    /// Whether a subject satisfies every constraint of this pattern.
    pub fn matches(&self, subject: &Subject) -> bool {
        if let Some(id) = &self.id {
            if &subject.id != id {
                return false;
            }
        }
        if let Some(typ) = &self.typ {
            if subject.typ.as_deref() != Some(typ.as_str()) {
                return false;
            }
        }
        self.contains
            .iter()
            .all(|(prop, value)| value_present(subject, prop, value))
    }
}

/// Property containment, treating a reference object and its bare IRI
/// string as equivalent.
fn value_present(subject: &Subject, prop: &str, value: &Value) -> bool {
    let wanted_iri = ref_iri(value);
    subject.values(prop).into_iter().any(|v| {
        v == value
            || match (ref_iri(v), &wanted_iri) {
                (Some(actual), Some(wanted)) => actual == *wanted,
                _ => false,
            }
    })
}

fn ref_iri(value: &Value) -> Option<&str> {
    match value {
        Value::String(iri) => Some(iri),
        Value::Object(obj) => obj.get("@id").and_then(Value::as_str),
        _ => None,
    }
}

/// A write against replica state: partial subjects to un-assert and to
/// assert. Multi-valued properties merge with set semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Partial subjects whose property values are removed
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub delete: Vec<Subject>,
    /// Partial subjects whose property values are added
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub insert: Vec<Subject>,
}

impl WriteRequest {
    /// A request asserting one subject.
    pub fn insert(subject: Subject) -> Self {
        Self {
            insert: vec![subject],
            ..Self::default()
        }
    }

    /// A request un-asserting one subject.
    pub fn delete(subject: Subject) -> Self {
        Self {
            delete: vec![subject],
            ..Self::default()
        }
    }

    /// Builder: also assert a subject.
    pub fn with_insert(mut self, subject: Subject) -> Self {
        self.insert.push(subject);
        self
    }

    /// Builder: also un-assert a subject.
    pub fn with_delete(mut self, subject: Subject) -> Self {
        self.delete.push(subject);
        self
    }

    /// Whether this request asserts or un-asserts nothing.
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.delete.is_empty()
    }
}

/// An observed state delta: the subjects actually inserted and deleted,
/// and the tick the replica ended on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaUpdate {
    /// Asserted partial subjects
    pub insert: Vec<Subject>,
    /// Un-asserted partial subjects
    pub delete: Vec<Subject>,
    /// End tick of this transition
    pub tick: u64,
}

/// Ordered stream of replica updates, as returned by [`Replica::follow`].
pub type UpdateStream = mpsc::UnboundedReceiver<ReplicaUpdate>;

/// An exclusive hold on a replica's native write serialization. Other
/// writers of the same domain block until this token is dropped.
pub struct ReplicaLock {
    _guard: Box<dyn Any + Send + Sync>,
}

impl ReplicaLock {
    /// Wrap an engine-specific guard object.
    pub fn new(guard: impl Any + Send + Sync) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for ReplicaLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReplicaLock")
    }
}

/// A live local replica of a domain.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Unique id of this clone instance.
    fn id(&self) -> &str;

    /// The replicated domain name.
    fn domain(&self) -> &str;

    /// Monotonic per-replica sequence number of the latest transition.
    fn tick(&self) -> u64;

    /// Read a single subject by identity.
    async fn get(&self, id: &str) -> Result<Option<Subject>>;

    /// Read all subjects matching a pattern.
    async fn query(&self, pattern: &Pattern) -> Result<Vec<Subject>>;

    /// Whether any subject matches a pattern.
    async fn ask(&self, pattern: &Pattern) -> Result<bool>;

    /// Acquire the engine's native write serialization. The returned
    /// token blocks every other writer of this domain until dropped.
    async fn lock(&self) -> Result<ReplicaLock>;

    /// Apply a write, serializing internally. Returns the tick after
    /// application; unchanged when the write was a no-op.
    async fn apply(&self, request: WriteRequest) -> Result<u64>;

    /// Apply a write under a lock the caller already holds. The token
    /// must have been acquired from this replica.
    async fn apply_locked(&self, lock: &ReplicaLock, request: WriteRequest) -> Result<u64>;

    /// Subscribe to the ordered stream of state transitions.
    fn follow(&self) -> UpdateStream;

    /// Resolve when the replica is online and usable.
    async fn online(&self) -> Result<()>;

    /// Shut the replica down and release its resources.
    async fn close(&self) -> Result<()>;
}

/// Configuration for creating one replica clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Unique clone instance id
    pub id: String,
    /// Domain to replicate
    pub domain: String,
    /// Whether this clone originates the domain
    pub genesis: bool,
    /// Transport tuning, passed through to the engine
    #[serde(flatten)]
    pub reusable: ReusableConfig,
}

/// The subset of engine configuration that can be re-used by other
/// clones of the same domains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReusableConfig {
    /// Network timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_timeout: Option<u64>,
    /// Maximum replication operation size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_operation_size: Option<usize>,
    /// Engine log level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Transport configuration handed to a client that will clone a domain
/// independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Domain to replicate
    pub domain: String,
    /// Whether the client clone originates the domain
    pub genesis: bool,
    /// Shared engine tuning
    #[serde(flatten)]
    pub reusable: ReusableConfig,
}

/// Creates replica clones for the gateway.
#[async_trait]
pub trait CloneFactory: Send + Sync {
    /// Create (or re-attach) a clone per the given configuration, with
    /// its persistent state under `data_dir`.
    async fn create(&self, config: &ReplicaConfig, data_dir: &Path) -> Result<Arc<dyn Replica>>;

    /// The configuration subset shareable with client clones.
    fn reusable_config(&self) -> ReusableConfig;
}
