//! # Warren Replica
//!
//! The replica side of the Warren gateway: the contract consumed from
//! the external replication engine, an in-process engine for tests and
//! single-process deployments, the durable update queue, the
//! [`SubdomainClone`] lock-and-queue mediator, and the bounded
//! [`SubdomainCache`] of live clones.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod clone;
pub mod memory;
pub mod queue;
pub mod replica;

pub use cache::SubdomainCache;
pub use clone::{
    SubdomainClone, SubdomainSpec, SubdomainUpdate, DEFAULT_LOCK_TIMEOUT, SUBDOMAIN_TYPE,
    USE_SIGNATURES_PROP,
};
pub use memory::{MemoryCloneFactory, MemoryReplica};
pub use queue::{tick_key, UpdateQueue};
pub use replica::{
    CloneFactory, Pattern, Replica, ReplicaConfig, ReplicaLock, ReplicaUpdate, ReusableConfig,
    TransportConfig, UpdateStream, WriteRequest,
};
