//! # Warren Core
//!
//! Foundation types shared by every Warren crate: the unified error
//! system, account-owned sub-domain identity, and the loosely-typed
//! graph-subject data model used by the tenant registry and sub-domain
//! replicas.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod owned_id;
pub mod subject;

pub use error::{Error, Result};
pub use owned_id::OwnedId;
pub use subject::{reference, Iri, Subject};
