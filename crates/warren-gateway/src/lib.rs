//! # Warren Gateway
//!
//! Multi-tenant control plane for a fleet of independently-replicated
//! data domains. The gateway manages account and key lifecycle, creates
//! and caches live sub-domain clones on demand, mediates
//! request/response access to them through a lock-and-queue protocol,
//! and authorizes every access against a hierarchical capability model
//! supporting individual keys, organizational admins, bearer tokens and
//! per-user signing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod account;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod principal;
pub mod statements;

pub use account::{
    AccessPolicy, AccessRequest, Account, AccountContext, AccountPatch, AccountUpdate,
    DefaultAccessPolicy, KeyOptions, RemotesAuthType, SubdomainNaming,
};
pub use auth::{Authorization, Who};
pub use config::{GatewayConfig, SmtpConfig};
pub use gateway::Gateway;
pub use principal::GatewayPrincipal;
