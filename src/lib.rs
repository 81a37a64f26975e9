//! metafleet - provisions tenant masters and connects them back to a
//! coordinator over mutually authenticated TLS
//!
//! Layout:
//! - `master`: organizations, per-master state machine, registry, persistence
//! - `events`: lifecycle events and the listener registry
//! - `backend`: provisioning backends (cloud pools, node pools)
//! - `scheduler`: the reconciliation loop that starts and stops masters
//! - `protocol`: the agent handshake, channels and identities
//! - `coordinator`: wires the above together and decides who may connect
//! - `http`, `cli`, `config`, `observability`: the outer surfaces

pub mod backend;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod http;
pub mod master;
pub mod observability;
pub mod protocol;
pub mod scheduler;
