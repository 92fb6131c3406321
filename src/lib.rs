//! A distributed atomic-operations service over a one-sided, reliable-
//! connected remote-memory transport (RDMA verbs in production,
//! [`transport::loopback`] in tests).
//!
//! Clients issue three operations — monotonic slot allocation
//! (fetch-and-add), per-slot test-and-set, and a Load-Link/Store-
//! Conditional pair — against a replicated slot array, and get linearizable
//! results under concurrent multi-node contention. Two consensus protocols
//! share the underlying quorum machinery: a Fast-Paxos broadcast CAS with a
//! classic-Paxos slow path for FAA/TAS ([`consensus::faa_tas`]), and a
//! fast-quorum ballot CAS with coordinator-driven recovery for LL/SC
//! ([`consensus::llsc`]). [`node::Node`] is the library's entry point.

pub mod ballot;
pub mod config;
pub mod consensus;
pub mod error;
pub mod membership;
pub mod memory;
pub mod node;
pub mod transport;

pub use config::ClusterConfig;
pub use error::{Error, FatalError};
pub use node::Node;
