//! Crate-wide error taxonomy.
//!
//! Transient errors (transport failures, unreached quorums) are absorbed by
//! the node facade's retry loops and only ever logged. Terminal errors
//! (out-of-space, recovery timeout, admission control) are returned to the
//! caller. Configuration and bootstrap errors are fatal and propagate out of
//! `main` via `anyhow`/`color-eyre`.

use thiserror::Error;

use crate::transport::WcStatus;

/// Errors produced by the consensus engine, transport, and node facade.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A posted work request completed with a non-success status.
    #[error("transport operation failed: {0:?}")]
    Transport(WcStatus),

    /// The frontier has reached `MAX_SLOTS`; no more slots can be allocated.
    #[error("cluster is out of slots")]
    OutOfSpace,

    /// An LL/SC coordinated recovery exceeded its spin budget.
    #[error("recovery timed out waiting for coordinator")]
    RecoveryTimeout,

    /// More concurrent requests were admitted than `MAX_CONCURRENT_REQ` allows.
    #[error("too many concurrent requests (limit is {0})")]
    TooManyConcurrentRequests(usize),

    /// A Store-Conditional was attempted without a preceding Load-Link.
    #[error("store-conditional attempted without a prior load-link")]
    NoLoadLink,
}

/// Fatal errors that abort node startup before any client is served.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to load cluster configuration: {0}")]
    Config(String),

    #[error("RDMA/TCP bootstrap failed: {0}")]
    Bootstrap(String),
}
