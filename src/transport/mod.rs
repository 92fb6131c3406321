//! Transport abstraction over the one-sided atomic remote-memory transport.
//!
//! [`Transport`] is the trait both consensus engines are written against.
//! [`verbs::VerbsTransport`] is the production backend (RDMA verbs via
//! `rdma-sys`); [`loopback::LoopbackTransport`] is an in-process fake used
//! by tests so the decision logic can be exercised without real hardware.

pub mod loopback;
pub mod verbs;

use crate::error::Error;

/// Which registered memory region a remote operation targets. The
/// production backend registers each of these as a distinct `ibv_mr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    /// The FAA/TAS shared region (`frontier` + `slots[]`).
    FaaTas,
    /// The LL/SC shared region (`frontier` + `{ballot,value}` slots).
    LlSc,
    /// The coordinator's `recovery_reqs[]` mailbox array.
    RecoveryReqs,
    /// A single requester's `recovery_resp` mailbox.
    RecoveryResp,
}

/// Which completion queue an operation was posted to. Frontier FAA traffic
/// is kept on its own CQ so a slow-path burst of consensus CAS/READ traffic
/// cannot starve frontier allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CqId {
    Consensus,
    Frontier,
}

/// The kind of one-sided operation a completion tag describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// A broadcast CAS against an FAA/TAS slot (fast path).
    FaaTasCas,
    /// A prepare-phase READ of an FAA/TAS slot (slow path).
    FaaTasPrepareRead,
    /// An accept-phase CAS of an FAA/TAS slot (slow path).
    FaaTasAcceptCas,
    /// A frontier fetch-and-add.
    FrontierFaa,
    /// A CAS on an LL/SC slot's ballot field.
    LlScBallotCas,
    /// A CAS on the LL/SC frontier.
    LlScFrontierCas,
    /// A READ of a peer's LL/SC frontier (Load-Link).
    LlScFrontierRead,
    /// A WRITE of the committed value after a winning ballot CAS.
    LlScValueWrite,
    /// A READ of an LL/SC slot during coordinated recovery.
    RecoveryRead,
    /// A WRITE of the coordinator's final decision to a replica.
    RecoveryFinalWrite,
    /// A WRITE notifying the coordinator of a pending recovery.
    RecoveryNotify,
    /// A WRITE of the coordinator's decision into a requester's mailbox.
    RecoveryRespWrite,
}

impl OpKind {
    /// Which CQ an operation of this kind lands on.
    #[must_use]
    pub fn cq(self) -> CqId {
        match self {
            OpKind::FrontierFaa => CqId::Frontier,
            _ => CqId::Consensus,
        }
    }

    /// Packs this kind into a single byte, for embedding in a `wr_id`.
    #[must_use]
    pub fn to_tag_byte(self) -> u8 {
        match self {
            OpKind::FaaTasCas => 0,
            OpKind::FaaTasPrepareRead => 1,
            OpKind::FaaTasAcceptCas => 2,
            OpKind::FrontierFaa => 3,
            OpKind::LlScBallotCas => 4,
            OpKind::LlScFrontierCas => 5,
            OpKind::LlScFrontierRead => 6,
            OpKind::LlScValueWrite => 7,
            OpKind::RecoveryRead => 8,
            OpKind::RecoveryFinalWrite => 9,
            OpKind::RecoveryNotify => 10,
            OpKind::RecoveryRespWrite => 11,
        }
    }

    /// Unpacks a byte produced by [`OpKind::to_tag_byte`].
    #[must_use]
    pub fn from_tag_byte(b: u8) -> OpKind {
        match b {
            0 => OpKind::FaaTasCas,
            1 => OpKind::FaaTasPrepareRead,
            2 => OpKind::FaaTasAcceptCas,
            3 => OpKind::FrontierFaa,
            4 => OpKind::LlScBallotCas,
            5 => OpKind::LlScFrontierCas,
            6 => OpKind::LlScFrontierRead,
            7 => OpKind::LlScValueWrite,
            8 => OpKind::RecoveryRead,
            9 => OpKind::RecoveryFinalWrite,
            10 => OpKind::RecoveryNotify,
            _ => OpKind::RecoveryRespWrite,
        }
    }
}

/// A typed completion tag: which slot, which peer, and what kind of
/// operation completed. Deliberately not a bag-of-bits `u64` (§9).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompletionTag {
    pub slot: u64,
    pub peer: u16,
    pub kind: OpKind,
}

impl CompletionTag {
    #[must_use]
    pub fn new(slot: u64, peer: u16, kind: OpKind) -> Self {
        Self { slot, peer, kind }
    }
}

/// Status of a completed work request. A small, closed set rather than the
/// full `ibv_wc_status` enum, since the engines only ever distinguish
/// "succeeded" from "failed".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WcStatus {
    Success,
    RemoteAccessError,
    RetryExceeded,
    LocalError,
    Other,
}

impl WcStatus {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

/// The payload carried back by a completed one-sided operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// The pre-image of a CAS/FAA, or the result of an 8-byte READ.
    Word(u64),
    /// The result of a READ wider than 8 bytes.
    Bytes(Vec<u8>),
    /// A WRITE carries no response payload.
    None,
}

impl Payload {
    #[must_use]
    pub fn as_word(&self) -> Option<u64> {
        match self {
            Payload::Word(w) => Some(*w),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// A single completion queue entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub tag: CompletionTag,
    pub status: WcStatus,
    pub payload: Payload,
}

/// One-sided atomic transport to the rest of the cluster.
///
/// All `post_*` calls are non-blocking: they enqueue a work request and
/// return immediately. The caller later drains [`Transport::poll`] for the
/// corresponding [`CqId`] to discover completions, matched back to their
/// request by [`CompletionTag`] (completion order across peers is
/// unspecified).
pub trait Transport: Send + Sync {
    /// Posts a 64-bit compare-and-swap against `region[offset]` on `peer`.
    fn post_cas(
        &self,
        peer: u16,
        region: Region,
        offset: u64,
        compare: u64,
        swap: u64,
        tag: CompletionTag,
    ) -> Result<(), Error>;

    /// Posts a 64-bit fetch-and-add against `region[offset]` on `peer`.
    fn post_faa(&self, peer: u16, region: Region, offset: u64, add: u64, tag: CompletionTag) -> Result<(), Error>;

    /// Posts a READ of `len` bytes from `region[offset]` on `peer`.
    fn post_read(&self, peer: u16, region: Region, offset: u64, len: usize, tag: CompletionTag) -> Result<(), Error>;

    /// Posts a WRITE of `data` into `region[offset]` on `peer`.
    fn post_write(&self, peer: u16, region: Region, offset: u64, data: &[u8], tag: CompletionTag) -> Result<(), Error>;

    /// Drains up to `max` completions from `cq`. May return fewer than
    /// `max`, including zero, without implying failure.
    fn poll(&self, cq: CqId, max: usize) -> Result<Vec<Completion>, Error>;

    /// Number of nodes in the cluster (including this one).
    fn n(&self) -> usize;

    /// This node's rank.
    fn host_id(&self) -> u16;

    /// A local 64-bit CAS against this node's own region, returning the
    /// pre-image. Unlike `post_cas`, this never crosses the network: it is
    /// the hardware-atomic counterpart the design notes require to stay
    /// coherent with the remote atomic of the same width and alignment.
    fn local_cas(&self, region: Region, offset: u64, compare: u64, swap: u64) -> u64;

    /// A local 64-bit fetch-and-add against this node's own region,
    /// returning the pre-image.
    fn local_faa(&self, region: Region, offset: u64, add: u64) -> u64;

    /// A local read of `len` bytes from this node's own region.
    fn local_read(&self, region: Region, offset: u64, len: usize) -> Vec<u8>;

    /// A local write of `data` into this node's own region.
    fn local_write(&self, region: Region, offset: u64, data: &[u8]);
}
