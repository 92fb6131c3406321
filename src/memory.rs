//! The replicated, remotely-addressable shared memory layout.
//!
//! The transport backends (`loopback`, `verbs`) own the actual region
//! storage, as plain byte buffers registered for remote read/write/atomic
//! access: a byte-exact layout is what every one-sided RDMA operation
//! addresses, so there is no benefit to a typed `AtomicU64` mirror on this
//! side of the trait. [`SharedRegion`] and [`LlScRegion`] are therefore
//! marker types that exist only to namespace the byte-offset arithmetic
//! those layouts share across every node; the layout itself must match
//! across all nodes and must never move once registered.

use crate::ballot::Ballot;

/// Namespaces byte-offset arithmetic for the FAA/TAS shared region: one
/// frontier counter plus `MAX_SLOTS` single-word slot records (§3: value
/// `0` = empty, non-zero = a winning ballot whose low 16 bits are the
/// winner's node id).
pub struct SharedRegion;

impl SharedRegion {
    /// Byte offset of `slots[index]` within this region, for remote
    /// addressing. Mirrors the C source's
    /// `offsetof(shared_mem, slots) + index * sizeof(uint64_t)`.
    #[must_use]
    pub fn slot_offset(index: u64) -> u64 {
        FRONTIER_FIELD_SIZE + index * std::mem::size_of::<u64>() as u64
    }

    /// Byte offset of the `frontier` field (always zero: it is the first
    /// field of the region).
    #[must_use]
    pub fn frontier_offset() -> u64 {
        0
    }

    /// Decodes a committed FAA/TAS slot value into its winning node id,
    /// or `None` if the slot is still empty.
    #[must_use]
    pub fn decode_winner(raw: u64) -> Option<u16> {
        if raw == 0 {
            None
        } else {
            Some((raw & 0xFFFF) as u16)
        }
    }
}

const FRONTIER_FIELD_SIZE: u64 = std::mem::size_of::<u64>() as u64;

/// A snapshot of one LL/SC slot's `{ballot, value}` record, as read over
/// the wire or via a local/remote READ completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LlScSlotSnapshot {
    pub ballot: Ballot,
    pub value: u64,
}

/// Namespaces byte-offset arithmetic for the LL/SC shared region: a
/// replicated frontier plus `MAX_SLOTS` `{ballot, value}` records.
pub struct LlScRegion;

impl LlScRegion {
    #[must_use]
    pub fn frontier_offset() -> u64 {
        0
    }

    /// Byte offset of `slots[index].ballot`.
    #[must_use]
    pub fn slot_ballot_offset(index: u64) -> u64 {
        FRONTIER_FIELD_SIZE + index * LLSC_SLOT_SIZE
    }

    /// Byte offset of `slots[index].value`.
    #[must_use]
    pub fn slot_value_offset(index: u64) -> u64 {
        Self::slot_ballot_offset(index) + std::mem::size_of::<u64>() as u64
    }
}

const LLSC_SLOT_SIZE: u64 = 2 * std::mem::size_of::<u64>() as u64;

/// A pending LL/SC recovery request, deposited by a requester into the
/// coordinator's `recovery_reqs[requester_id]` mailbox.
///
/// `thread_id == 0` is the empty sentinel; requesters therefore encode their
/// node id as `node_id + 1` so that node 0 can also issue recoveries.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReq {
    pub thread_id: u16,
    pub slot: u32,
}

impl RecoveryReq {
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.thread_id == 0
    }

    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0..2].copy_from_slice(&self.thread_id.to_be_bytes());
        buf[2..6].copy_from_slice(&self.slot.to_be_bytes());
        buf
    }

    #[must_use]
    pub fn from_be_bytes(buf: [u8; 6]) -> Self {
        Self {
            thread_id: u16::from_be_bytes([buf[0], buf[1]]),
            slot: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        }
    }
}

/// The coordinator's decision, deposited back into the requester's
/// single-entry `recovery_resp` mailbox.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryResp {
    pub thread_id: u16,
    pub value: u64,
    pub ballot: u64,
    pub valid: u8,
}

impl RecoveryResp {
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 19] {
        let mut buf = [0u8; 19];
        buf[0..2].copy_from_slice(&self.thread_id.to_be_bytes());
        buf[2..10].copy_from_slice(&self.value.to_be_bytes());
        buf[10..18].copy_from_slice(&self.ballot.to_be_bytes());
        buf[18] = self.valid;
        buf
    }

    #[must_use]
    pub fn from_be_bytes(buf: [u8; 19]) -> Self {
        Self {
            thread_id: u16::from_be_bytes([buf[0], buf[1]]),
            value: u64::from_be_bytes(buf[2..10].try_into().unwrap()),
            ballot: u64::from_be_bytes(buf[10..18].try_into().unwrap()),
            valid: buf[18],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_offsets_are_monotonic_and_word_aligned() {
        assert_eq!(SharedRegion::slot_offset(0) % 8, 0);
        assert!(SharedRegion::slot_offset(1) > SharedRegion::slot_offset(0));
        assert_eq!(
            SharedRegion::slot_offset(1) - SharedRegion::slot_offset(0),
            8
        );
    }

    #[test]
    fn llsc_offsets_separate_ballot_and_value() {
        let b0 = LlScRegion::slot_ballot_offset(0);
        let v0 = LlScRegion::slot_value_offset(0);
        assert_eq!(v0 - b0, 8);
        let b1 = LlScRegion::slot_ballot_offset(1);
        assert_eq!(b1 - b0, 16);
    }

    #[test]
    fn recovery_req_roundtrips_over_the_wire() {
        let req = RecoveryReq { thread_id: 42, slot: 7 };
        assert_eq!(RecoveryReq::from_be_bytes(req.to_be_bytes()), req);
    }

    #[test]
    fn recovery_resp_roundtrips_over_the_wire() {
        let resp = RecoveryResp {
            thread_id: 3,
            value: 0xDEAD_BEEF,
            ballot: 0x1234_5678_9ABC,
            valid: 1,
        };
        assert_eq!(RecoveryResp::from_be_bytes(resp.to_be_bytes()), resp);
    }

    #[test]
    fn decode_winner_handles_empty_and_committed_slots() {
        assert_eq!(SharedRegion::decode_winner(0), None);
        assert_eq!(SharedRegion::decode_winner((123u64 << 16) | 5), Some(5));
    }
}
