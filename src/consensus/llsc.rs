//! Load-Link/Store-Conditional: a fast-Paxos ballot CAS with coordinator-
//! driven recovery when the fast path makes only partial progress. Grounded
//! in `rdma_llsc.c`'s `rdma_load_link`/`rdma_store_conditional`/
//! `rdma_llsc_process_recovery`.

use std::collections::HashMap;

use crate::ballot::{self, Ballot};
use crate::config::{classic_quorum, fast_quorum, Tunables};
use crate::consensus::collect_until;
use crate::error::Error;
use crate::memory::{LlScRegion, LlScSlotSnapshot, RecoveryReq, RecoveryResp};
use crate::transport::{CompletionTag, CqId, OpKind, Region, Transport};

const RECOVERY_REQ_SIZE: u64 = 6;
const RECOVERY_RESP_SIZE: usize = 19;

/// The outcome of a Store-Conditional, whether decided on the fast path or
/// after coordinated recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Won,
    Failed,
}

/// Reads the cluster-wide frontier at a classic quorum of replicas (this
/// node included) and the committed value at the highest index observed.
/// Mirrors `rdma_load_link`.
pub fn load_link(transport: &dyn Transport) -> Result<(u64, u64), Error> {
    let n = transport.n();
    let host_id = transport.host_id();
    let quorum = classic_quorum(n);

    let local = transport.local_read(Region::LlSc, LlScRegion::frontier_offset(), 8);
    let mut max_index = u64::from_ne_bytes(local.try_into().unwrap());
    let mut successes = 1;

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let tag = CompletionTag::new(0, peer, OpKind::LlScFrontierRead);
        transport.post_read(peer, Region::LlSc, LlScRegion::frontier_offset(), 8, tag)?;
        pending.insert(tag, ());
    }

    while successes < quorum && !pending.is_empty() {
        let batch = transport.poll(CqId::Consensus, pending.len())?;
        if batch.is_empty() {
            std::hint::spin_loop();
            continue;
        }
        for c in batch {
            if pending.remove(&c.tag).is_none() {
                continue;
            }
            if c.status.is_success() {
                successes += 1;
                if let Some(v) = c.payload.as_word() {
                    max_index = max_index.max(v);
                }
            }
        }
    }

    let ballot = u64::from_ne_bytes(
        transport
            .local_read(Region::LlSc, LlScRegion::slot_ballot_offset(max_index), 8)
            .try_into()
            .unwrap(),
    );
    let value = if ballot != 0 {
        u64::from_ne_bytes(
            transport
                .local_read(Region::LlSc, LlScRegion::slot_value_offset(max_index), 8)
                .try_into()
                .unwrap(),
        )
    } else {
        0
    };

    Ok((max_index, value))
}

/// Attempts to commit `value` at `index`, the pair produced by a preceding
/// [`load_link`]. Mirrors `rdma_store_conditional`.
pub fn store_conditional(transport: &dyn Transport, tunables: &Tunables, index: u64, value: u64) -> Result<StoreOutcome, Error> {
    let n = transport.n();
    let host_id = transport.host_id();
    let fast_q = fast_quorum(n);
    let ballot = ballot::generate(host_id);

    let ballot_offset = LlScRegion::slot_ballot_offset(index);
    let value_offset = LlScRegion::slot_value_offset(index);
    let frontier_offset = LlScRegion::frontier_offset();

    let local_slot_pre = transport.local_cas(Region::LlSc, ballot_offset, 0, ballot.0);
    let local_slot_won = local_slot_pre == 0;
    if local_slot_won {
        transport.local_write(Region::LlSc, value_offset, &value.to_ne_bytes());
    }
    // The local frontier CAS only bumps the next Load-Link's view; only the
    // remote frontier CAS completions feed the quorum tally below, alongside
    // the ballot CAS completions (§4 of the design).
    transport.local_cas(Region::LlSc, frontier_offset, index, index + 1);

    let mut successes = usize::from(local_slot_won);
    let mut slot_won_peers = Vec::new();

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let slot_tag = CompletionTag::new(index, peer, OpKind::LlScBallotCas);
        transport.post_cas(peer, Region::LlSc, ballot_offset, 0, ballot.0, slot_tag)?;
        pending.insert(slot_tag, ());
        let frontier_tag = CompletionTag::new(index, peer, OpKind::LlScFrontierCas);
        transport.post_cas(peer, Region::LlSc, frontier_offset, index, index + 1, frontier_tag)?;
        pending.insert(frontier_tag, ());
    }

    for c in collect_until(transport, CqId::Consensus, pending)? {
        match c.tag.kind {
            OpKind::LlScBallotCas if c.status.is_success() && c.payload.as_word() == Some(0) => {
                successes += 1;
                slot_won_peers.push(c.tag.peer);
            }
            OpKind::LlScFrontierCas if c.status.is_success() && c.payload.as_word() == Some(index) => {
                successes += 1;
            }
            _ => {}
        }
    }

    if successes >= fast_q {
        let mut pending = HashMap::new();
        for peer in slot_won_peers {
            let tag = CompletionTag::new(index, peer, OpKind::LlScValueWrite);
            transport.post_write(peer, Region::LlSc, value_offset, &value.to_ne_bytes(), tag)?;
            pending.insert(tag, ());
        }
        collect_until(transport, CqId::Consensus, pending)?;
        return Ok(StoreOutcome::Won);
    }

    if successes == 0 {
        return Ok(StoreOutcome::Failed);
    }

    request_recovery(transport, tunables, index)
}

/// Requester side of coordinated recovery: hands the pending slot off to
/// the coordinator and spins on the local response mailbox.
fn request_recovery(transport: &dyn Transport, tunables: &Tunables, index: u64) -> Result<StoreOutcome, Error> {
    let host_id = transport.host_id();
    let coordinator = tunables.coordinator_node;
    let thread_id = host_id + 1;

    transport.local_write(Region::RecoveryResp, 0, &RecoveryResp::default().to_be_bytes());

    let req = RecoveryReq {
        thread_id,
        slot: index as u32,
    };
    let offset = u64::from(host_id) * RECOVERY_REQ_SIZE;
    if coordinator == host_id {
        transport.local_write(Region::RecoveryReqs, offset, &req.to_be_bytes());
    } else {
        let tag = CompletionTag::new(index, coordinator, OpKind::RecoveryNotify);
        transport.post_write(coordinator, Region::RecoveryReqs, offset, &req.to_be_bytes(), tag)?;
        collect_until(transport, CqId::Consensus, HashMap::from([(tag, ())]))?;
    }

    for _ in 0..tunables.recovery_spin_iters {
        let buf: [u8; RECOVERY_RESP_SIZE] = transport.local_read(Region::RecoveryResp, 0, RECOVERY_RESP_SIZE).try_into().unwrap();
        let resp = RecoveryResp::from_be_bytes(buf);
        if resp.valid == 1 {
            let won = resp.thread_id == thread_id;
            transport.local_write(Region::RecoveryResp, 0, &RecoveryResp::default().to_be_bytes());
            return Ok(if won { StoreOutcome::Won } else { StoreOutcome::Failed });
        }
        std::hint::spin_loop();
    }
    Err(Error::RecoveryTimeout)
}

/// One coordinator sweep over every peer's recovery mailbox. A no-op on any
/// node that isn't the configured coordinator. Mirrors the periodic
/// invocation of `rdma_llsc_process_recovery`.
pub fn run_coordinator_sweep(transport: &dyn Transport, tunables: &Tunables) -> Result<(), Error> {
    let host_id = transport.host_id();
    if tunables.coordinator_node != host_id {
        return Ok(());
    }

    for requester in 0..transport.n() as u16 {
        let offset = u64::from(requester) * RECOVERY_REQ_SIZE;
        let buf: [u8; 6] = transport.local_read(Region::RecoveryReqs, offset, 6).try_into().unwrap();
        let req = RecoveryReq::from_be_bytes(buf);
        if req.is_empty() {
            continue;
        }
        process_recovery(transport, requester, req)?;
        transport.local_write(Region::RecoveryReqs, offset, &RecoveryReq::default().to_be_bytes());
    }
    Ok(())
}

fn process_recovery(transport: &dyn Transport, requester: u16, req: RecoveryReq) -> Result<(), Error> {
    let n = transport.n();
    let host_id = transport.host_id();
    let quorum = classic_quorum(n);
    let slot = u64::from(req.slot);
    let ballot_offset = LlScRegion::slot_ballot_offset(slot);
    let value_offset = LlScRegion::slot_value_offset(slot);

    let mut results = vec![LlScSlotSnapshot::default(); n];
    let local_ballot = u64::from_ne_bytes(transport.local_read(Region::LlSc, ballot_offset, 8).try_into().unwrap());
    let local_value = u64::from_ne_bytes(transport.local_read(Region::LlSc, value_offset, 8).try_into().unwrap());
    results[host_id as usize] = LlScSlotSnapshot {
        ballot: Ballot(local_ballot),
        value: local_value,
    };
    let mut successes = 1;

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let tag = CompletionTag::new(slot, peer, OpKind::RecoveryRead);
        transport.post_read(peer, Region::LlSc, ballot_offset, 16, tag)?;
        pending.insert(tag, ());
    }

    while successes < quorum && !pending.is_empty() {
        let batch = transport.poll(CqId::Consensus, pending.len())?;
        if batch.is_empty() {
            std::hint::spin_loop();
            continue;
        }
        for c in batch {
            if pending.remove(&c.tag).is_none() {
                continue;
            }
            if c.status.is_success() {
                successes += 1;
                if let Some(bytes) = c.payload.as_bytes() {
                    let ballot = u64::from_ne_bytes(bytes[0..8].try_into().unwrap());
                    let value = u64::from_ne_bytes(bytes[8..16].try_into().unwrap());
                    results[c.tag.peer as usize] = LlScSlotSnapshot {
                        ballot: Ballot(ballot),
                        value,
                    };
                }
            }
        }
    }

    let chosen = results
        .iter()
        .filter(|r| !r.ballot.is_empty())
        .max_by_key(|r| r.ballot)
        .copied()
        .unwrap_or(results[0]);

    let fresh = ballot::generate(host_id);
    let mut final_bytes = [0u8; 16];
    final_bytes[0..8].copy_from_slice(&fresh.0.to_ne_bytes());
    final_bytes[8..16].copy_from_slice(&chosen.value.to_ne_bytes());

    transport.local_write(Region::LlSc, ballot_offset, &final_bytes[0..8]);
    transport.local_write(Region::LlSc, value_offset, &final_bytes[8..16]);

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let tag = CompletionTag::new(slot, peer, OpKind::RecoveryFinalWrite);
        transport.post_write(peer, Region::LlSc, ballot_offset, &final_bytes, tag)?;
        pending.insert(tag, ());
    }
    collect_until(transport, CqId::Consensus, pending)?;

    // `thread_id`s are node ids offset by one so that zero can stay the
    // empty-mailbox sentinel (see `request_recovery`); translate the
    // ballot's node id into that namespace before reporting the winner.
    let winner_thread_id = if chosen.ballot.is_empty() { 0 } else { chosen.ballot.node_id() + 1 };
    let resp = RecoveryResp {
        thread_id: winner_thread_id,
        value: chosen.value,
        ballot: fresh.0,
        valid: 1,
    };
    if requester == host_id {
        transport.local_write(Region::RecoveryResp, 0, &resp.to_be_bytes());
    } else {
        let tag = CompletionTag::new(slot, requester, OpKind::RecoveryRespWrite);
        transport.post_write(requester, Region::RecoveryResp, 0, &resp.to_be_bytes(), tag)?;
        collect_until(transport, CqId::Consensus, HashMap::from([(tag, ())]))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tunables;
    use crate::transport::loopback::LoopbackCluster;

    #[test]
    fn load_link_on_an_empty_cluster_returns_slot_zero_with_no_value() {
        let cluster = LoopbackCluster::new(3, 16);
        let t = cluster.transport(0);
        let (index, value) = load_link(&t).unwrap();
        assert_eq!(index, 0);
        assert_eq!(value, 0);
    }

    #[test]
    fn store_conditional_wins_uncontested_and_advances_the_frontier_cluster_wide() {
        let cluster = LoopbackCluster::new(3, 16);
        let t0 = cluster.transport(0);
        let tunables = Tunables::default();

        let (index, _) = load_link(&t0).unwrap();
        assert_eq!(index, 0);
        let outcome = store_conditional(&t0, &tunables, index, 77).unwrap();
        assert_eq!(outcome, StoreOutcome::Won);

        let committed = u64::from_ne_bytes(
            t0.local_read(Region::LlSc, LlScRegion::slot_value_offset(0), 8).try_into().unwrap(),
        );
        assert_eq!(committed, 77);

        // The frontier CAS propagated to every replica, so the next
        // Load-Link anywhere in the cluster lands on the next free slot.
        let t1 = cluster.transport(1);
        let (next_index, next_value) = load_link(&t1).unwrap();
        assert_eq!(next_index, 1);
        assert_eq!(next_value, 0);
    }
}
