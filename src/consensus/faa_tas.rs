//! FAA/TAS consensus: a Fast-Paxos broadcast CAS, falling back to a
//! classic-Paxos prepare/accept round when the fast path is indeterminate.
//! Grounded in `atomic.c`'s `rdma_bcas`/`rdma_slow_path`.

use std::collections::HashMap;

use crate::config::{classic_quorum, fast_quorum};
use crate::consensus::collect_until;
use crate::error::Error;
use crate::memory::SharedRegion;
use crate::transport::{CompletionTag, CqId, OpKind, Region, Transport};

/// The result of a fast-path or slow-path round on a single slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOutcome {
    /// This node's proposal won the slot.
    Won,
    /// Another node's proposal won the slot.
    Lost,
    /// No quorum either way; the caller should retry.
    Indeterminate,
}

/// Broadcasts `CAS(slot, 0, swap)` to every replica and decides by fast
/// quorum. `swap` is a ballot for FAA, or the constant `1` for TAS.
pub fn fast_path(transport: &dyn Transport, slot: u64, swap: u64) -> Result<PathOutcome, Error> {
    let n = transport.n();
    let host_id = transport.host_id();
    let offset = SharedRegion::slot_offset(slot);
    let quorum = fast_quorum(n);

    let local_result = transport.local_cas(Region::FaaTas, offset, 0, swap);
    let local_won = local_result == 0;
    let mut successes = usize::from(local_won);
    let mut failures = usize::from(!local_won);

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let tag = CompletionTag::new(slot, peer, OpKind::FaaTasCas);
        transport.post_cas(peer, Region::FaaTas, offset, 0, swap, tag)?;
        pending.insert(tag, ());
    }

    while !pending.is_empty() {
        if successes >= quorum || failures > n - quorum {
            break;
        }
        let batch = transport.poll(CqId::Consensus, pending.len())?;
        if batch.is_empty() {
            std::hint::spin_loop();
            continue;
        }
        for c in batch {
            if pending.remove(&c.tag).is_none() {
                continue;
            }
            if c.status.is_success() && c.payload.as_word() == Some(0) {
                successes += 1;
            } else {
                failures += 1;
            }
        }
    }

    if successes >= quorum {
        Ok(if local_won { PathOutcome::Won } else { PathOutcome::Lost })
    } else {
        Ok(PathOutcome::Indeterminate)
    }
}

/// One replica's reported slot ballot during the prepare phase.
#[derive(Clone, Copy, Debug, Default)]
struct PrepResult {
    ballot: u64,
    success: bool,
}

/// Classic-Paxos recovery round for `slot`: prepare (read every replica's
/// current value), then accept (CAS the highest surviving value into every
/// replica). Mirrors `rdma_slow_path`.
pub fn slow_path(transport: &dyn Transport, slot: u64, ballot: u64, proposed_value: u64) -> Result<PathOutcome, Error> {
    let n = transport.n();
    let host_id = transport.host_id();
    let offset = SharedRegion::slot_offset(slot);
    let fast_q = fast_quorum(n);
    let classic_q = classic_quorum(n);

    let mut results = vec![PrepResult::default(); n];
    let local = transport.local_read(Region::FaaTas, offset, 8);
    results[host_id as usize] = PrepResult {
        ballot: u64::from_ne_bytes(local.try_into().unwrap()),
        success: true,
    };

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let tag = CompletionTag::new(slot, peer, OpKind::FaaTasPrepareRead);
        transport.post_read(peer, Region::FaaTas, offset, 8, tag)?;
        pending.insert(tag, ());
    }
    for c in collect_until(transport, CqId::Consensus, pending)? {
        let peer = c.tag.peer as usize;
        if c.status.is_success() {
            results[peer] = PrepResult {
                ballot: c.payload.as_word().unwrap_or(0),
                success: true,
            };
        }
    }

    // A fast quorum may already agree on a single non-empty value.
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for r in &results {
        if r.success && r.ballot > 0 {
            *counts.entry(r.ballot).or_insert(0) += 1;
        }
    }
    for (value, count) in &counts {
        if *count >= fast_q {
            let owner = SharedRegion::decode_winner(*value).unwrap_or(host_id);
            return Ok(if owner == host_id { PathOutcome::Won } else { PathOutcome::Lost });
        }
    }

    // Classic promise phase: a promise is any replica whose ballot we've
    // already superseded.
    let mut promises = 0;
    let mut highest_ballot = 0u64;
    for r in &results {
        if r.success && ballot >= r.ballot {
            promises += 1;
            if r.ballot > highest_ballot {
                highest_ballot = r.ballot;
            }
        }
    }
    if promises < classic_q {
        return Ok(PathOutcome::Indeterminate);
    }

    let proposal = if highest_ballot > 0 { highest_ballot } else { proposed_value };
    let cmp = results[host_id as usize].ballot;
    let local_accept = transport.local_cas(Region::FaaTas, offset, cmp, proposal);
    let mut accepts = usize::from(local_accept == cmp);

    let mut pending = HashMap::new();
    for peer in 0..n as u16 {
        if peer == host_id {
            continue;
        }
        let expected = results[peer as usize].ballot;
        let tag = CompletionTag::new(slot, peer, OpKind::FaaTasAcceptCas);
        transport.post_cas(peer, Region::FaaTas, offset, expected, proposal, tag)?;
        pending.insert(tag, expected);
    }
    let expected_by_tag = pending.clone();
    let tags_only: HashMap<CompletionTag, ()> = pending.keys().map(|t| (*t, ())).collect();
    for c in collect_until(transport, CqId::Consensus, tags_only)? {
        if c.status.is_success() {
            let expected = expected_by_tag[&c.tag];
            if c.payload.as_word() == Some(expected) {
                accepts += 1;
            }
        }
    }

    if accepts >= classic_q {
        let winner = SharedRegion::decode_winner(proposal).unwrap_or(host_id);
        Ok(if winner == host_id { PathOutcome::Won } else { PathOutcome::Lost })
    } else {
        Ok(PathOutcome::Indeterminate)
    }
}
