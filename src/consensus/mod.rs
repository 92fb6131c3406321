//! The two consensus engines: FAA/TAS (fast-Paxos CAS with a classic-Paxos
//! slow path) and Load-Link/Store-Conditional (fast-Paxos CAS with
//! coordinated recovery). Both are synchronous and spin-poll their
//! [`crate::transport::Transport`]'s completion queue; the node facade is
//! responsible for running them off the async runtime's worker threads via
//! `spawn_blocking`.

pub mod faa_tas;
pub mod frontier;
pub mod llsc;

use std::collections::HashMap;

use crate::error::Error;
use crate::transport::{Completion, CompletionTag, CqId, Transport};

/// Posts nothing itself; drains `cq` until a completion has been seen for
/// every tag in `pending`, or `pending` is empty. Returns every completion
/// observed for a pending tag, removing it as it arrives. Completions for
/// tags not in `pending` (e.g. stragglers from a previous call) are dropped.
pub(crate) fn collect_until(
    transport: &dyn Transport,
    cq: CqId,
    mut pending: HashMap<CompletionTag, ()>,
) -> Result<Vec<Completion>, Error> {
    let mut out = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let batch = transport.poll(cq, pending.len().max(1))?;
        if batch.is_empty() {
            std::hint::spin_loop();
            continue;
        }
        for c in batch {
            if pending.remove(&c.tag).is_some() {
                out.push(c);
            }
        }
    }
    Ok(out)
}
