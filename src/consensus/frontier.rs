//! Frontier allocation: a single fetch-and-add against the frontier
//! counter owned by `tunables.frontier_node`. Grounded in `atomic.c`'s
//! `rdma_get_next_slot`.

use crate::config::Tunables;
use crate::error::Error;
use crate::memory::SharedRegion;
use crate::transport::{CompletionTag, CqId, OpKind, Region, Transport};

/// Claims the next free slot index. If this node owns the frontier, the
/// increment is a local hardware atomic; otherwise it is a single posted
/// FAA against the owner's frontier, polled on the dedicated frontier CQ
/// so a burst of slow-path consensus traffic can't starve it.
pub fn next_slot(transport: &dyn Transport, tunables: &Tunables) -> Result<u64, Error> {
    let owner = tunables.frontier_node;
    let offset = SharedRegion::frontier_offset();

    let slot = if owner == transport.host_id() {
        transport.local_faa(Region::FaaTas, offset, 1)
    } else {
        let tag = CompletionTag::new(0, owner, OpKind::FrontierFaa);
        transport.post_faa(owner, Region::FaaTas, offset, 1, tag)?;
        loop {
            let batch = transport.poll(CqId::Frontier, 1)?;
            if let Some(c) = batch.into_iter().find(|c| c.tag == tag) {
                if !c.status.is_success() {
                    return Err(Error::Transport(c.status));
                }
                break c.payload.as_word().unwrap_or(0);
            }
            std::hint::spin_loop();
        }
    };

    if slot >= tunables.max_slots {
        return Err(Error::OutOfSpace);
    }
    Ok(slot)
}
