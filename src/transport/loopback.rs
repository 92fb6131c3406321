//! In-process fake [`Transport`], for exercising the consensus engines
//! without real RDMA hardware.
//!
//! A [`LoopbackCluster`] owns one [`LoopbackNode`] per rank. Each node's
//! registered regions are plain byte buffers behind a mutex; CAS/FAA/READ/
//! WRITE are emulated by locking and manipulating bytes directly. Completions
//! are queued synchronously at `post_*` time (loopback delivery has no
//! network latency to model) and drained by `poll`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::transport::{Completion, CompletionTag, CqId, OpKind, Payload, Region, Transport, WcStatus};

/// One simulated node's registered memory, shared by every
/// [`LoopbackTransport`] handle that addresses it.
struct LoopbackNode {
    faa_tas: Mutex<Vec<u8>>,
    llsc: Mutex<Vec<u8>>,
    recovery_reqs: Mutex<Vec<u8>>,
    recovery_resp: Mutex<Vec<u8>>,
}

impl LoopbackNode {
    fn new(max_slots: u64, n: usize) -> Self {
        let faa_tas_len = 8 + max_slots as usize * 8;
        let llsc_len = 8 + max_slots as usize * 16;
        let recovery_reqs_len = n * 6;
        let recovery_resp_len = 19;
        Self {
            faa_tas: Mutex::new(vec![0u8; faa_tas_len]),
            llsc: Mutex::new(vec![0u8; llsc_len]),
            recovery_reqs: Mutex::new(vec![0u8; recovery_reqs_len]),
            recovery_resp: Mutex::new(vec![0u8; recovery_resp_len]),
        }
    }

    fn buf(&self, region: Region) -> &Mutex<Vec<u8>> {
        match region {
            Region::FaaTas => &self.faa_tas,
            Region::LlSc => &self.llsc,
            Region::RecoveryReqs => &self.recovery_reqs,
            Region::RecoveryResp => &self.recovery_resp,
        }
    }

    fn cas(&self, region: Region, offset: u64, compare: u64, swap: u64) -> u64 {
        let mut buf = self.buf(region).lock().unwrap();
        let off = offset as usize;
        let cur = u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap());
        if cur == compare {
            buf[off..off + 8].copy_from_slice(&swap.to_ne_bytes());
        }
        cur
    }

    fn faa(&self, region: Region, offset: u64, add: u64) -> u64 {
        let mut buf = self.buf(region).lock().unwrap();
        let off = offset as usize;
        let cur = u64::from_ne_bytes(buf[off..off + 8].try_into().unwrap());
        let new = cur.wrapping_add(add);
        buf[off..off + 8].copy_from_slice(&new.to_ne_bytes());
        cur
    }

    fn read(&self, region: Region, offset: u64, len: usize) -> Vec<u8> {
        let buf = self.buf(region).lock().unwrap();
        let off = offset as usize;
        buf[off..off + len].to_vec()
    }

    fn write(&self, region: Region, offset: u64, data: &[u8]) {
        let mut buf = self.buf(region).lock().unwrap();
        let off = offset as usize;
        buf[off..off + data.len()].copy_from_slice(data);
    }
}

/// A whole fake cluster: one [`LoopbackNode`] per rank, shared by every
/// [`LoopbackTransport`] so that a CAS posted from rank `a` against rank `b`
/// is visible to `b`'s own `local_*` calls and vice versa.
pub struct LoopbackCluster {
    nodes: Vec<Arc<LoopbackNode>>,
}

impl LoopbackCluster {
    #[must_use]
    pub fn new(n: usize, max_slots: u64) -> Self {
        let nodes = (0..n).map(|_| Arc::new(LoopbackNode::new(max_slots, n))).collect();
        Self { nodes }
    }

    /// Builds a [`LoopbackTransport`] handle for `host_id`. Every handle
    /// built from the same cluster shares the same underlying memory.
    #[must_use]
    pub fn transport(&self, host_id: u16) -> LoopbackTransport {
        LoopbackTransport {
            nodes: self.nodes.clone(),
            host_id,
            consensus_cq: Mutex::new(VecDeque::new()),
            frontier_cq: Mutex::new(VecDeque::new()),
        }
    }
}

/// A single node's view of a [`LoopbackCluster`].
pub struct LoopbackTransport {
    nodes: Vec<Arc<LoopbackNode>>,
    host_id: u16,
    consensus_cq: Mutex<VecDeque<Completion>>,
    frontier_cq: Mutex<VecDeque<Completion>>,
}

impl LoopbackTransport {
    fn cq(&self, cq: CqId) -> &Mutex<VecDeque<Completion>> {
        match cq {
            CqId::Consensus => &self.consensus_cq,
            CqId::Frontier => &self.frontier_cq,
        }
    }

    fn enqueue(&self, tag: CompletionTag, payload: Payload) {
        let cq = tag.kind.cq();
        self.cq(cq).lock().unwrap().push_back(Completion {
            tag,
            status: WcStatus::Success,
            payload,
        });
    }
}

impl Transport for LoopbackTransport {
    fn post_cas(
        &self,
        peer: u16,
        region: Region,
        offset: u64,
        compare: u64,
        swap: u64,
        tag: CompletionTag,
    ) -> Result<(), Error> {
        let pre = self.nodes[peer as usize].cas(region, offset, compare, swap);
        self.enqueue(tag, Payload::Word(pre));
        Ok(())
    }

    fn post_faa(&self, peer: u16, region: Region, offset: u64, add: u64, tag: CompletionTag) -> Result<(), Error> {
        let pre = self.nodes[peer as usize].faa(region, offset, add);
        self.enqueue(tag, Payload::Word(pre));
        Ok(())
    }

    fn post_read(&self, peer: u16, region: Region, offset: u64, len: usize, tag: CompletionTag) -> Result<(), Error> {
        let bytes = self.nodes[peer as usize].read(region, offset, len);
        let payload = if len == 8 {
            Payload::Word(u64::from_ne_bytes(bytes.try_into().unwrap()))
        } else {
            Payload::Bytes(bytes)
        };
        self.enqueue(tag, payload);
        Ok(())
    }

    fn post_write(&self, peer: u16, region: Region, offset: u64, data: &[u8], tag: CompletionTag) -> Result<(), Error> {
        self.nodes[peer as usize].write(region, offset, data);
        self.enqueue(tag, Payload::None);
        Ok(())
    }

    fn poll(&self, cq: CqId, max: usize) -> Result<Vec<Completion>, Error> {
        let mut q = self.cq(cq).lock().unwrap();
        let n = max.min(q.len());
        Ok(q.drain(..n).collect())
    }

    fn n(&self) -> usize {
        self.nodes.len()
    }

    fn host_id(&self) -> u16 {
        self.host_id
    }

    fn local_cas(&self, region: Region, offset: u64, compare: u64, swap: u64) -> u64 {
        self.nodes[self.host_id as usize].cas(region, offset, compare, swap)
    }

    fn local_faa(&self, region: Region, offset: u64, add: u64) -> u64 {
        self.nodes[self.host_id as usize].faa(region, offset, add)
    }

    fn local_read(&self, region: Region, offset: u64, len: usize) -> Vec<u8> {
        self.nodes[self.host_id as usize].read(region, offset, len)
    }

    fn local_write(&self, region: Region, offset: u64, data: &[u8]) {
        self.nodes[self.host_id as usize].write(region, offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_only_swaps_on_match() {
        let cluster = LoopbackCluster::new(3, 16);
        let t = cluster.transport(0);
        let tag = CompletionTag::new(0, 1, OpKind::FaaTasCas);
        t.post_cas(1, Region::FaaTas, 8, 0, 99, tag).unwrap();
        let completions = t.poll(CqId::Consensus, 10).unwrap();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].payload.as_word(), Some(0));

        let tag2 = CompletionTag::new(0, 1, OpKind::FaaTasCas);
        t.post_cas(1, Region::FaaTas, 8, 0, 42, tag2).unwrap();
        let completions = t.poll(CqId::Consensus, 10).unwrap();
        assert_eq!(completions[0].payload.as_word(), Some(99));
    }

    #[test]
    fn remote_writes_are_visible_to_the_owning_node() {
        let cluster = LoopbackCluster::new(2, 16);
        let writer = cluster.transport(0);
        let owner = cluster.transport(1);
        let tag = CompletionTag::new(0, 1, OpKind::RecoveryNotify);
        writer.post_write(1, Region::RecoveryReqs, 0, &[1, 2, 3], tag).unwrap();
        assert_eq!(owner.local_read(Region::RecoveryReqs, 0, 3), vec![1, 2, 3]);
    }

    #[test]
    fn frontier_faa_lands_on_its_own_cq() {
        let cluster = LoopbackCluster::new(1, 16);
        let t = cluster.transport(0);
        let tag = CompletionTag::new(0, 0, OpKind::FrontierFaa);
        t.post_faa(0, Region::FaaTas, 0, 1, tag).unwrap();
        assert!(t.poll(CqId::Consensus, 10).unwrap().is_empty());
        assert_eq!(t.poll(CqId::Frontier, 10).unwrap().len(), 1);
    }
}
