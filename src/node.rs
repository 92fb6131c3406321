//! The node facade: user-facing FAA/TAS/LL/SC operations, bounded retry
//! loops, per-node locking, and admission control. Grounded in `node.c`'s
//! `fetch_and_add`/`test_and_set`/`load_link`/`store_conditional`.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{Mutex, Semaphore};

use crate::ballot;
use crate::config::Tunables;
use crate::consensus::faa_tas::{self, PathOutcome};
use crate::consensus::llsc::{self, StoreOutcome};
use crate::consensus::frontier;
use crate::error::Error;
use crate::memory::SharedRegion;
use crate::transport::{Region, Transport};

const SLOW_PATH_RETRY_SLEEP: Duration = Duration::from_micros(50);

/// Bounded admission control over concurrent in-flight requests. Mirrors
/// the reference implementation's thread-id counter, but rejects outright
/// instead of silently reusing scratch past its bound (§9 of the design).
struct ThreadIdPool {
    semaphore: Semaphore,
    limit: usize,
}

impl ThreadIdPool {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Semaphore::new(limit),
            limit,
        }
    }

    fn try_admit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, Error> {
        self.semaphore
            .try_acquire()
            .map_err(|_| Error::TooManyConcurrentRequests(self.limit))
    }
}

/// The last Load-Link result on this node, consumed by the next
/// Store-Conditional. `None` means no Load-Link has been performed yet.
type LlScState = Option<(u64, u64)>;

/// A single node's user-facing entry point: fetch-and-add, test-and-set,
/// and Load-Link/Store-Conditional, each running the synchronous consensus
/// engine off the async runtime via `spawn_blocking`.
pub struct Node {
    transport: Arc<dyn Transport>,
    tunables: Tunables,
    faa_lock: Mutex<()>,
    llsc_lock: Mutex<LlScState>,
    admission: ThreadIdPool,
}

impl Node {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, tunables: Tunables) -> Self {
        let admission = ThreadIdPool::new(tunables.max_concurrent_req);
        Self {
            transport,
            tunables,
            faa_lock: Mutex::new(()),
            llsc_lock: Mutex::new(None),
            admission,
        }
    }

    /// Allocates a fresh slot and decides a winning ballot for it,
    /// returning the slot index. Serialized node-wide: the frontier CQ and
    /// consensus results scratch are single-owner per node (§4.5).
    pub async fn fetch_and_add(&self) -> Result<u64, Error> {
        let _permit = self.admission.try_admit()?;
        let _guard = self.faa_lock.lock().await;
        let transport = self.transport.clone();
        let tunables = self.tunables;
        tokio::task::spawn_blocking(move || fetch_and_add_blocking(transport.as_ref(), &tunables))
            .await
            .expect("fetch_and_add worker panicked")
    }

    /// Attempts to claim `slot` unconditionally, returning whether this
    /// node's attempt won. May run concurrently with other operations: the
    /// admission pool, not the FAA lock, bounds concurrency here.
    pub async fn test_and_set(&self, slot: u64) -> Result<bool, Error> {
        let _permit = self.admission.try_admit()?;
        let transport = self.transport.clone();
        let tunables = self.tunables;
        tokio::task::spawn_blocking(move || test_and_set_blocking(transport.as_ref(), &tunables, slot))
            .await
            .expect("test_and_set worker panicked")
    }

    /// Reads the cluster-wide frontier and the value committed there, if
    /// any, storing the pair for the next [`Node::store_conditional`] call.
    pub async fn load_link(&self) -> Result<(u64, u64), Error> {
        let _permit = self.admission.try_admit()?;
        let transport = self.transport.clone();
        let mut state = self.llsc_lock.lock().await;
        let result = tokio::task::spawn_blocking(move || llsc::load_link(transport.as_ref()))
            .await
            .expect("load_link worker panicked")?;
        *state = Some(result);
        Ok(result)
    }

    /// Commits `value` at the index returned by the preceding Load-Link.
    pub async fn store_conditional(&self, value: u64) -> Result<StoreOutcome, Error> {
        let _permit = self.admission.try_admit()?;
        let transport = self.transport.clone();
        let tunables = self.tunables;
        let mut state = self.llsc_lock.lock().await;
        let (index, _) = state.take().ok_or(Error::NoLoadLink)?;
        tokio::task::spawn_blocking(move || llsc::store_conditional(transport.as_ref(), &tunables, index, value))
            .await
            .expect("store_conditional worker panicked")
    }

    /// Runs one coordinator sweep over pending recovery mailboxes. A no-op
    /// unless this node is the configured coordinator; intended to be
    /// driven by a background task on a fixed interval (§4.7).
    pub async fn run_coordinator_sweep(&self) -> Result<(), Error> {
        let transport = self.transport.clone();
        let tunables = self.tunables;
        tokio::task::spawn_blocking(move || llsc::run_coordinator_sweep(transport.as_ref(), &tunables))
            .await
            .expect("coordinator sweep worker panicked")
    }

    #[must_use]
    pub fn host_id(&self) -> u16 {
        self.transport.host_id()
    }
}

fn fetch_and_add_blocking(transport: &dyn Transport, tunables: &Tunables) -> Result<u64, Error> {
    loop {
        let slot = frontier::next_slot(transport, tunables)?;
        let ballot = ballot::generate(transport.host_id());

        match faa_tas::fast_path(transport, slot, ballot.0)? {
            PathOutcome::Won => return Ok(slot),
            PathOutcome::Lost => {
                debug!("fast path lost slot {slot}, reallocating");
                continue;
            }
            PathOutcome::Indeterminate => {
                if resolve_slow_path(transport, tunables, slot, ballot.0, ballot.0)? {
                    return Ok(slot);
                }
                debug!("slow path decided slot {slot} for another node, reallocating");
            }
        }
    }
}

fn test_and_set_blocking(transport: &dyn Transport, tunables: &Tunables, slot: u64) -> Result<bool, Error> {
    let ballot = ballot::generate(transport.host_id());

    match faa_tas::fast_path(transport, slot, ballot.0)? {
        PathOutcome::Won => Ok(true),
        PathOutcome::Lost => Ok(false),
        PathOutcome::Indeterminate => resolve_slow_path(transport, tunables, slot, ballot.0, ballot.0),
    }
}

/// Runs the classic-Paxos slow path to a decision, re-reading the slot a
/// bounded number of times whenever a round is itself indeterminate before
/// trying again. Returns whether this node's ballot won.
fn resolve_slow_path(transport: &dyn Transport, tunables: &Tunables, slot: u64, ballot: u64, proposed_value: u64) -> Result<bool, Error> {
    loop {
        match faa_tas::slow_path(transport, slot, ballot, proposed_value)? {
            PathOutcome::Won => return Ok(true),
            PathOutcome::Lost => return Ok(false),
            PathOutcome::Indeterminate => {
                for _ in 0..tunables.max_retries {
                    std::thread::sleep(SLOW_PATH_RETRY_SLEEP);
                    let raw = u64::from_ne_bytes(
                        transport
                            .local_read(Region::FaaTas, SharedRegion::slot_offset(slot), 8)
                            .try_into()
                            .unwrap(),
                    );
                    if raw != 0 {
                        // The slot is decided, but not by this call: some
                        // other concurrent attempt (possibly this same node's
                        // own retry loop, racing another connection) got
                        // there first. Always reallocate/report loss here,
                        // regardless of whose ballot landed.
                        return Ok(false);
                    }
                }
                warn!("slot {slot} still undecided after {} retries, re-attempting slow path", tunables.max_retries);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackCluster;

    #[tokio::test]
    async fn fetch_and_add_hands_out_distinct_slots_to_concurrent_callers() {
        let cluster = LoopbackCluster::new(3, 64);
        let nodes: Vec<_> = (0..3)
            .map(|id| Arc::new(Node::new(Arc::new(cluster.transport(id)), Tunables::default())))
            .collect();

        let mut handles = Vec::new();
        for node in &nodes {
            let node = node.clone();
            handles.push(tokio::spawn(async move { node.fetch_and_add().await.unwrap() }));
        }
        let mut slots: Vec<u64> = Vec::new();
        for h in handles {
            slots.push(h.await.unwrap());
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 3);
    }

    #[tokio::test]
    async fn test_and_set_is_exclusive_across_the_cluster() {
        let cluster = LoopbackCluster::new(3, 64);
        let node0 = Node::new(Arc::new(cluster.transport(0)), Tunables::default());
        let node1 = Node::new(Arc::new(cluster.transport(1)), Tunables::default());

        let first = node0.test_and_set(0).await.unwrap();
        let second = node1.test_and_set(0).await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn store_conditional_without_a_prior_load_link_is_rejected() {
        let cluster = LoopbackCluster::new(1, 64);
        let node = Node::new(Arc::new(cluster.transport(0)), Tunables::default());
        assert_eq!(node.store_conditional(1).await.unwrap_err(), Error::NoLoadLink);
    }
}
