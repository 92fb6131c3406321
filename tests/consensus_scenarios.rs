//! End-to-end exercises of the safety invariants and worked scenarios,
//! driven entirely over `LoopbackTransport` so they run without any RDMA
//! hardware. Each test is named after the invariant or scenario it covers.

use std::collections::HashSet;
use std::sync::Arc;

use rdma_atomics::config::Tunables;
use rdma_atomics::node::Node;
use rdma_atomics::transport::loopback::LoopbackCluster;
use rdma_atomics::transport::Region;
use rdma_atomics::Error;

fn nodes(n: usize, max_slots: u64) -> (LoopbackCluster, Vec<Arc<Node>>) {
    let cluster = LoopbackCluster::new(n, max_slots);
    let tunables = Tunables {
        max_slots,
        ..Tunables::default()
    };
    let nodes = (0..n as u16)
        .map(|id| Arc::new(Node::new(Arc::new(cluster.transport(id)), tunables)))
        .collect();
    (cluster, nodes)
}

/// Scenario 1: a single writer issuing FAA four times in a row gets
/// consecutive slots, each won by node 0.
#[tokio::test]
async fn single_writer_faa_returns_consecutive_slots() {
    let (cluster, nodes) = nodes(3, 8);
    let node0 = &nodes[0];

    let mut slots = Vec::new();
    for _ in 0..4 {
        slots.push(node0.fetch_and_add().await.unwrap());
    }
    assert_eq!(slots, vec![0, 1, 2, 3]);

    let t0 = cluster.transport(0);
    for &slot in &slots {
        let raw = u64::from_ne_bytes(
            t0.local_read(Region::FaaTas, rdma_atomics::memory::SharedRegion::slot_offset(slot), 8)
                .try_into()
                .unwrap(),
        );
        assert_eq!(rdma_atomics::memory::SharedRegion::decode_winner(raw), Some(0));
    }
}

/// Scenario 2 / (P1) (P3): two concurrent writers on distinct nodes each
/// issue FAA four times; the union of returned slots covers every slot
/// exactly once, and each slot's recorded winner matches the node that
/// actually got it back.
#[tokio::test]
async fn two_concurrent_writers_partition_the_slot_space() {
    let (cluster, nodes) = nodes(3, 8);
    let node0 = nodes[0].clone();
    let node1 = nodes[1].clone();

    let h0 = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(node0.fetch_and_add().await.unwrap());
        }
        (0u16, got)
    });
    let h1 = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(node1.fetch_and_add().await.unwrap());
        }
        (1u16, got)
    });

    let (winner0, slots0) = h0.await.unwrap();
    let (winner1, slots1) = h1.await.unwrap();

    let mut all: Vec<u64> = slots0.iter().chain(slots1.iter()).copied().collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3, 4, 5, 6, 7]);

    // (P1) No slot is claimed by both callers.
    let set0: HashSet<_> = slots0.iter().copied().collect();
    let set1: HashSet<_> = slots1.iter().copied().collect();
    assert!(set0.is_disjoint(&set1));

    // Every returned slot's recorded winner matches the node that got it.
    let t0 = cluster.transport(0);
    for (winner, slots) in [(winner0, &slots0), (winner1, &slots1)] {
        for &slot in slots {
            let raw = u64::from_ne_bytes(
                t0.local_read(Region::FaaTas, rdma_atomics::memory::SharedRegion::slot_offset(slot), 8)
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(rdma_atomics::memory::SharedRegion::decode_winner(raw), Some(winner));
        }
    }
}

/// Scenario 3: TAS(2) from node 0 then TAS(2) from node 1 — the first
/// claim wins, the second loses, and the committed winner stays node 0.
#[tokio::test]
async fn test_and_set_is_first_come_first_served() {
    let (cluster, nodes) = nodes(3, 8);

    let first = nodes[0].test_and_set(2).await.unwrap();
    let second = nodes[1].test_and_set(2).await.unwrap();
    assert!(first);
    assert!(!second);

    let t0 = cluster.transport(0);
    let raw = u64::from_ne_bytes(
        t0.local_read(Region::FaaTas, rdma_atomics::memory::SharedRegion::slot_offset(2), 8)
            .try_into()
            .unwrap(),
    );
    assert_eq!(rdma_atomics::memory::SharedRegion::decode_winner(raw), Some(0));
}

/// Scenario 4: a concurrent TAS on an empty slot races an FAA loop that may
/// or may not land on the same slot; whichever of the two claims the slot
/// first is the only one that succeeds there.
#[tokio::test]
async fn test_and_set_racing_fetch_and_add_has_exactly_one_winner_per_slot() {
    let (_cluster, nodes) = nodes(3, 8);
    let node0 = nodes[0].clone();
    let node2 = nodes[2].clone();

    let faa_task = tokio::spawn(async move {
        let mut got = Vec::new();
        for _ in 0..8 {
            got.push(node0.fetch_and_add().await.unwrap());
        }
        got
    });
    let tas_task = tokio::spawn(async move { node2.test_and_set(5).await.unwrap() });

    let faa_slots = faa_task.await.unwrap();
    let tas_won = tas_task.await.unwrap();

    if faa_slots.contains(&5) {
        // node0's fast-path CAS got there first; node2's TAS must have lost.
        assert!(!tas_won);
    }
    // If node2 won, its value is exclusively committed; node0's FAA loop
    // would have reallocated 5 to another slot instead (already implied by
    // the frontier never handing out the same index twice).
}

/// Scenario 5 / (P5): Load-Link yields (0, 0) on an idle cluster; two
/// Store-Conditionals racing on the same observed index produce exactly one
/// winner, and a subsequent Load-Link anywhere sees the winner's value at
/// the next index.
#[tokio::test]
async fn store_conditional_race_has_exactly_one_winner() {
    let (_cluster, nodes) = nodes(3, 16);

    let (index0, value0) = nodes[0].load_link().await.unwrap();
    assert_eq!((index0, value0), (0, 0));
    let (index1, value1) = nodes[1].load_link().await.unwrap();
    assert_eq!((index1, value1), (0, 0));

    let node0 = nodes[0].clone();
    let node1 = nodes[1].clone();
    let h0 = tokio::spawn(async move { node0.store_conditional(7).await.unwrap() });
    let h1 = tokio::spawn(async move { node1.store_conditional(9).await.unwrap() });

    let outcome0 = h0.await.unwrap();
    let outcome1 = h1.await.unwrap();

    use rdma_atomics::consensus::llsc::StoreOutcome;
    let wins = [outcome0 == StoreOutcome::Won, outcome1 == StoreOutcome::Won];
    assert_eq!(wins.iter().filter(|w| **w).count(), 1, "exactly one store-conditional must win");

    let (next_index, next_value) = nodes[2].load_link().await.unwrap();
    assert!(next_index >= 1);
    assert!(next_value == 7 || next_value == 9);
    if outcome0 == StoreOutcome::Won {
        assert_eq!(next_value, 7);
    } else {
        assert_eq!(next_value, 9);
    }
}

/// Scenario 6: with a two-slot cluster, three concurrent FAA callers yield
/// exactly two distinct slots and one out-of-space rejection.
#[tokio::test]
async fn frontier_saturation_rejects_the_third_concurrent_claim() {
    let (_cluster, nodes) = nodes(3, 2);

    let n0 = nodes[0].clone();
    let n1 = nodes[1].clone();
    let n2 = nodes[2].clone();
    let h0 = tokio::spawn(async move { n0.fetch_and_add().await });
    let h1 = tokio::spawn(async move { n1.fetch_and_add().await });
    let h2 = tokio::spawn(async move { n2.fetch_and_add().await });

    let results = vec![h0.await.unwrap(), h1.await.unwrap(), h2.await.unwrap()];
    let ok_slots: Vec<u64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    let errs: Vec<&Error> = results.iter().filter_map(|r| r.as_ref().err()).collect();

    let mut sorted = ok_slots.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1]);
    assert_eq!(errs.len(), 1);
    assert_eq!(*errs[0], Error::OutOfSpace);
}

/// (P2) Slot finality: once a slot's ballot is observed non-zero, a
/// repeated quorum read observes the identical winner, even after further
/// unrelated FAA traffic on other slots.
#[tokio::test]
async fn committed_slot_winner_never_changes_under_later_unrelated_activity() {
    let (cluster, nodes) = nodes(3, 8);
    let slot = nodes[0].fetch_and_add().await.unwrap();

    let t0 = cluster.transport(0);
    let read_winner = || {
        let raw = u64::from_ne_bytes(
            t0.local_read(Region::FaaTas, rdma_atomics::memory::SharedRegion::slot_offset(slot), 8)
                .try_into()
                .unwrap(),
        );
        rdma_atomics::memory::SharedRegion::decode_winner(raw)
    };
    let winner_before = read_winner();
    assert_eq!(winner_before, Some(0));

    for _ in 0..4 {
        nodes[1].fetch_and_add().await.unwrap();
    }

    assert_eq!(read_winner(), winner_before);
}

/// (P4) Ballot uniqueness is a property of `ballot::generate`, not of the
/// consensus engine's decision logic, but the service-level guarantee it
/// backs is that two nodes racing for the same slot are never both
/// recorded as the winner.
#[tokio::test]
async fn two_nodes_never_both_win_the_same_slot() {
    let (cluster, nodes) = nodes(4, 8);
    let node0 = nodes[0].clone();
    let node1 = nodes[1].clone();
    let node2 = nodes[2].clone();
    let node3 = nodes[3].clone();

    let handles = vec![
        tokio::spawn(async move { node0.test_and_set(3).await }),
        tokio::spawn(async move { node1.test_and_set(3).await }),
        tokio::spawn(async move { node2.test_and_set(3).await }),
        tokio::spawn(async move { node3.test_and_set(3).await }),
    ];
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap().unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    let t0 = cluster.transport(0);
    let raw = u64::from_ne_bytes(
        t0.local_read(Region::FaaTas, rdma_atomics::memory::SharedRegion::slot_offset(3), 8)
            .try_into()
            .unwrap(),
    );
    assert!(rdma_atomics::memory::SharedRegion::decode_winner(raw).is_some());
}
