//! Cluster bootstrap: the TCP handshake that exchanges queue-pair and
//! memory-region attributes between every pair of nodes and drives their
//! queue pairs from INIT to RTS.
//!
//! Mirrors `rdma_xchg.c`'s connection topology: the higher-ranked node in
//! every pair dials out, the lower-ranked node accepts. Node `k` therefore
//! dials nodes `0..k` and accepts `n - k - 1` inbound connections, so every
//! pair connects exactly once. Unlike the reference implementation (pthreads
//! and blocking sockets), this uses a Tokio `TcpListener` and one handler
//! task per inbound connection.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::config::ClusterConfig;
use crate::error::FatalError;
use crate::transport::Region;

const MAX_RETRIES: u32 = 4;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const WIRE_LEN: usize = 2 + 4 + 4 + 4 + 16 + 4 * (8 + 4);

/// A peer's queue-pair and memory-region attributes, as exchanged over TCP
/// during bootstrap. Analogous to the reference implementation's
/// `remote_attr`, generalized from one shared-memory region to four.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemoteAttr {
    pub lid: u16,
    pub gid: [u8; 16],
    pub qpn_consensus: u32,
    pub qpn_frontier: u32,
    pub psn: u32,
    pub region_faa_tas: (u64, u32),
    pub region_llsc: (u64, u32),
    pub region_recovery_reqs: (u64, u32),
    pub region_recovery_resp: (u64, u32),
}

impl RemoteAttr {
    /// The `(addr, rkey)` pair for `region` on this peer.
    #[must_use]
    pub fn region(&self, region: Region) -> (u64, u32) {
        match region {
            Region::FaaTas => self.region_faa_tas,
            Region::LlSc => self.region_llsc,
            Region::RecoveryReqs => self.region_recovery_reqs,
            Region::RecoveryResp => self.region_recovery_resp,
        }
    }

    fn to_be_bytes(self) -> [u8; WIRE_LEN] {
        let mut buf = [0u8; WIRE_LEN];
        let mut w = 0;
        buf[w..w + 2].copy_from_slice(&self.lid.to_be_bytes());
        w += 2;
        buf[w..w + 16].copy_from_slice(&self.gid);
        w += 16;
        buf[w..w + 4].copy_from_slice(&self.qpn_consensus.to_be_bytes());
        w += 4;
        buf[w..w + 4].copy_from_slice(&self.qpn_frontier.to_be_bytes());
        w += 4;
        buf[w..w + 4].copy_from_slice(&self.psn.to_be_bytes());
        w += 4;
        for region in [
            self.region_faa_tas,
            self.region_llsc,
            self.region_recovery_reqs,
            self.region_recovery_resp,
        ] {
            buf[w..w + 8].copy_from_slice(&region.0.to_be_bytes());
            w += 8;
            buf[w..w + 4].copy_from_slice(&region.1.to_be_bytes());
            w += 4;
        }
        debug_assert_eq!(w, WIRE_LEN);
        buf
    }

    fn from_be_bytes(buf: [u8; WIRE_LEN]) -> Self {
        let mut r = 0;
        let lid = u16::from_be_bytes(buf[r..r + 2].try_into().unwrap());
        r += 2;
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[r..r + 16]);
        r += 16;
        let qpn_consensus = u32::from_be_bytes(buf[r..r + 4].try_into().unwrap());
        r += 4;
        let qpn_frontier = u32::from_be_bytes(buf[r..r + 4].try_into().unwrap());
        r += 4;
        let psn = u32::from_be_bytes(buf[r..r + 4].try_into().unwrap());
        r += 4;
        let mut regions = [(0u64, 0u32); 4];
        for slot in &mut regions {
            let addr = u64::from_be_bytes(buf[r..r + 8].try_into().unwrap());
            r += 8;
            let rkey = u32::from_be_bytes(buf[r..r + 4].try_into().unwrap());
            r += 4;
            *slot = (addr, rkey);
        }
        Self {
            lid,
            gid,
            qpn_consensus,
            qpn_frontier,
            psn,
            region_faa_tas: regions[0],
            region_llsc: regions[1],
            region_recovery_reqs: regions[2],
            region_recovery_resp: regions[3],
        }
    }
}

/// Anything that can produce its own identity for a given peer and accept
/// that peer's identity to finish connecting. Implemented by
/// [`crate::transport::verbs::VerbsTransport`]; kept as a trait so the
/// handshake itself has no FFI dependency.
pub trait Handshake {
    fn local_identity(&self, peer: u16) -> RemoteAttr;
    fn connect_peer(&mut self, cfg: &ClusterConfig, peer: u16, remote: RemoteAttr) -> Result<(), crate::error::Error>;
}

/// Runs the full bootstrap handshake: binds a listener (unless this node is
/// the highest-ranked), dials every lower-ranked peer, and connects every
/// queue pair once attributes are exchanged.
pub async fn connect_cluster<T: Handshake>(cfg: &ClusterConfig, transport: &mut T) -> Result<(), FatalError> {
    let host = &cfg.nodes[cfg.host_id as usize];
    let n = cfg.n();

    let listener = if (cfg.host_id as usize) != n - 1 {
        let addr = (host.ip, host.tcp_port);
        Some(
            TcpListener::bind(addr)
                .await
                .map_err(|e| FatalError::Bootstrap(format!("bind {addr:?}: {e}")))?,
        )
    } else {
        None
    };

    for lower in 0..cfg.host_id {
        dial_peer(cfg, transport, lower).await?;
    }

    if let Some(listener) = listener {
        let expected = n - cfg.host_id as usize - 1;
        for _ in 0..expected {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| FatalError::Bootstrap(format!("accept: {e}")))?;
            debug!("accepted handshake connection from {addr}");
            accept_peer(cfg, transport, stream).await?;
        }
    }

    // Loopback-connect this node's own frontier QP, matching the reference
    // implementation's self-connection (frontier FAA always targets the
    // frontier owner, which may be this node).
    let local = transport.local_identity(cfg.host_id);
    transport
        .connect_peer(cfg, cfg.host_id, local)
        .map_err(|e| FatalError::Bootstrap(format!("self-connect: {e}")))?;

    info!("bootstrap handshake complete for node {}", cfg.host_id);
    Ok(())
}

async fn dial_peer<T: Handshake>(cfg: &ClusterConfig, transport: &mut T, peer: u16) -> Result<(), FatalError> {
    let remote_cfg = &cfg.nodes[peer as usize];
    let addr = (remote_cfg.ip, remote_cfg.tcp_port);

    let mut stream = None;
    for attempt in 0..MAX_RETRIES {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => {
                warn!("connect to node {peer} failed (attempt {attempt}): {e}");
                sleep(RETRY_DELAY).await;
            }
        }
    }
    let mut stream = stream.ok_or_else(|| FatalError::Bootstrap(format!("node {peer} unreachable")))?;

    stream
        .write_all(&cfg.host_id.to_be_bytes())
        .await
        .map_err(|e| FatalError::Bootstrap(format!("sending host id to {peer}: {e}")))?;

    let local = transport.local_identity(peer);
    stream
        .write_all(&local.to_be_bytes())
        .await
        .map_err(|e| FatalError::Bootstrap(format!("sending attrs to {peer}: {e}")))?;

    let mut buf = [0u8; WIRE_LEN];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| FatalError::Bootstrap(format!("reading attrs from {peer}: {e}")))?;
    let remote = RemoteAttr::from_be_bytes(buf);

    transport
        .connect_peer(cfg, peer, remote)
        .map_err(|e| FatalError::Bootstrap(format!("connecting QP to {peer}: {e}")))?;
    debug!("connected to node {peer}");
    Ok(())
}

async fn accept_peer<T: Handshake>(cfg: &ClusterConfig, transport: &mut T, mut stream: TcpStream) -> Result<(), FatalError> {
    let mut id_buf = [0u8; 2];
    stream
        .read_exact(&mut id_buf)
        .await
        .map_err(|e| FatalError::Bootstrap(format!("reading peer id: {e}")))?;
    let peer = u16::from_be_bytes(id_buf);

    let local = transport.local_identity(peer);
    stream
        .write_all(&local.to_be_bytes())
        .await
        .map_err(|e| FatalError::Bootstrap(format!("sending attrs to {peer}: {e}")))?;

    let mut buf = [0u8; WIRE_LEN];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| FatalError::Bootstrap(format!("reading attrs from {peer}: {e}")))?;
    let remote = RemoteAttr::from_be_bytes(buf);

    transport
        .connect_peer(cfg, peer, remote)
        .map_err(|e| FatalError::Bootstrap(format!("connecting QP to {peer}: {e}")))?;
    debug!("accepted handshake from node {peer}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_attr_roundtrips_over_the_wire() {
        let attr = RemoteAttr {
            lid: 7,
            gid: [9u8; 16],
            qpn_consensus: 0x1234,
            qpn_frontier: 0x5678,
            psn: 0,
            region_faa_tas: (0xdead_beef, 1),
            region_llsc: (0xfeed_face, 2),
            region_recovery_reqs: (0x1, 3),
            region_recovery_resp: (0x2, 4),
        };
        assert_eq!(RemoteAttr::from_be_bytes(attr.to_be_bytes()), attr);
    }
}
