//! Benchmark load generator: connects to every cluster node and issues a
//! round-robin stream of FAA requests per thread, reporting aggregate
//! throughput. Grounded in `bench/client.c`.

use std::time::Instant;

use clap::Parser;
use rdma_atomics::config::ClusterConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CLIENT_SERVICE_PORT: u16 = 9000;

/// Load generator for the distributed atomic-operations cluster.
#[derive(Parser, Debug)]
#[command(about = "Benchmark client for the atomic-operations cluster")]
struct Opts {
    /// Path to the cluster's TOML configuration (only the node list is used).
    #[arg(default_value = "cluster.toml")]
    config: std::path::PathBuf,

    /// Number of concurrent client threads (tasks).
    num_threads: u32,

    /// Number of FAA requests each thread issues.
    requests_per_thread: u32,

    /// TCP port the node's client service listens on.
    #[arg(long, default_value_t = CLIENT_SERVICE_PORT)]
    client_port: u16,
}

fn init_logging() {
    use logforth::append;
    logforth::builder()
        .dispatch(|d| d.filter(log::LevelFilter::Info).append(append::Stdout::default()))
        .apply();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let opts = Opts::parse();
    let cfg = ClusterConfig::load(&opts.config)?;
    let num_nodes = cfg.n();

    println!("================================\n");
    println!("Cluster nodes: {num_nodes}");
    println!("Client threads: {}", opts.num_threads);
    println!("Requests per thread: {}", opts.requests_per_thread);
    println!("Total requests: {}", opts.num_threads * opts.requests_per_thread);
    println!("================================\n");

    let start = Instant::now();

    let mut handles = Vec::new();
    for thread_id in 0..opts.num_threads {
        let addrs: Vec<_> = cfg.nodes.iter().map(|n| (n.ip, opts.client_port)).collect();
        let requests = opts.requests_per_thread;
        handles.push(tokio::spawn(async move { client_thread(thread_id, addrs, requests).await }));
    }

    let mut completed_total = 0u64;
    for h in handles {
        completed_total += h.await??;
    }

    let elapsed = start.elapsed();
    let throughput = completed_total as f64 / elapsed.as_secs_f64();

    println!("===============");
    println!("Total time: {:.2} seconds", elapsed.as_secs_f64());
    println!("Throughput: {throughput:.2} ops/sec");
    println!("===============");

    Ok(())
}

async fn client_thread(thread_id: u32, addrs: Vec<(std::net::Ipv4Addr, u16)>, num_requests: u32) -> anyhow::Result<u64> {
    let num_nodes = addrs.len();
    let mut sockets = Vec::with_capacity(num_nodes);
    for addr in &addrs {
        sockets.push(TcpStream::connect(addr).await?);
    }
    log::info!("client thread {thread_id}: connected to all {num_nodes} nodes");

    let mut completed = 0u64;
    for i in 0..num_requests {
        let target = (i as usize) % num_nodes;
        // op_type 0 (FAA), matching `request_msg{op_type, slot}`'s native
        // (unpacked, architecture-native) C layout: one byte, three bytes
        // of padding, then the `u32` slot field.
        let mut req = [0u8; 8];
        req[0] = 0;
        if sockets[target].write_all(&req).await.is_err() {
            break;
        }

        let mut buf = [0u8; 8];
        if sockets[target].read_exact(&mut buf).await.is_err() {
            break;
        }
        let result = i64::from_ne_bytes(buf);
        if result == -12 {
            // -ENOMEM: cluster is out of slots, matching the original
            // benchmark's early-exit condition.
            break;
        }

        completed += 1;
        if completed % 10_000 == 0 {
            log::info!("client thread {thread_id}: {completed} requests completed");
        }
    }

    log::info!("client thread {thread_id}: finished ({completed}/{num_requests} requests)");
    Ok(completed)
}
