//! Node server: bootstraps the cluster, then serves the benchmark client
//! wire protocol (`request_msg{op_type, slot} -> i64`). Grounded in
//! `bench/server.c`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};
use rdma_atomics::config::ClusterConfig;
use rdma_atomics::transport::verbs::VerbsTransport;
use rdma_atomics::transport::Transport;
use rdma_atomics::{membership, Node};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;

/// Port clients connect to for FAA/TAS requests, independent of the
/// inter-node bootstrap port in the cluster config.
const CLIENT_SERVICE_PORT: u16 = 9000;

const COORDINATOR_SWEEP_INTERVAL: Duration = Duration::from_millis(5);

const REQUEST_MSG_SIZE: usize = 8;

/// Runs a single node of the cluster described by `config`.
#[derive(Parser, Debug)]
#[command(about = "Distributed atomic-operations node server")]
struct Opts {
    /// Path to this node's TOML cluster configuration.
    #[arg(default_value = "cluster.toml")]
    config: PathBuf,

    /// TCP port the benchmark client protocol listens on.
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
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_logging();

    let opts = Opts::parse();
    let cfg = ClusterConfig::load(&opts.config)?;
    let host_id = cfg.host_id;
    info!("node {host_id}: starting");

    let mut transport = VerbsTransport::open(&cfg)?;
    membership::connect_cluster(&cfg, &mut transport).await?;
    info!("node {host_id}: RDMA cluster initialized");

    let transport: Arc<dyn Transport> = Arc::new(transport);
    let node = Arc::new(Node::new(transport, cfg.tunables));

    let sweep_node = node.clone();
    tokio::spawn(async move {
        let mut ticker = interval(COORDINATOR_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_node.run_coordinator_sweep().await {
                error!("node {host_id}: coordinator sweep failed: {e}");
            }
        }
    });

    let bind_addr = (cfg.nodes[host_id as usize].ip, opts.client_port);
    let listener = TcpListener::bind(bind_addr).await?;
    info!("node {host_id}: client service listening on {bind_addr:?}");

    let mut client_count = 0u64;
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("node {host_id}: accepted client {addr} (#{client_count})");
        let node = node.clone();
        let client_id = client_count;
        client_count += 1;
        tokio::spawn(async move {
            if let Err(e) = handle_client(node, host_id, client_id, stream).await {
                warn!("client {addr} handler exited: {e}");
            }
        });
    }
}

async fn handle_client(node: Arc<Node>, host_id: u16, client_id: u64, mut stream: TcpStream) -> anyhow::Result<()> {
    let log_path = format!("latency_node{host_id}_client{client_id}.csv");
    let mut csv = csv::Writer::from_writer(File::create(&log_path)?);
    csv.write_record(["Node", "Slot", "Latency_us", "OpType"])?;

    let mut buf = [0u8; REQUEST_MSG_SIZE];
    loop {
        if stream.read_exact(&mut buf).await.is_err() {
            break;
        }
        // Native byte order: this is a raw same-architecture benchmark
        // protocol, not a portable wire format (unlike the bootstrap
        // handshake, which is always big-endian).
        let op_type = buf[0];
        let slot = u32::from_ne_bytes(buf[4..8].try_into().unwrap());

        let start = Instant::now();
        let result: i64 = match op_type {
            0 => match node.fetch_and_add().await {
                Ok(slot) => slot as i64,
                Err(e) => error_code(&e),
            },
            1 => match node.test_and_set(u64::from(slot)).await {
                Ok(won) => i64::from(won),
                Err(e) => error_code(&e),
            },
            _ => {
                warn!("node {host_id}: unknown op_type {op_type}, dropping connection");
                break;
            }
        };
        let elapsed = start.elapsed().as_micros() as u64;

        if result >= 0 {
            csv.write_record(&[host_id.to_string(), result.to_string(), elapsed.to_string(), op_type.to_string()])?;
            csv.flush()?;
        }

        stream.write_all(&result.to_ne_bytes()).await?;
        if result == NEG_ENOMEM {
            break;
        }
    }
    Ok(())
}

// Negative errno values, matching `bench/client.c`'s `if (result == -ENOMEM)
// break;` convention. Spelled out rather than pulled from a libc binding
// for a handful of stable integers.
const NEG_ENOMEM: i64 = -12;
const NEG_ETIMEDOUT: i64 = -110;
const NEG_EAGAIN: i64 = -11;
const NEG_EINVAL: i64 = -22;
const NEG_EIO: i64 = -5;

fn error_code(err: &rdma_atomics::Error) -> i64 {
    use rdma_atomics::Error;
    match err {
        Error::OutOfSpace => NEG_ENOMEM,
        Error::RecoveryTimeout => NEG_ETIMEDOUT,
        Error::TooManyConcurrentRequests(_) => NEG_EAGAIN,
        Error::NoLoadLink => NEG_EINVAL,
        Error::Transport(_) => NEG_EIO,
    }
}
