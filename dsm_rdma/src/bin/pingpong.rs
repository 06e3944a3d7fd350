//! Round-trip latency over a loopback connection.
//!
//! Runs a listener thread and a client in one process. The client sends a
//! message, the server echoes it back with the same trailer, repeat. The
//! software fabric is the default; `--provider verbs` (built with the
//! `verbs` feature) uses the RDMA device that owns `--host`.
//!
//! Run with:
//! ```bash
//! RUST_LOG=dsm_rdma=debug cargo run --release -p dsm_rdma --bin pingpong -- \
//!     -i 10000 -s 8,64,1024 -p 23456
//! cargo run --release -p dsm_rdma --features verbs --bin pingpong -- \
//!     --provider verbs --host 192.168.10.3
//! ```

use std::thread;

use clap::{Parser, ValueEnum};
use fabric::Fabric;
use fabric::soft::SoftFabric;
use minstant::Instant;
use tracing_subscriber::EnvFilter;

use dsm_rdma::{Error, MsgFlags, Trailer, Transport, TransportConfig, TxId};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "pingpong")]
#[command(about = "Send/receive round-trip benchmark")]
struct Args {
    /// Round trips per message size
    #[arg(short, long, default_value = "10000")]
    iterations: u64,

    /// Message sizes (comma-separated)
    #[arg(short = 's', long, value_delimiter = ',', default_value = "8")]
    message_sizes: Vec<usize>,

    /// Provider to run on
    #[arg(long, value_enum, default_value = "soft")]
    provider: Provider,

    /// Address the server listens on and the client connects to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port the server listens on
    #[arg(short, long, default_value = "23456")]
    port: u16,

    /// Warmup round trips per message size
    #[arg(short, long, default_value = "100")]
    warmup: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Provider {
    /// In-process software fabric
    Soft,
    /// librdmacm / libibverbs
    Verbs,
}

/// Receive one message, waiting for as long as it takes.
fn receive_blocking<F: Fabric>(
    conn: &dsm_rdma::Connection<F>,
    buf: &mut [u8],
) -> dsm_rdma::Result<(usize, Trailer)> {
    conn.receive_with(buf, TxId::ANY, MsgFlags::empty())
}

fn serve<F: Fabric>(
    listener: dsm_rdma::Connection<F>,
    rounds: u64,
    max_len: usize,
) -> dsm_rdma::Result<()> {
    let conn = listener.accept()?;
    let mut buf = vec![0u8; max_len];
    for _ in 0..rounds {
        let (len, trailer) = receive_blocking(&conn, &mut buf)?;
        conn.send_with(&buf[..len], &trailer)?;
    }
    // The listener still owns the accepted connection and releases it.
    Ok(())
}

type BoxError = Box<dyn std::error::Error>;

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    match args.provider {
        Provider::Soft => run(SoftFabric::new()?, &args),
        #[cfg(feature = "verbs")]
        Provider::Verbs => run(fabric::verbs::VerbsFabric::new()?, &args),
        #[cfg(not(feature = "verbs"))]
        Provider::Verbs => Err("built without the `verbs` feature".into()),
    }
}

fn run<F: Fabric>(fabric: F, args: &Args) -> Result<(), BoxError> {
    let config = TransportConfig::default();
    let max_len = config.max_payload();
    if let Some(&size) = args.message_sizes.iter().find(|&&s| s > max_len) {
        return Err(format!("message size {size} exceeds the {max_len} byte limit").into());
    }

    let transport = Transport::new(fabric, config)?;
    let port = args.port.to_string();
    let listener = transport.listen(&args.host, &port)?;

    let rounds = (args.iterations + args.warmup) * args.message_sizes.len() as u64;
    let server = {
        let listener = listener.clone();
        thread::Builder::new()
            .name("pingpong-server".into())
            .spawn(move || serve(listener, rounds, max_len))?
    };

    let client = transport.connect(&args.host, &port)?;
    println!("connected after {} attempt(s)", client.connect_attempts());
    println!("{:>8} {:>12} {:>12}", "size", "rtt_us", "mops");

    let mut reply = vec![0u8; max_len];
    for &size in &args.message_sizes {
        let payload = vec![0xA5u8; size];
        let mut txid = 0u16;
        let mut round = |txid: u16| -> dsm_rdma::Result<()> {
            let trailer = Trailer::new(1, 0, TxId(txid));
            client.send_with(&payload, &trailer)?;
            let (len, got) = receive_blocking(&client, &mut reply)?;
            if len != size || got != trailer {
                return Err(Error::Defect("echo mismatch"));
            }
            Ok(())
        };

        for _ in 0..args.warmup {
            round(txid)?;
            txid = (txid + 1) % TxId::ANY.0;
        }
        let start = Instant::now();
        for _ in 0..args.iterations {
            round(txid)?;
            txid = (txid + 1) % TxId::ANY.0;
        }
        let elapsed = start.elapsed();

        let rtt_us = elapsed.as_secs_f64() * 1e6 / args.iterations.max(1) as f64;
        let mops = args.iterations as f64 / elapsed.as_secs_f64() / 1e6;
        println!("{size:>8} {rtt_us:>12.3} {mops:>12.3}");
    }

    server.join().map_err(|_| "server thread panicked")??;
    client.release()?;
    listener.release()?;

    let leaked = transport.fabric().resources();
    if !leaked.is_empty() {
        tracing::warn!(?leaked, "resources still live after teardown");
    }
    Ok(())
}
