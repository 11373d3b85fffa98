//! # Summary
//!
//! Throughput probe for a running `pichain-server`: opens one client
//! connection, fires a configurable number of `put` lines at a fixed
//! rate, and reports the wall-clock time between the first and last
//! acknowledgement. Mirrors the shape of a simple load-generating
//! client — connect once, reconnect with backoff on drop, stream
//! requests out on a timer while draining responses on the same
//! socket.

use std::time::{Duration, Instant};

use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(StructOpt)]
#[structopt(name = "pichain-demo")]
struct Opt {
    /// Host of the target server's client port
    #[structopt(short = "h", long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Client port of the target server
    #[structopt(short = "p", long = "port")]
    port: u16,

    /// Number of put requests to send
    #[structopt(short = "n", long = "count", default_value = "500")]
    count: u64,

    /// Requests per second
    #[structopt(short = "r", long = "rate", default_value = "100")]
    rate: u64,

    /// Logging output verbosity
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("[{}][{}]: {}", record.level(), record.target(), message))
        })
        .level_for("demo", level)
        .chain(std::io::stdout())
        .apply()
        .expect("logger already initialized");

    let stream = connect_with_backoff(&opt.host, opt.port).await;
    run(stream, opt.count, opt.rate).await;
}

async fn connect_with_backoff(host: &str, port: u16) -> TcpStream {
    let addr = format!("{}:{}", host, port);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                log::info!("connected to {}", addr);
                return stream;
            }
            Err(err) => {
                log::warn!("could not connect to {}: {}, retrying in {:?}", addr, err, backoff);
                tokio::time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            }
        }
    }
}

async fn run(stream: TcpStream, count: u64, rate: u64) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let period = Duration::from_millis(1000 / rate.max(1));
    let writer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        for i in 0..count {
            interval.tick().await;
            let line = format!("put k{} v\n", i);
            if write_half.write_all(line.as_bytes()).await.is_err() {
                log::warn!("connection closed while sending request {}", i);
                return;
            }
        }
    });

    let mut received = 0u64;
    let mut start = None;
    let mut end = None;
    while received < count {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!("{}", line);
                if start.is_none() {
                    start = Some(Instant::now());
                }
                received += 1;
                if received == count {
                    end = Some(Instant::now());
                }
            }
            Ok(None) => {
                log::warn!("connection closed after {} of {} responses", received, count);
                break;
            }
            Err(err) => {
                log::warn!("read error: {}", err);
                break;
            }
        }
    }

    let _ = writer.await;

    match (start, end) {
        (Some(start), Some(end)) => {
            let elapsed = end.duration_since(start);
            println!(
                "received {} responses in {:.3}s ({:.1} req/s)",
                received,
                elapsed.as_secs_f64(),
                received as f64 / elapsed.as_secs_f64().max(0.001)
            );
        }
        _ => println!("received {} of {} responses", received, count),
    }
}
