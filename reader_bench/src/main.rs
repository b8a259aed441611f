use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fmq::{Fmq, FmqConfig, FmqError};

const END_MARKER: &str = " 🐓 🏰 🥕 ";
const POLL_SLICE: Duration = Duration::from_millis(200);

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fmq-reader.toml")]
    config: String,
    /// Stop after this many messages.
    #[clap(short = 'n', long = "count")]
    count: Option<usize>,
    /// Only return messages of this type.
    #[clap(long = "type")]
    msg_type: Option<i32>,
    /// Print the queue status and exit.
    #[clap(long)]
    status: bool,
    /// Give up when no message arrives for this long.
    #[clap(long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ReaderConfig {
    fmq: FmqConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    let mut reader = Fmq::open(cfg.fmq)?;
    if opts.status {
        reader.print_status(&mut io::stdout())?;
        return Ok(());
    }

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    let on_signal = closing.clone();
    thread::spawn(move || {
        for _ in signals.forever() {
            on_signal.store(true, Ordering::SeqCst);
        }
    });

    run(&mut reader, &opts, &closing)?;
    Ok(())
}

fn run(reader: &mut Fmq, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let idle_limit = opts.timeout_ms.map(Duration::from_millis);
    let mut idle_since = Instant::now();
    let mut called = 0usize;

    while !closing.load(Ordering::SeqCst) {
        if opts.count.map_or(false, |count| called >= count) {
            break;
        }
        let msg = match reader.read_blocking(opts.msg_type, Some(POLL_SLICE)) {
            Ok(msg) => msg,
            Err(FmqError::Timeout(_)) => {
                if idle_limit.map_or(false, |limit| idle_since.elapsed() >= limit) {
                    info!("no message for {:?}, stopping", idle_since.elapsed());
                    break;
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        idle_since = Instant::now();

        let text = String::from_utf8_lossy(&msg.payload);
        if called % 100_000 == 0 {
            eprint!("\rTotal {} ops (id {}: {})", called, msg.id, text);
        }
        called += 1;
        if text == END_MARKER {
            println!("\nFinished at id {}", msg.id);
            break;
        }
    }

    let duration = start.elapsed();
    let rate = called as f64 / duration.as_secs_f64().max(f64::EPSILON);
    let stats = reader.read_stats();
    println!(
        "\n{}K messages read/s. Total {} in {:#?}, {} skips ({} lost)",
        (rate / 1000f64) as u64,
        called,
        duration,
        stats.skips,
        stats.lost
    );
    Ok(())
}
