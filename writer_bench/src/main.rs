use std::error::Error;
use std::io::{self, BufRead};
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fmq::{Fmq, FmqConfig, OpenMode, StartPosition};

/// Payload of the last message of a full run; `reader_bench` stops on it.
const END_MARKER: &str = " 🐓 🏰 🥕 ";

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "fmq-writer.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "1000000")]
    count: usize,
    /// Pad every message to at least this many bytes.
    #[clap(long = "size", default_value = "0")]
    size: usize,
    #[clap(long = "type", default_value = "0")]
    msg_type: i32,
    #[clap(long = "pause-after-write")]
    pause_after_write: bool,
    /// Read the queue back from the start and check every surviving message.
    #[clap(long)]
    read_after_write: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct WriterConfig {
    fmq: FmqConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    info!("writing to {} ({} slots, {} bytes)", cfg.fmq.path, cfg.fmq.nslots, cfg.fmq.buf_size);
    let mut writer = Fmq::open(cfg.fmq.clone())?;
    run(&mut writer, &opts)?;
    writer.close();

    if opts.read_after_write {
        verify(&cfg.fmq)?;
    }
    if opts.pause_after_write {
        println!("[Writer] Done. Press Enter to exit.");
        io::stdin().lock().read_line(&mut String::new())?;
    }
    Ok(())
}

fn message(n: usize, size: usize) -> String {
    let mut text = n.to_string();
    if text.len() < size {
        text.push_str(&"-".repeat(size - text.len()));
    }
    text
}

fn run(writer: &mut Fmq, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let mut written = 0usize;
    while written < opts.count {
        let id = writer.write(message(written, opts.size).as_bytes(), opts.msg_type, 0)?;
        if written % 100_000 == 0 {
            eprint!("\rTotal {} ops (last id {})", written, id);
        }
        written += 1;
    }
    if !opts.read_after_write {
        writer.write(END_MARKER.as_bytes(), opts.msg_type, 0)?;
        written += 1;
    }

    let duration = start.elapsed();
    let rate = written as f64 / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{}K messages write/s. Total {} in {:#?}",
        (rate / 1000f64) as u64,
        written,
        duration
    );
    Ok(())
}

/// Every message still in the queue must carry the text written for its position.
fn verify(cfg: &FmqConfig) -> Result<(), Box<dyn Error>> {
    println!("\n--- Read After Write Phase ---");
    let mut reader = Fmq::open(
        cfg.clone()
            .mode(OpenMode::ReadOnly)
            .position(StartPosition::Start),
    )?;
    let mut stdout = io::stdout();
    reader.print_status(&mut stdout)?;

    let mut checked = 0usize;
    let mut mismatches = 0usize;
    // (id, counter) of the first surviving message; later ones follow it one to one.
    let mut first: Option<(i32, usize)> = None;
    while let Some(msg) = reader.read_next(None)? {
        let text = String::from_utf8_lossy(&msg.payload);
        let counter = text.trim_end_matches('-').parse::<usize>().ok();
        let ok = match (first, counter) {
            (_, None) => false,
            (None, Some(n)) => {
                first = Some((msg.id, n));
                true
            }
            (Some((id0, n0)), Some(n)) => n == n0 + (msg.id - id0) as usize,
        };
        if !ok {
            warn!("id {}: unexpected payload {:?}", msg.id, text);
            mismatches += 1;
        }
        checked += 1;
    }
    let stats = reader.read_stats();
    println!(
        "[Read Phase] checked {} messages, {} mismatches, {} skips ({} lost)",
        checked, mismatches, stats.skips, stats.lost
    );
    if mismatches > 0 {
        return Err(format!("{} messages did not match", mismatches).into());
    }
    Ok(())
}
