//! Read-only diagnostic tool: scans a journal directory the same way
//! recovery would on startup and prints what it found, without ever
//! opening a segment for writing.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use itertools::Itertools;
use log::error;

use btree_journal::recovery;
use btree_journal::repo::Fs;

#[derive(Parser)]
#[command(name = "journalctl", about = "Inspect a btree-journal directory without opening it for writes")]
struct Config {
    /// Path to the journal directory (the one holding journal.<generation> segment files).
    path: PathBuf,

    /// Maximum accepted record length, matching the value the owning process is configured with.
    #[clap(long, default_value_t = 64 * 1024 * 1024)]
    max_record_len: u32,

    /// Handle registry capacity, matching the value the owning process is configured with.
    #[clap(long, default_value_t = btree_journal::handle::DEFAULT_CAPACITY)]
    handle_registry_capacity: usize,
}

fn main() -> ExitCode {
    env_logger::init();
    let config = Config::parse();

    let repo = match Fs::new(&config.path) {
        Ok(repo) => repo,
        Err(e) => {
            error!("failed to open journal directory {}: {e}", config.path.display());
            return ExitCode::FAILURE;
        }
    };

    let state = match recovery::recover(&repo, config.max_record_len, config.handle_registry_capacity) {
        Ok(state) => state,
        Err(e) => {
            error!("recovery failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!(
        "segments: first_generation={} current_generation={} tail_offset={}",
        state.first_generation, state.current_generation, state.tail_offset
    );
    match state.last_checkpoint {
        Some(cp) => println!("last checkpoint: timestamp={} millis={}", cp.timestamp, cp.millis),
        None => println!("last checkpoint: none"),
    }
    match state.dirty {
        Some(d) => println!("dirty: segment {} offset {} -- journal was not cleanly closed", d.generation, d.offset),
        None => println!("dirty: none, clean shutdown"),
    }

    println!("page index ({} entries):", state.page_index.len());
    for (volume_path, group) in &state.page_index.iter().group_by(|(key, _)| key.0.path.clone()) {
        println!("  volume {volume_path}:");
        let mut last_page: Option<u64> = None;
        for (key, addr) in group {
            if let Some(last_page) = last_page {
                if key.1 > last_page + 1 {
                    println!("    ... gap: pages {}..{}", last_page + 1, key.1 - 1);
                }
            }
            println!("    #{} -> segment {} offset {} (ts={})", key.1, addr.generation, addr.offset, addr.timestamp);
            last_page = Some(key.1);
        }
    }

    ExitCode::SUCCESS
}
