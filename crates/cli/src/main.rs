//! # CLI - RiptideKV Interactive Shell
//!
//! A REPL-style command-line interface for the RiptideKV storage engine.
//! Reads commands from stdin, executes them against the engine, and prints
//! results to stdout. Designed for both interactive use and scripted testing
//! (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value      Insert or update a key-value pair
//! GET key            Look up a key (prints value or "(nil)")
//! DEL key            Delete a key (writes a tombstone)
//! SCAN [start] [end] Range scan (inclusive start, exclusive end)
//! FLUSH              Force flush the default column family's memtable
//! COMPACT            Trigger manual compaction (L0 + L1 -> L1)
//! STATS              Print engine debug info
//! EXIT / QUIT        Shut down gracefully
//! ```
//!
//! ## Configuration
//!
//! Settings load from an optional `RIPTIDE_CONFIG` TOML file (see
//! `config::EngineConfig`), then `RIPTIDE_*` environment variables overlay
//! on top — see `config::EngineConfig::apply_env_overrides`. Logging is
//! controlled the usual `env_logger` way via `RUST_LOG`.
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! RiptideKV started (seq=0, wal_dir=wal, sst_dir=data/sst, l0_trigger=4)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > SCAN
//! name -> Alice
//! (1 entries)
//! > EXIT
//! bye
//! ```
use anyhow::Result;
use engine::{DEFAULT_CF, Engine, WriteOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

fn main() -> Result<()> {
    env_logger::init();

    let config_path = std::env::var("RIPTIDE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("riptide.toml"));
    let config = config::EngineConfig::load_from_file_and_env(&config_path)?;

    let wal_dir = config.wal_dir.display().to_string();
    let sst_dir = config.sst_dir.display().to_string();
    let l0_trigger = config.l0_compaction_trigger;

    let mut engine = Engine::open(config)?;
    log::info!("engine opened (wal_dir={}, sst_dir={})", wal_dir, sst_dir);

    println!(
        "RiptideKV started (seq={}, wal_dir={}, sst_dir={}, l0_trigger={})",
        engine.seq(),
        wal_dir,
        sst_dir,
        l0_trigger
    );
    println!("Commands: SET key value | GET key | DEL key | SCAN [start] [end]");
    println!("          COMPACT | FLUSH | STATS | EXIT");
    print!("> ");
    io::stdout().flush().ok();

    let stdin = io::stdin();

    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        if let Some(cmd) = parts.next() {
            match cmd.to_uppercase().as_str() {
                "SET" => {
                    if let Some(k) = parts.next() {
                        let v: String = parts.collect::<Vec<&str>>().join(" ");
                        if v.is_empty() {
                            println!("ERR usage: SET key value");
                        } else {
                            match engine.put(
                                WriteOptions::new(),
                                DEFAULT_CF,
                                k.as_bytes().to_vec(),
                                v.as_bytes().to_vec(),
                            ) {
                                Ok(()) => println!("OK"),
                                Err(e) => println!("ERR set failed: {}", e),
                            }
                        }
                    } else {
                        println!("ERR usage: SET key value");
                    }
                }
                "GET" => {
                    if let Some(k) = parts.next() {
                        match engine.get(k.as_bytes()) {
                            Ok(Some((_seq, v))) => println!("{}", String::from_utf8_lossy(&v)),
                            Ok(None) => println!("(nil)"),
                            Err(e) => println!("ERR read failed: {}", e),
                        }
                    } else {
                        println!("ERR usage: GET key");
                    }
                }
                "DEL" => {
                    if let Some(k) = parts.next() {
                        match engine.delete(WriteOptions::new(), DEFAULT_CF, k.as_bytes().to_vec()) {
                            Ok(()) => println!("OK"),
                            Err(e) => println!("ERR del failed: {}", e),
                        }
                    } else {
                        println!("ERR usage: DEL key");
                    }
                }
                "SCAN" => {
                    let start = parts.next().unwrap_or("").as_bytes();
                    let end = parts.next().unwrap_or("").as_bytes();
                    match engine.scan(start, end) {
                        Ok(results) => {
                            if results.is_empty() {
                                println!("(empty)");
                            } else {
                                for (k, v) in &results {
                                    println!(
                                        "{} -> {}",
                                        String::from_utf8_lossy(k),
                                        String::from_utf8_lossy(v)
                                    );
                                }
                                println!("({} entries)", results.len());
                            }
                        }
                        Err(e) => println!("ERR scan failed: {}", e),
                    }
                }
                "COMPACT" => match engine.compact() {
                    Ok(()) => println!(
                        "OK (L0={}, L1={})",
                        engine.l0_sstable_count(),
                        engine.l1_sstable_count()
                    ),
                    Err(e) => println!("ERR compact failed: {}", e),
                },
                "FLUSH" => match engine.force_flush() {
                    Ok(flushed) => println!(
                        "OK flushed={} (L0={}, L1={})",
                        flushed,
                        engine.l0_sstable_count(),
                        engine.l1_sstable_count()
                    ),
                    Err(e) => println!("ERR flush failed: {}", e),
                },
                "STATS" => {
                    println!("{:?}", engine);
                }
                "EXIT" | "QUIT" => {
                    println!("bye");
                    break;
                }
                other => {
                    println!("unknown command: {}", other);
                }
            }
        }

        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}
