//! Command-line embedding of the analysis core.
//!
//! Runs the pipeline against a capture file or a live interface with an
//! in-memory store and prints finalized connections as JSON lines. Mainly
//! useful for smoke-testing rules and captures without the full service
//! stack.

use seine_core::config::{default_config, load_config};
use seine_core::record::NoopSink;
use seine_core::sources::live::CaptureOptions;
use seine_core::storage::MemoryStore;
use seine_core::{ConnectionFilter, Core};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    /// Runtime configuration file; defaults apply when absent.
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Analyze a capture file and print its connections.
    Import {
        #[clap(parse(from_os_str), value_name = "PCAP")]
        pcap: PathBuf,
        /// Leave flows without a clean close unfinalized at end-of-file.
        #[clap(long)]
        no_flush: bool,
    },
    /// Capture live traffic for a fixed time, then print connections.
    Capture {
        #[clap(value_name = "INTERFACE")]
        interface: String,
        /// BPF filter applied at the driver.
        #[clap(long)]
        bpf: Option<String>,
        /// How long to capture, in seconds.
        #[clap(long, default_value = "60")]
        seconds: u64,
    },
    /// List capturable interfaces.
    Interfaces,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path),
        None => default_config(),
    };
    let core = Core::new(config, Arc::new(MemoryStore::new()), Arc::new(NoopSink))?;

    match args.command {
        Command::Import { pcap, no_flush } => {
            let session = core.import_file(&pcap, !no_flush)?;
            core.join_import_workers();
            let record = core.get_session(session)?;
            log::info!(
                "{}: {} packets, {} bytes, {} dropped",
                record.source,
                record.packets_read,
                record.bytes_processed,
                record.packets_dropped
            );
            print_connections(&core)?;
        }
        Command::Capture {
            interface,
            bpf,
            seconds,
        } => {
            core.start_local_capture(CaptureOptions {
                interface,
                bpf,
                ..Default::default()
            })?;
            std::thread::sleep(Duration::from_secs(seconds));
            core.stop_capture()?;
            print_connections(&core)?;
        }
        Command::Interfaces => {
            for interface in core.list_interfaces()? {
                println!("{}", serde_json::to_string(&interface)?);
            }
        }
    }

    core.shutdown();
    Ok(())
}

fn print_connections(core: &Core) -> anyhow::Result<()> {
    let filter = ConnectionFilter {
        limit: 0,
        ..Default::default()
    };
    for connection in core.get_connections(&filter)? {
        println!("{}", serde_json::to_string(&connection)?);
    }
    Ok(())
}
