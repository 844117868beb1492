mod commands;
mod config;
mod sink;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bpfkit_userspace::BpfRingbufBase;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use crate::config::ToolConfig;
use crate::sink::{EventSink, JsonLinesSink, MessageJson};

#[derive(Debug, Parser)]
#[clap(version, about = "Inspect eBPF maps and ring buffers pinned on a bpf filesystem")]
struct Opt {
    /// Configuration file (TOML). Defaults to /etc/bpfkit/config.toml if present.
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the running kernel version and architecture
    Kernel,
    /// Print the metadata of a pinned map as JSON
    Info { path: PathBuf },
    /// Print every entry of a pinned map
    Dump {
        path: PathBuf,
        /// Print `key,value` base64 lines instead of hex
        #[clap(long)]
        base64: bool,
    },
    /// Delete every entry of a pinned map
    Clear { path: PathBuf },
    /// Report whether a pinned map can be opened
    Status { name: String, path: PathBuf },
    /// Stream messages from a pinned ring buffer as JSON lines
    Tail {
        path: PathBuf,
        /// Size in bytes of every message in the ring
        #[clap(long)]
        value_size: usize,
        /// Stop once at least this many messages were delivered
        #[clap(long)]
        max_messages: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // stdout carries command output, so logs go to stderr
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let opt = Opt::parse();
    let config = ToolConfig::load(opt.config.as_deref())?;

    match opt.command {
        Command::Kernel => {
            let report = commands::KernelReport::current();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Info { path } => {
            let metadata = commands::map_metadata(&config.resolve(&path))?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Command::Dump { path, base64 } => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            commands::dump_map(&config.resolve(&path), base64, &mut out)?;
            out.flush()?;
        }
        Command::Clear { path } => commands::clear_map(&config.resolve(&path))?,
        Command::Status { name, path } => {
            commands::map_status(&name, &config.resolve(&path), &mut io::stdout().lock())?;
        }
        Command::Tail {
            path,
            value_size,
            max_messages,
        } => run_tail(&config, config.resolve(&path), value_size, max_messages).await?,
    }

    Ok(())
}

async fn run_tail(
    config: &ToolConfig,
    path: PathBuf,
    value_size: usize,
    max_messages: Option<u64>,
) -> Result<(), anyhow::Error> {
    let mut ring = BpfRingbufBase::create(&path, value_size)
        .with_context(|| format!("opening ring buffer {}", path.display()))?;

    // Create a channel for sending messages
    let (tx, rx) = mpsc::channel::<Bytes>(config.channel_capacity);

    // Spawn a task to handle output
    let sink: Arc<dyn EventSink> = Arc::new(JsonLinesSink::new(io::stdout(), config.flush_every));
    let logging_handle = tokio::spawn(handle_logging(rx, sink));

    // Create a shutdown signal
    let shutdown = Arc::new(AtomicBool::new(false));

    info!("Draining {}. Waiting for Ctrl-C...", path.display());

    let poll_timeout = Duration::from_millis(config.poll_timeout_ms);
    let reader_shutdown = shutdown.clone();
    let mut reader = tokio::task::spawn_blocking(move || {
        let mut delivered: u64 = 0;
        while !reader_shutdown.load(Ordering::Relaxed) {
            if !ring.wait(Some(poll_timeout)) {
                continue;
            }
            let result = ring.consume_all_raw(|payload| {
                if tx.blocking_send(Bytes::copy_from_slice(payload)).is_ok() {
                    delivered += 1;
                }
            });
            if let Err(e) = result {
                warn!("Dropped ring buffer message: {}", e);
            }
            if max_messages.is_some_and(|max| delivered >= max) {
                break;
            }
        }
        delivered
    });

    let delivered = tokio::select! {
        joined = &mut reader => joined?,
        _ = signal::ctrl_c() => {
            info!("Exiting...");
            shutdown.store(true, Ordering::Relaxed);
            reader.await?
        }
    };

    // The reader dropped its sender, so the logging task drains and returns.
    logging_handle.await?;
    info!("Delivered {} messages", delivered);

    Ok(())
}

async fn handle_logging(mut rx: mpsc::Receiver<Bytes>, sink: Arc<dyn EventSink>) {
    let mut seq = 0;
    while let Some(payload) = rx.recv().await {
        let record = MessageJson::new(seq, &payload);
        seq += 1;
        match serde_json::to_value(&record) {
            Ok(value) => {
                if let Err(e) = sink.log_event(value).await {
                    error!("Error writing message: {}", e);
                }
            }
            Err(e) => error!("Error serializing message: {}", e),
        }
    }
    if let Err(e) = sink.flush().await {
        error!("Error flushing messages: {}", e);
    }
}
