use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tether_core::TetherConfig;
use tether_core::frame::{FrameReader, FrameWriter};
use tether_core::session::SessionDriver;
use tether_core::signal::completion;
use tether_core::transaction::TransactionExecutor;
use tokio::net::unix::pipe;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod emulated;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Transport address of the target controller,
    /// e.g. tcp-server:0.0.0.0:9000
    transport: String,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Override the per-operation timeout in milliseconds.
    #[clap(long)]
    op_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config_file {
        Some(config_path) => {
            info!(path = ?config_path, "loading configuration");
            TetherConfig::load_from_file(&config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("tether.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "loading default configuration");
                TetherConfig::load_from_file(&default_config_path)?
            } else {
                info!("no config file specified and default 'tether.toml' not found, using built-in defaults");
                TetherConfig::default()
            }
        }
    };

    if let Some(op_timeout_ms) = cli.op_timeout_ms {
        config.session.op_timeout_ms = op_timeout_ms;
    }

    let inbound = pipe::OpenOptions::new()
        .open_receiver(&config.pipes.inbound)
        .with_context(|| format!("opening inbound pipe {:?}", config.pipes.inbound))?;
    let outbound = open_outbound(&config.pipes.outbound).await?;
    info!(inbound = ?config.pipes.inbound, outbound = ?config.pipes.outbound, "pipes open");

    let executor = TransactionExecutor::new(
        config.session.op_timeout(),
        config.session.read_after_write,
        config.session.confirm_writes,
    );
    let host = emulated::EmulatedHost::new(&cli.transport);
    let driver = SessionDriver::new(
        host,
        FrameReader::new(inbound),
        FrameWriter::new(outbound),
        executor,
        config.session.poll_interval(),
    );

    let (signal, wait) = completion();
    let session = tokio::spawn(driver.run(signal));

    let verdict = wait.wait().await?;
    info!(?verdict, "session finished");

    session
        .await
        .context("session task panicked")?
        .context("session aborted")?;
    Ok(())
}

/// A FIFO write end cannot be opened before the fuzzer opens its read end;
/// retry until it does, matching the blocking open the fuzzer side performs.
async fn open_outbound(path: &Path) -> Result<pipe::Sender, anyhow::Error> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(tx) => return Ok(tx),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Err(e) => {
                return Err(
                    anyhow::Error::from(e).context(format!("opening outbound pipe {path:?}"))
                );
            }
        }
    }
}
