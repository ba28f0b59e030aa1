//! Passage CLI tool
//!
//! Send and receive files with a short transfer code.

use clap::{Parser, Subcommand};
use passage::{
    config::config_file_path, Config, ReceivedFile, SessionEvent, TransferCode, TransferContext,
    TransferError, TransferSession,
};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Passage: send a file to anyone holding the same code
#[derive(Parser)]
#[command(name = "passage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: <config dir>/passage/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay URL, overrides config and PASSAGE_RELAY_URL
    #[arg(long)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh transfer code
    Code,

    /// Classify the local network
    Probe,

    /// Send a file
    Send {
        /// File to send
        file: PathBuf,

        /// Use this code instead of generating one
        #[arg(short, long)]
        code: Option<String>,
    },

    /// Receive a file
    Receive {
        /// Code given by the sender
        code: String,

        /// Directory to write the file into (default: download_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("passage=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config_file_path);

    let result = match load_config(&config_path, cli.relay) {
        Ok(config) => match cli.command {
            Commands::Code => cmd_code(),
            Commands::Probe => cmd_probe(config).await,
            Commands::Send { file, code } => cmd_send(config, &file, code).await,
            Commands::Receive { code, output } => cmd_receive(config, &code, output).await,
            Commands::InitConfig { force } => cmd_init_config(&config, &config_path, force),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if let TransferError::AllTransportsExhausted { attempts } = &e {
            for attempt in attempts {
                eprintln!(
                    "  {:<12} {} after {:.1}s",
                    attempt.transport,
                    attempt.outcome,
                    attempt.elapsed.as_secs_f64()
                );
            }
        }
        std::process::exit(exit_code(&e));
    }
}

fn load_config(path: &Path, relay: Option<String>) -> passage::Result<Config> {
    let mut config = Config::load_from(path)?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(relay) = relay {
        config.relay_url = relay;
    }
    config.validate()?;
    Ok(config)
}

fn exit_code(err: &TransferError) -> i32 {
    match err {
        TransferError::Cancelled => 130,
        TransferError::WeakCode { .. } | TransferError::Config(_) => 2,
        _ => 1,
    }
}

fn cmd_code() -> passage::Result<()> {
    println!("{}", TransferCode::generate().as_str());
    Ok(())
}

fn cmd_init_config(config: &Config, path: &Path, force: bool) -> passage::Result<()> {
    if path.exists() && !force {
        return Err(TransferError::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }
    config.save_to(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

async fn cmd_probe(config: Config) -> passage::Result<()> {
    let ctx = TransferContext::from_config(config).await?;
    let profile = ctx
        .profiler()
        .classify(ctx.config().probe_timeout())
        .await;

    println!("Network type:    {}", profile.network_type);
    println!("Restrictive:     {}", profile.is_restrictive);
    println!("Proxy:           {:?}", profile.detected_proxy_kind);
    println!("Reachable ports: {:?}", profile.reachable_ports);
    println!();

    let cancel = tokio_util::sync::CancellationToken::new();
    let order = ctx.manager().select_order(&profile, 0, &cancel).await;
    println!("Transport order:");
    for (i, entry) in order.iter().enumerate() {
        println!(
            "  {}. {:<12} priority {:<4} {}",
            i + 1,
            entry.name(),
            entry.backend.priority(),
            if entry.available { "available" } else { "deferred" }
        );
    }

    ctx.shutdown().await;
    Ok(())
}

async fn cmd_send(config: Config, file: &Path, code: Option<String>) -> passage::Result<()> {
    let data = tokio::fs::read(file).await?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::Config(format!("not a file: {}", file.display())))?
        .to_string();

    let code = code
        .map(|c| TransferCode::parse(&c))
        .unwrap_or_else(TransferCode::generate);

    println!("Transfer code: {}", code.as_str());
    println!("On the other machine run: passage receive {}", code.as_str());
    println!();

    let ctx = TransferContext::from_config(config).await?;
    let session = TransferSession::sender(ctx.clone(), code);
    let report = run_with_ctrl_c(&session, session.send(&file_name, &data)).await;
    ctx.shutdown().await;
    let report = report?;

    println!(
        "Sent {} ({} bytes) over {} with {}",
        report.metadata.file_name, report.metadata.file_size, report.transport, report.mode
    );
    Ok(())
}

async fn cmd_receive(config: Config, code: &str, output: Option<PathBuf>) -> passage::Result<()> {
    let output = output.unwrap_or_else(|| config.download_dir.clone());
    let ctx = TransferContext::from_config(config).await?;

    let session = TransferSession::receiver(ctx.clone(), TransferCode::parse(code));
    let received = run_with_ctrl_c(&session, session.receive()).await;
    ctx.shutdown().await;
    let received: ReceivedFile = received?;

    let path = received.save_into(&output).await?;
    println!(
        "Received {} ({} bytes) over {} with {}",
        path.display(),
        received.data.len(),
        received.transport,
        received.mode
    );
    Ok(())
}

/// Drive a session operation, printing its events and cancelling on Ctrl-C
async fn run_with_ctrl_c<T>(
    session: &TransferSession,
    operation: impl std::future::Future<Output = passage::Result<T>>,
) -> passage::Result<T> {
    let printer = tokio::spawn(print_events(session.subscribe()));
    let cancel = session.cancel_handle();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            cancel.cancel();
        }
    });

    let result = operation.await;
    watcher.abort();
    printer.abort();
    result
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Status { state, phase }) => eprintln!("[{}] {}", state, phase),
            Ok(SessionEvent::Progress {
                bytes_transferred,
                total_bytes,
                file_name,
            }) => eprintln!("{}: {}/{} bytes", file_name, bytes_transferred, total_bytes),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
