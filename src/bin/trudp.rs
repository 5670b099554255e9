//! `trudp client` / `trudp server`: CLI front end over the library's
//! `Endpoint` API, as two subcommands of one binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use trudp::{Config, Endpoint, MetricsSink};

#[derive(Parser)]
#[command(name = "trudp", about = "Reliable byte-stream transport over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity: repeat for more detail (-v, -vv). Overridden by RUST_LOG.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    Server {
        #[arg(long)]
        bind: SocketAddr,

        /// Negotiate a session key with the first connecting client.
        #[arg(long)]
        encrypt: bool,

        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    Client {
        #[arg(long)]
        connect: SocketAddr,

        /// Send this many synthetic 1400-byte packets instead of --file.
        #[arg(long, conflicts_with = "file")]
        packets: Option<usize>,

        /// Send the contents of this file.
        #[arg(long, conflicts_with = "packets")]
        file: Option<PathBuf>,

        /// Synthetic outbound drop probability in [0, 1].
        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        /// Negotiate a session key before sending data.
        #[arg(long)]
        encrypt: bool,

        /// Print an RTT/congestion snapshot every `monitor_interval` secs.
        #[arg(long)]
        monitor: bool,

        #[arg(long, default_value_t = 5.0)]
        monitor_interval: f64,

        #[arg(long)]
        metrics_out: Option<PathBuf>,

        #[arg(long)]
        plot_out: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;
    let default_level = match verbose {
        0 => "trudp=info",
        1 => "trudp=debug",
        _ => "trudp=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

fn main() -> trudp::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Server { bind, encrypt, metrics_out } => run_server(bind, encrypt, metrics_out),
        Command::Client {
            connect,
            packets,
            file,
            loss,
            encrypt,
            monitor,
            monitor_interval,
            metrics_out,
            plot_out,
        } => run_client(
            connect,
            packets,
            file,
            loss,
            encrypt,
            monitor,
            monitor_interval,
            metrics_out,
            plot_out,
        ),
    }
}

fn run_server(bind: SocketAddr, encrypt: bool, metrics_out: Option<PathBuf>) -> trudp::Result<()> {
    info!(%bind, "listening for a TRUDP handshake");
    let config = Config::default();
    let endpoint = Endpoint::listen(bind, config)?;
    info!("handshake complete");

    let metrics = metrics_out.as_ref().map(|_| Arc::new(MetricsSink::new("server")));
    if let Some(sink) = &metrics {
        endpoint.set_metrics_sink(Arc::clone(sink));
    }

    if encrypt {
        endpoint.await_key_agreement()?;
        info!("session key agreed");
    }

    loop {
        let chunk = endpoint.recv_data(65536)?;
        if chunk.is_empty() {
            break;
        }
        info!(bytes = chunk.len(), "received data");
    }

    endpoint.close()?;
    if let (Some(sink), Some(path)) = (&metrics, &metrics_out) {
        sink.save_to_file(path).map_err(trudp::Error::Io)?;
    }
    Ok(())
}

fn run_client(
    connect: SocketAddr,
    packets: Option<usize>,
    file: Option<PathBuf>,
    loss: f64,
    encrypt: bool,
    monitor: bool,
    monitor_interval: f64,
    metrics_out: Option<PathBuf>,
    plot_out: Option<PathBuf>,
) -> trudp::Result<()> {
    let mut config = Config::default();
    config.loss_probability = loss;

    info!(%connect, "initiating TRUDP handshake");
    let endpoint = Endpoint::connect(connect, config)?;
    info!("handshake complete");

    let metrics = metrics_out
        .as_ref()
        .or(plot_out.as_ref())
        .map(|_| Arc::new(MetricsSink::new("client")));
    if let Some(sink) = &metrics {
        endpoint.set_metrics_sink(Arc::clone(sink));
    }

    if encrypt {
        endpoint.negotiate_key_as_initiator()?;
        info!("session key agreed");
    }

    let payload = match file {
        Some(path) => std::fs::read(path)?,
        None => vec![0xABu8; 1400 * packets.unwrap_or(10)],
    };

    let monitor_handle = monitor.then(|| {
        let endpoint = Arc::clone(&endpoint);
        let interval = Duration::from_secs_f64(monitor_interval.max(0.1));
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            trudp::snapshot_from_endpoint(&endpoint);
        })
    });

    endpoint.send_data(&payload)?;
    info!(bytes = payload.len(), "send completed");

    endpoint.close()?;
    drop(monitor_handle);

    if let (Some(sink), Some(path)) = (&metrics, &metrics_out) {
        sink.save_to_file(path).map_err(trudp::Error::Io)?;
    }
    if let (Some(sink), Some(dir)) = (&metrics, &plot_out) {
        if let Err(e) = trudp::render_panel(sink, dir) {
            tracing::warn!(error = %e, "failed to render plot panel");
        }
    }
    Ok(())
}
