//! The cluster server daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use iclaustron_server::{ClusterServer, CsOptions};

#[derive(Debug, Parser)]
#[command(name = "ic_csd", about = "iClaustron cluster server")]
struct Args {
    /// Peer cluster servers as `host:port,host:port`, checked against
    /// the committed grid at start-up.
    #[arg(long = "cs_connectstring")]
    cs_connectstring: Option<String>,

    /// Hostname the configuration port binds to.
    #[arg(long = "cs_hostname", default_value = "0.0.0.0")]
    cs_hostname: String,

    /// Configuration port.
    #[arg(long = "cs_port", default_value_t = iclaustron_core::types::IC_DEF_CLUSTER_SERVER_PORT)]
    cs_port: u16,

    /// Serve the iClaustron protocol extensions (cluster lists, extended
    /// node kinds) rather than the classic subset only.
    #[arg(long = "use_iclaustron_cluster_server", default_value_t = true)]
    use_iclaustron_cluster_server: bool,

    /// This cluster server's node id.
    #[arg(long = "node_id")]
    node_id: u32,

    /// Configuration directory.
    #[arg(long = "data_dir", default_value = ".")]
    data_dir: PathBuf,

    /// Bound on concurrently served protocol connections.
    #[arg(long = "num_threads", default_value_t = 16)]
    num_threads: usize,

    /// Installation base directory.
    #[arg(long = "basedir")]
    basedir: Option<PathBuf>,

    /// iClaustron version string of the installation.
    #[arg(long = "iclaustron_version")]
    iclaustron_version: Option<String>,

    /// Run in the background. Process supervision is expected to handle
    /// this; the flag is accepted and the server stays in the foreground.
    #[arg(long = "daemonize", default_value_t = false)]
    daemonize: bool,

    /// Log verbosity, 0 (errors) to 3 (trace).
    #[arg(long = "debug_level", default_value_t = 1)]
    debug_level: u8,

    /// Log to this file instead of the terminal.
    #[arg(long = "debug_file")]
    debug_file: Option<PathBuf>,

    /// Force logging to the terminal even with a debug file.
    #[arg(long = "debug_screen", default_value_t = false)]
    debug_screen: bool,
}

fn parse_connectstring(text: &str) -> anyhow::Result<Vec<(String, u16)>> {
    let mut peers = Vec::new();
    for part in text.split(',') {
        let (host, port) = part
            .rsplit_once(':')
            .with_context(|| format!("bad endpoint `{part}`"))?;
        let port = port
            .parse()
            .with_context(|| format!("bad port in `{part}`"))?;
        peers.push((host.to_string(), port));
    }
    Ok(peers)
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.debug_level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    match (&args.debug_file, args.debug_screen) {
        (Some(path), false) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening debug file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    if args.daemonize {
        tracing::warn!("daemonize requested; running in the foreground under supervision");
    }
    tracing::info!(
        iclaustron = args.use_iclaustron_cluster_server,
        "protocol extensions configured"
    );
    let configured_peers = match &args.cs_connectstring {
        Some(text) => parse_connectstring(text)?,
        None => Vec::new(),
    };
    for (host, port) in &configured_peers {
        tracing::info!(host = %host, port, "configured peer cluster server");
    }

    let options = CsOptions {
        data_dir: args.data_dir.clone(),
        hostname: args.cs_hostname.clone(),
        port: args.cs_port,
        node_id: args.node_id,
        num_workers: args.num_threads,
        process_name: "ic_csd".to_string(),
        bootstrap_grid_file: None,
        start_transport: true,
    };

    let server = match ClusterServer::start(options).await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("{}", err.fill_error_buffer());
            std::process::exit(err.exit_code());
        }
    };

    // Every peer named on the command line should appear as a cluster
    // server somewhere in the committed grid.
    let grid = server.state.current_grid();
    for (host, port) in &configured_peers {
        let known = grid.clusters().any(|cluster| {
            cluster.nodes().any(|node| {
                matches!(
                    node,
                    iclaustron_core::config::NodeConfig::ClusterServer(cs)
                        if cs.common.hostname == *host && cs.port_number == *port
                )
            })
        });
        if !known {
            tracing::warn!(host = %host, port,
                "configured peer is not a cluster server in the grid");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    if let Err(err) = server.shutdown().await {
        eprintln!("{}", err.fill_error_buffer());
        std::process::exit(err.exit_code());
    }
    Ok(())
}
