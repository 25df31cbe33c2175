//! Configuration client: fetch a grid's configuration from a cluster
//! server and print it.

use anyhow::Context;
use clap::Parser;
use iclaustron_core::config::CsEndpoint;
use iclaustron_core::types::{pack_version, NodeKind, IC_VERSION, NDB_VERSION};
use iclaustron_server::proto::{get_cs_config, ConfigClientOptions};

#[derive(Debug, Parser)]
#[command(name = "ic_cfgc", about = "iClaustron configuration client")]
struct Args {
    /// Cluster servers as `host:port,host:port`, tried in order.
    #[arg(long = "cs_connectstring")]
    cs_connectstring: Option<String>,

    /// Single cluster-server host, used when no connect string is given.
    #[arg(long = "cs_hostname", default_value = "127.0.0.1")]
    cs_hostname: String,

    /// Single cluster-server port.
    #[arg(long = "cs_port", default_value_t = iclaustron_core::types::IC_DEF_CLUSTER_SERVER_PORT)]
    cs_port: u16,

    /// Requested node id; zero accepts any compatible id.
    #[arg(long = "node_id", default_value_t = 0)]
    node_id: u32,

    /// Speak the iClaustron protocol extensions.
    #[arg(long = "use_iclaustron_cluster_server", default_value_t = true)]
    use_iclaustron_cluster_server: bool,

    /// Dump the fetched configuration as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Log verbosity, 0 (errors) to 3 (trace).
    #[arg(long = "debug_level", default_value_t = 0)]
    debug_level: u8,

    /// Cluster names to fetch; empty fetches every listed cluster.
    clusters: Vec<String>,
}

fn parse_connectstring(text: &str) -> anyhow::Result<Vec<CsEndpoint>> {
    let mut endpoints = Vec::new();
    for part in text.split(',') {
        let (host, port) = part
            .rsplit_once(':')
            .with_context(|| format!("bad endpoint `{part}`"))?;
        endpoints.push(CsEndpoint {
            hostname: host.to_string(),
            port: port.parse().with_context(|| format!("bad port in `{part}`"))?,
        });
    }
    Ok(endpoints)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = match args.debug_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    let endpoints = match &args.cs_connectstring {
        Some(text) => parse_connectstring(text)?,
        None => vec![CsEndpoint {
            hostname: args.cs_hostname.clone(),
            port: args.cs_port,
        }],
    };
    let extended = u32::from(args.use_iclaustron_cluster_server) * IC_VERSION;
    let options = ConfigClientOptions {
        endpoints,
        cluster_names: args.clusters.clone(),
        requested_node_id: args.node_id,
        version: pack_version(NDB_VERSION, extended),
        node_type: NodeKind::Client.wire_value(),
    };

    let fetched = match get_cs_config(&options).await {
        Ok(fetched) => fetched,
        Err(err) => {
            eprintln!("{}", err.fill_error_buffer());
            std::process::exit(err.exit_code());
        }
    };

    for cluster in fetched.grid.clusters() {
        let cluster_id = cluster.info.cluster_id;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&cluster.to_summary())?);
            continue;
        }
        println!(
            "cluster {} ({}): generation {}, node id {} assigned to us",
            cluster_id,
            cluster.info.cluster_name,
            cluster.system.configuration_number,
            fetched.node_ids.get(&cluster_id).copied().unwrap_or(0),
        );
        for (kind, count) in cluster.kind_counts() {
            println!("  {:18} {}", kind.section_name(), count);
        }
        for node in cluster.nodes() {
            println!(
                "  node {:3}  {:16} {}",
                node.node_id(),
                node.kind().section_name(),
                node.common().hostname,
            );
        }
        println!("  {} links", cluster.num_comms());
    }
    Ok(())
}
