//! The cluster-server runtime: configuration ownership, accept loop,
//! bounded worker pool, and hand-off of converted transporter sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use iclaustron_core::codec::encode_config;
use iclaustron_core::config::{GridConfig, NodePair};
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::registry::ids;
use iclaustron_core::types::{ClusterId, NodeId, NodeKind};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::files::{self, load_cluster, load_grid_file, lock_and_load, ProcProcessCheck};
use crate::proto::{serve_connection, CsService, LineConnection, ServeOutcome};
use crate::transport::{ApidGlobal, TransportOptions};

/// Start-up options of the cluster-server daemon.
#[derive(Debug, Clone)]
pub struct CsOptions {
    pub data_dir: PathBuf,
    /// Bind host of the configuration port.
    pub hostname: String,
    /// Configuration port; zero picks an ephemeral port.
    pub port: u16,
    /// This cluster server's node id in every cluster it serves.
    pub node_id: NodeId,
    /// Bound on concurrently served protocol connections.
    pub num_workers: usize,
    /// Process name recorded in the ownership file.
    pub process_name: String,
    /// Grid file used when no generation exists yet; defaults to
    /// `config.ini` inside the data directory.
    pub bootstrap_grid_file: Option<PathBuf>,
    /// Whether to start the data transport toward the grid's peers.
    pub start_transport: bool,
}

impl Default for CsOptions {
    fn default() -> CsOptions {
        CsOptions {
            data_dir: PathBuf::from("."),
            hostname: "0.0.0.0".to_string(),
            port: iclaustron_core::types::IC_DEF_CLUSTER_SERVER_PORT,
            node_id: 0,
            num_workers: 16,
            process_name: "ic_csd".to_string(),
            bootstrap_grid_file: None,
            start_transport: false,
        }
    }
}

/// Shared state behind the protocol service: the served configuration
/// and the ephemeral assignment bookkeeping.
pub struct CsState {
    grid: ArcSwap<GridConfig>,
    version: AtomicU32,
    own_node_id: NodeId,
    /// Node ids handed out since start-up.
    assigned: DashMap<(ClusterId, NodeId), ()>,
    /// Dynamic ports reported by starting nodes; negative values denote
    /// a port still pending allocation on the reporting side.
    dynamic_ports: DashMap<(ClusterId, NodeId, NodeId), i64>,
}

impl CsState {
    #[must_use]
    pub fn current_grid(&self) -> Arc<GridConfig> {
        self.grid.load_full()
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Swaps in a newly committed generation.
    pub fn install_generation(&self, grid: Arc<GridConfig>, version: u32) {
        self.grid.store(grid);
        self.version.store(version, Ordering::Release);
    }
}

impl CsService for CsState {
    fn cluster_list(&self) -> Vec<(String, ClusterId)> {
        self.grid
            .load()
            .clusters()
            .map(|c| (c.info.cluster_name.clone(), c.info.cluster_id))
            .collect()
    }

    fn assign_node_id(
        &self,
        cluster_id: ClusterId,
        node_type: u32,
        requested: NodeId,
    ) -> IcResult<NodeId> {
        let grid = self.grid.load();
        let cluster = grid
            .cluster(cluster_id)
            .ok_or(IcError::NoSuchCluster { cluster_id })?;
        let kind = NodeKind::from_wire_value(node_type)
            .ok_or(IcError::ProtocolError { line: line!() })?;

        let compatible = |node_id: NodeId| {
            cluster.node_kind(node_id) == Some(kind)
                && !self.assigned.contains_key(&(cluster_id, node_id))
        };
        let chosen = if requested != 0 && compatible(requested) {
            requested
        } else {
            cluster
                .node_ids()
                .find(|&candidate| compatible(candidate))
                .ok_or(IcError::NoSuchNode {
                    cluster_id,
                    node_id: requested,
                })?
        };
        self.assigned.insert((cluster_id, chosen), ());
        Ok(chosen)
    }

    fn encoded_config(&self, cluster_id: ClusterId, version: u32) -> IcResult<String> {
        let grid = self.grid.load();
        let cluster = grid
            .cluster(cluster_id)
            .ok_or(IcError::NoSuchCluster { cluster_id })?;
        encode_config(cluster, version)
    }

    fn own_node_id(&self) -> NodeId {
        self.own_node_id
    }

    fn set_connection_parameter(
        &self,
        cluster_id: ClusterId,
        node1: NodeId,
        node2: NodeId,
        param: u32,
        value: i64,
    ) -> IcResult<String> {
        if param != ids::SERVER_PORT_NUMBER {
            return Err(IcError::UnknownParameter {
                ident: param.to_string(),
            });
        }
        let grid = self.grid.load();
        let cluster = grid
            .cluster(cluster_id)
            .ok_or(IcError::NoSuchCluster { cluster_id })?;
        let pair = NodePair::new(node1, node2);
        if cluster.comm(pair).is_none() {
            return Err(IcError::NoSuchNode {
                cluster_id,
                node_id: node1,
            });
        }
        self.dynamic_ports
            .insert((cluster_id, pair.first(), pair.second()), value);

        if value > 0 {
            // A concrete port: fold it into the served configuration so
            // later get-config replies carry it.
            let mut updated = (**self.grid.load()).clone();
            if let Some(link) = updated
                .cluster_mut(cluster_id)
                .and_then(|c| c.comm_mut(pair))
            {
                link.server_port_number = value as u32;
            }
            self.grid.store(Arc::new(updated));
        }
        Ok(format!(
            "connection parameter stored for {node1}/{node2}"
        ))
    }

    fn get_connection_parameter(
        &self,
        cluster_id: ClusterId,
        node1: NodeId,
        node2: NodeId,
        param: u32,
    ) -> IcResult<i64> {
        if param != ids::SERVER_PORT_NUMBER {
            return Err(IcError::UnknownParameter {
                ident: param.to_string(),
            });
        }
        let pair = NodePair::new(node1, node2);
        if let Some(entry) = self
            .dynamic_ports
            .get(&(cluster_id, pair.first(), pair.second()))
        {
            return Ok(*entry.value());
        }
        let grid = self.grid.load();
        let link = grid
            .cluster(cluster_id)
            .and_then(|c| c.comm(pair))
            .ok_or(IcError::NoSuchNode {
                cluster_id,
                node_id: node1,
            })?;
        Ok(i64::from(link.server_port_number))
    }

    fn report_event(&self, data: &[u32]) {
        tracing::info!(words = data.len(), ?data, "event reported");
    }
}

/// The running cluster server.
pub struct ClusterServer {
    pub options: CsOptions,
    pub state: Arc<CsState>,
    pub transport: Option<Arc<ApidGlobal>>,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterServer {
    /// Locks the configuration directory, loads (or bootstraps) the
    /// current generation, and starts the accept loop.
    pub async fn start(options: CsOptions) -> IcResult<ClusterServer> {
        let check = ProcProcessCheck;
        let (version, grid) =
            lock_and_load(&options.data_dir, &options.process_name, &check)?;
        let (version, grid) = if version == 0 {
            bootstrap(&options)?
        } else {
            (version, grid)
        };
        verify_cluster_server_ids(&grid)?;

        let grid = Arc::new(grid);
        let state = Arc::new(CsState {
            grid: ArcSwap::new(Arc::clone(&grid)),
            version: AtomicU32::new(version),
            own_node_id: options.node_id,
            assigned: DashMap::new(),
            dynamic_ports: DashMap::new(),
        });

        let transport = if options.start_transport {
            let mut my_node_ids = HashMap::new();
            for cluster in grid.clusters() {
                if cluster.node(options.node_id).is_some() {
                    my_node_ids.insert(cluster.info.cluster_id, options.node_id);
                }
            }
            if my_node_ids.is_empty() {
                None
            } else {
                Some(ApidGlobal::start(
                    Arc::clone(&grid),
                    my_node_ids,
                    &TransportOptions::default(),
                )?)
            }
        } else {
            None
        };

        let listener =
            TcpListener::bind((options.hostname.as_str(), options.port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, version, "cluster server started");

        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(run_accept_loop(
            listener,
            Arc::clone(&state),
            transport.clone(),
            options.num_workers,
            stop_rx,
        ));
        let peer_task = tokio::spawn(run_peer_monitor(
            Arc::clone(&state),
            options.node_id,
            stop_tx.subscribe(),
        ));

        Ok(ClusterServer {
            options,
            state,
            transport,
            local_addr,
            stop_tx,
            tasks: Mutex::new(vec![accept_task, peer_task]),
        })
    }

    /// The bound configuration-port address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Commits a new generation from the currently served grid and swaps
    /// it in.
    pub fn commit_generation(&self) -> IcResult<u32> {
        let grid = self.state.current_grid();
        let clusters: Vec<_> = grid.clusters().cloned().collect();
        let new_version =
            files::commit_new_generation(&self.options.data_dir, &clusters, self.state.version())?;
        let reloaded = files::load_generation(&self.options.data_dir, new_version)?;
        self.state.install_generation(Arc::new(reloaded), new_version);
        Ok(new_version)
    }

    /// Stops the accept loop, releases the ownership file, and joins the
    /// workers.
    pub async fn shutdown(&self) -> IcResult<()> {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        if let Some(transport) = &self.transport {
            transport.stop().await;
        }
        files::unlock(&self.options.data_dir)?;
        tracing::info!("cluster server stopped");
        Ok(())
    }
}

/// Bootstraps generation 1 from the supplied INI inputs.
fn bootstrap(options: &CsOptions) -> IcResult<(u32, GridConfig)> {
    let grid_path = options
        .bootstrap_grid_file
        .clone()
        .unwrap_or_else(|| options.data_dir.join("config.ini"));
    let infos = load_grid_file(&grid_path)?;

    let mut clusters = Vec::with_capacity(infos.len());
    let mut grid = GridConfig::new();
    for info in infos {
        let path = options
            .data_dir
            .join(format!("{}.ini", info.cluster_name));
        let cluster = load_cluster(&path, info, 1)?;
        cluster.verify()?;
        clusters.push(cluster.clone());
        grid.add_cluster(cluster)?;
    }
    verify_cluster_server_ids(&grid)?;

    let version = files::commit_new_generation(&options.data_dir, &clusters, 0)?;
    tracing::info!(version, clusters = grid.num_clusters(), "bootstrap committed");
    Ok((version, grid))
}

/// Every cluster server and cluster manager must keep one node id across
/// all clusters it appears in; identity is its kind plus hostname.
fn verify_cluster_server_ids(grid: &GridConfig) -> IcResult<()> {
    let mut seen: HashMap<(NodeKind, String), NodeId> = HashMap::new();
    for cluster in grid.clusters() {
        for node in cluster.nodes() {
            let kind = node.kind();
            if kind != NodeKind::ClusterServer && kind != NodeKind::ClusterManager {
                continue;
            }
            let key = (kind, node.common().hostname.clone());
            match seen.get(&key) {
                None => {
                    seen.insert(key, node.node_id());
                }
                Some(&existing) if existing == node.node_id() => {}
                Some(_) => {
                    return Err(IcError::InconsistentData {
                        detail: "cluster server node id differs between clusters",
                    });
                }
            }
        }
    }
    Ok(())
}

/// Accept loop: each accepted socket is served by a pooled worker task.
async fn run_accept_loop(
    listener: TcpListener,
    state: Arc<CsState>,
    transport: Option<Arc<ApidGlobal>>,
    num_workers: usize,
    mut stop: watch::Receiver<bool>,
) {
    let pool = Arc::new(Semaphore::new(num_workers.max(1)));
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = stop.changed() => break,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
            break;
        };
        let state = Arc::clone(&state);
        let transport = transport.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let conn = LineConnection::new(stream);
            match serve_connection(conn, state.as_ref()).await {
                Ok(ServeOutcome::Closed) => {}
                Ok(ServeOutcome::Transporter {
                    stream,
                    peer_node_id,
                    cluster_id,
                    ..
                }) => match transport
                    .as_ref()
                    .and_then(|t| t.send_node(cluster_id, peer_node_id).ok())
                {
                    Some(node) => node.deliver_incoming(stream),
                    None => {
                        tracing::warn!(
                            peer = %peer_addr,
                            peer_node_id,
                            "no transport for converted connection"
                        );
                    }
                },
                Err(err) if err.is_session_local() => {
                    tracing::info!(peer = %peer_addr, error = %err, "connection closed");
                }
                Err(err) => {
                    tracing::warn!(peer = %peer_addr, error = %err, "connection failed");
                }
            }
        });
    }
}

/// Watches the other cluster servers of the grid, recording liveness.
/// Generation replication over these connections slots in here later.
async fn run_peer_monitor(
    state: Arc<CsState>,
    own_node_id: NodeId,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let peers: Vec<(String, u16)> = {
            let grid = state.current_grid();
            let mut peers = Vec::new();
            for cluster in grid.clusters() {
                for node in cluster.nodes() {
                    if node.kind() == NodeKind::ClusterServer && node.node_id() != own_node_id
                    {
                        if let iclaustron_core::config::NodeConfig::ClusterServer(cs) = node {
                            let endpoint =
                                (cs.common.hostname.clone(), cs.port_number);
                            if !peers.contains(&endpoint) {
                                peers.push(endpoint);
                            }
                        }
                    }
                }
            }
            peers
        };

        for (hostname, port) in peers {
            match tokio::net::TcpStream::connect((hostname.as_str(), port)).await {
                Ok(_) => tracing::debug!(host = %hostname, port, "peer cluster server alive"),
                Err(err) => {
                    tracing::debug!(host = %hostname, port, error = %err,
                        "peer cluster server unreachable");
                }
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(10)) => {}
            _ = stop.changed() => break,
        }
    }
}
