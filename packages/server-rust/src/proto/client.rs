//! Client driver: fetch the grid configuration from a cluster server.

use std::collections::HashMap;

use iclaustron_core::codec::{decode_config, keys::BASE64_LINE_LEN, CodecSource};
use iclaustron_core::config::{ClusterInfo, CsEndpoint, GridConfig};
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::protocol as p;
use iclaustron_core::types::{is_iclaustron_version, ClusterId, NodeId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::line::LineConnection;

/// What to fetch and how to identify ourselves.
#[derive(Debug, Clone)]
pub struct ConfigClientOptions {
    /// Cluster servers tried in order.
    pub endpoints: Vec<CsEndpoint>,
    /// Cluster names wanted; empty means every cluster the server lists.
    pub cluster_names: Vec<String>,
    /// Requested node id, zero meaning any compatible id.
    pub requested_node_id: NodeId,
    /// Our version word; the iClaustron bit decides the protocol variant.
    pub version: u32,
    /// Our node type, as a wire value.
    pub node_type: u32,
}

/// A fetched grid plus the node id assigned to us in each cluster.
#[derive(Debug)]
pub struct FetchedConfig {
    pub grid: GridConfig,
    pub node_ids: HashMap<ClusterId, NodeId>,
}

/// Fetches the configuration of the requested clusters from the first
/// reachable cluster server.
pub async fn get_cs_config(options: &ConfigClientOptions) -> IcResult<FetchedConfig> {
    let mut last_error = IcError::GetConfigByClusterServer;
    for endpoint in &options.endpoints {
        match TcpStream::connect((endpoint.hostname.as_str(), endpoint.port)).await {
            Ok(stream) => {
                tracing::debug!(host = %endpoint.hostname, port = endpoint.port,
                    "connected to cluster server");
                return fetch_over(LineConnection::new(stream), options).await;
            }
            Err(err) => {
                tracing::debug!(host = %endpoint.hostname, port = endpoint.port,
                    error = %err, "cluster server unreachable");
                last_error = IcError::GetConfigByClusterServer;
            }
        }
    }
    Err(last_error)
}

/// Runs the full conversation over an established connection. Split from
/// [`get_cs_config`] so tests can drive it over an in-memory pipe.
pub async fn fetch_over<S: AsyncRead + AsyncWrite + Unpin>(
    mut conn: LineConnection<S>,
    options: &ConfigClientOptions,
) -> IcResult<FetchedConfig> {
    let iclaustron = is_iclaustron_version(options.version);

    // Resolve which clusters to fetch. Classic servers hold exactly one
    // cluster with id zero.
    let wanted: Vec<ClusterInfo> = if iclaustron {
        let listed = get_cluster_list(&mut conn).await?;
        let selected: Vec<(String, ClusterId)> = if options.cluster_names.is_empty() {
            listed
        } else {
            let mut selected = Vec::new();
            for name in &options.cluster_names {
                let Some(entry) = listed.iter().find(|(n, _)| n == name) else {
                    return Err(IcError::NoSuchCluster { cluster_id: 0 });
                };
                selected.push(entry.clone());
            }
            selected
        };
        selected
            .into_iter()
            .map(|(cluster_name, cluster_id)| ClusterInfo {
                cluster_name,
                cluster_id,
                password: String::new(),
            })
            .collect()
    } else {
        vec![ClusterInfo::default()]
    };

    let mut grid = GridConfig::new();
    let mut node_ids = HashMap::new();
    for info in wanted {
        let cluster_id = info.cluster_id;
        if node_ids.contains_key(&cluster_id) {
            return Err(IcError::ConflictingClusterIds { cluster_id });
        }
        let assigned = get_nodeid(
            &mut conn,
            options,
            iclaustron.then_some(cluster_id),
        )
        .await?;
        let body = get_config_body(&mut conn, options).await?;
        let mut cluster = decode_config(&body, info, CodecSource::Wire)?;
        cluster.complete_link_defaults();
        grid.add_cluster(cluster)
            .map_err(|_| IcError::ConflictingClusterIds { cluster_id })?;
        node_ids.insert(cluster_id, assigned);
        tracing::info!(cluster_id, node_id = assigned, "cluster configuration fetched");
    }
    Ok(FetchedConfig { grid, node_ids })
}

/// The `get cluster list` exchange.
async fn get_cluster_list<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut LineConnection<S>,
) -> IcResult<Vec<(String, ClusterId)>> {
    conn.write_group(&[p::GET_CLUSTER_LIST]).await?;
    conn.expect_line(p::GET_CLUSTER_LIST_REPLY).await?;
    let mut clusters = Vec::new();
    loop {
        let line = conn.read_line().await?;
        if line == p::END_GET_CLUSTER_LIST {
            break;
        }
        let name = p::match_key(&line, p::CLUSTERNAME_KEY)
            .ok_or_else(|| IcError::protocol(line!()))?
            .to_string();
        let id = conn.read_key_number(p::CLUSTERID_KEY).await? as ClusterId;
        clusters.push((name, id));
    }
    conn.expect_empty().await?;
    Ok(clusters)
}

/// The `get nodeid` exchange for one cluster.
async fn get_nodeid<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut LineConnection<S>,
    options: &ConfigClientOptions,
    cluster_id: Option<ClusterId>,
) -> IcResult<NodeId> {
    let endian = if cfg!(target_endian = "big") {
        p::ENDIAN_BIG
    } else {
        p::ENDIAN_LITTLE
    };
    let nodeid_line = p::key_line(p::NODEID_KEY, options.requested_node_id);
    let version_line = p::key_line(p::VERSION_KEY, options.version);
    let nodetype_line = p::key_line(p::NODETYPE_KEY, options.node_type);
    let endian_line = p::key_line(p::ENDIAN_KEY, endian);
    let mut lines = vec![
        p::GET_NODEID,
        nodeid_line.as_str(),
        version_line.as_str(),
        nodetype_line.as_str(),
        p::USER_LINE,
        p::PASSWORD_LINE,
        p::PUBLIC_KEY_LINE,
        endian_line.as_str(),
        p::LOG_EVENT_LINE,
    ];
    let cluster_line = cluster_id.map(|id| p::key_line(p::CLUSTER_ID_KEY, id));
    if let Some(line) = cluster_line.as_deref() {
        lines.push(line);
    }
    conn.write_group(&lines).await?;

    conn.expect_line(p::GET_NODEID_REPLY).await?;
    let assigned = conn.read_key_number(p::NODEID_KEY).await? as NodeId;
    let result = conn.read_key_value(p::RESULT_KEY).await?;
    if result != p::RESULT_OK {
        tracing::warn!(result, "node id request refused");
        return Err(IcError::protocol(line!()));
    }
    conn.expect_empty().await?;
    Ok(assigned)
}

/// The `get config` exchange; returns the reassembled base64 body.
async fn get_config_body<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut LineConnection<S>,
    options: &ConfigClientOptions,
) -> IcResult<String> {
    let version_line = p::key_line(p::VERSION_KEY, options.version);
    let nodetype_line = p::key_line(p::NODETYPE_KEY, options.node_type);
    conn.write_group(&[p::GET_CONFIG, version_line.as_str(), nodetype_line.as_str()])
        .await?;

    conn.expect_line(p::GET_CONFIG_REPLY).await?;
    let result = conn.read_key_value(p::RESULT_KEY).await?;
    if result != p::RESULT_OK {
        return Err(IcError::protocol(line!()));
    }
    let content_length = conn.read_key_number(p::CONTENT_LENGTH_KEY).await? as usize;
    conn.expect_line(p::CONTENT_TYPE_LINE).await?;
    conn.expect_line(p::CONTENT_ENCODING_LINE).await?;
    conn.expect_empty().await?;

    let mut body = String::with_capacity(content_length);
    loop {
        let line = conn.read_line().await?;
        if line.is_empty() {
            break;
        }
        if line.len() > BASE64_LINE_LEN {
            return Err(IcError::protocol(line!()));
        }
        body.push_str(&line);
        if body.len() > content_length {
            return Err(IcError::protocol(line!()));
        }
    }
    if body.len() != content_length {
        return Err(IcError::protocol(line!()));
    }
    Ok(body)
}
