//! Server driver: the per-connection protocol state machine.

use iclaustron_core::codec::keys::BASE64_LINE_LEN;
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::protocol as p;
use iclaustron_core::types::{is_iclaustron_version, ClusterId, NodeId};
use tokio::io::{AsyncRead, AsyncWrite};

use super::line::LineConnection;

/// Operations the protocol server needs from the cluster-server runtime.
pub trait CsService: Send + Sync {
    /// Names and ids of every cluster in the grid.
    fn cluster_list(&self) -> Vec<(String, ClusterId)>;

    /// Assigns a node id in a cluster; `requested` zero means any id of a
    /// compatible kind.
    fn assign_node_id(
        &self,
        cluster_id: ClusterId,
        node_type: u32,
        requested: NodeId,
    ) -> IcResult<NodeId>;

    /// The base64 body of one cluster's configuration, encoded for a
    /// peer at `version`.
    fn encoded_config(&self, cluster_id: ClusterId, version: u32) -> IcResult<String>;

    /// This cluster server's own node id.
    fn own_node_id(&self) -> NodeId;

    /// Records a (possibly dynamic) connection parameter; returns the
    /// reply message text.
    fn set_connection_parameter(
        &self,
        cluster_id: ClusterId,
        node1: NodeId,
        node2: NodeId,
        param: u32,
        value: i64,
    ) -> IcResult<String>;

    /// Reads a connection parameter back.
    fn get_connection_parameter(
        &self,
        cluster_id: ClusterId,
        node1: NodeId,
        node2: NodeId,
        param: u32,
    ) -> IcResult<i64>;

    /// Accepts an event report.
    fn report_event(&self, data: &[u32]);
}

/// How a protocol conversation ended.
pub enum ServeOutcome<S> {
    /// The peer finished (or erred) and the connection is done.
    Closed,
    /// The peer converted the socket into a message transport; the
    /// stream is surrendered together with the negotiated identifiers.
    Transporter {
        stream: S,
        peer_node_id: NodeId,
        transporter_type: u32,
        cluster_id: ClusterId,
    },
}

/// Protocol states. `get nodeid` may repeat (an iClaustron client fetches
/// several clusters); `get mgmd nodeid` is legal only after at least one
/// node-id exchange; parameter exchanges and the transporter conversion
/// come last. Anything out of order closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Initial,
    WaitGetNodeid,
    WaitGetMgmdNodeid,
    WaitSetConnection,
}

/// Runs the protocol state machine over one accepted connection.
pub async fn serve_connection<S, C>(
    mut conn: LineConnection<S>,
    service: &C,
) -> IcResult<ServeOutcome<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let mut state = ConnState::Initial;
    let mut current_cluster: ClusterId = 0;

    loop {
        let Some(first) = conn.read_line_or_eof().await? else {
            return Ok(ServeOutcome::Closed);
        };

        match (state, first.as_str()) {
            (
                ConnState::Initial | ConnState::WaitGetNodeid | ConnState::WaitGetMgmdNodeid,
                p::GET_NODEID,
            ) => {
                current_cluster = handle_get_nodeid(&mut conn, service).await?;
                state = ConnState::WaitGetNodeid;
            }
            (
                ConnState::Initial | ConnState::WaitGetNodeid | ConnState::WaitGetMgmdNodeid,
                p::GET_CLUSTER_LIST,
            ) => {
                conn.expect_empty().await?;
                handle_cluster_list(&mut conn, service).await?;
            }
            (
                ConnState::WaitGetNodeid | ConnState::WaitGetMgmdNodeid,
                p::GET_CONFIG,
            ) => {
                handle_get_config(&mut conn, service, current_cluster).await?;
                state = ConnState::WaitGetMgmdNodeid;
            }
            (
                ConnState::WaitGetNodeid | ConnState::WaitGetMgmdNodeid,
                p::GET_MGMD_NODEID,
            ) => {
                conn.expect_empty().await?;
                let nodeid_line = p::key_line(p::NODEID_KEY, service.own_node_id());
                conn.write_group(&[p::GET_MGMD_NODEID_REPLY, nodeid_line.as_str()])
                    .await?;
                state = ConnState::WaitSetConnection;
            }
            (ConnState::WaitSetConnection, p::SET_CONNECTION_PARAMETER) => {
                handle_set_connection_parameter(&mut conn, service).await?;
            }
            (ConnState::WaitSetConnection, p::GET_CONNECTION_PARAMETER) => {
                handle_get_connection_parameter(&mut conn, service).await?;
            }
            (ConnState::Initial, p::REPORT_EVENT) => {
                handle_report_event(&mut conn, service).await?;
                return Ok(ServeOutcome::Closed);
            }
            (ConnState::WaitSetConnection, line) => {
                // Transporter conversion: `<peer_id> <type>`.
                let Some((peer_id, transporter_type)) = parse_two_numbers(line) else {
                    return Err(IcError::protocol(line!()));
                };
                let reply = format!("{} {}", service.own_node_id(), transporter_type);
                conn.write_lines(&[reply.as_str()]).await?;
                let stream = conn.into_inner()?;
                return Ok(ServeOutcome::Transporter {
                    stream,
                    peer_node_id: peer_id,
                    transporter_type,
                    cluster_id: current_cluster,
                });
            }
            (_, line) => {
                tracing::debug!(?state, line, "out-of-order protocol action");
                return Err(IcError::protocol(line!()));
            }
        }
    }
}

fn parse_two_numbers(line: &str) -> Option<(u32, u32)> {
    let (a, b) = line.split_once(' ')?;
    Some((
        p::parse_number(a)? as u32,
        p::parse_number(b)? as u32,
    ))
}

async fn handle_get_nodeid<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
) -> IcResult<ClusterId>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let requested = conn.read_key_number(p::NODEID_KEY).await? as NodeId;
    let version = conn.read_key_number(p::VERSION_KEY).await? as u32;
    let node_type = conn.read_key_number(p::NODETYPE_KEY).await? as u32;
    conn.expect_line(p::USER_LINE).await?;
    conn.expect_line(p::PASSWORD_LINE).await?;
    conn.expect_line(p::PUBLIC_KEY_LINE).await?;
    let endian = conn.read_key_value(p::ENDIAN_KEY).await?;
    if endian != p::ENDIAN_LITTLE && endian != p::ENDIAN_BIG {
        return Err(IcError::protocol(line!()));
    }
    conn.expect_line(p::LOG_EVENT_LINE).await?;

    // The cluster id line is present exactly when the peer speaks the
    // iClaustron extensions.
    let cluster_id = if is_iclaustron_version(version) {
        let id = conn.read_key_number(p::CLUSTER_ID_KEY).await? as ClusterId;
        conn.expect_empty().await?;
        id
    } else {
        conn.expect_empty().await?;
        0
    };

    match service.assign_node_id(cluster_id, node_type, requested) {
        Ok(assigned) => {
            let nodeid_line = p::key_line(p::NODEID_KEY, assigned);
            let result_line = p::key_line(p::RESULT_KEY, p::RESULT_OK);
            conn.write_group(&[
                p::GET_NODEID_REPLY,
                nodeid_line.as_str(),
                result_line.as_str(),
            ])
            .await?;
            Ok(cluster_id)
        }
        Err(err) => {
            tracing::warn!(cluster_id, node_type, error = %err, "node id refused");
            let error_line = p::error_result_line(&err.to_string());
            conn.write_group(&[p::GET_NODEID_REPLY, error_line.as_str()])
                .await?;
            Ok(cluster_id)
        }
    }
}

async fn handle_cluster_list<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
) -> IcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let mut lines: Vec<String> = vec![p::GET_CLUSTER_LIST_REPLY.to_string()];
    for (name, id) in service.cluster_list() {
        lines.push(p::key_line(p::CLUSTERNAME_KEY, name));
        lines.push(p::key_line(p::CLUSTERID_KEY, id));
    }
    lines.push(p::END_GET_CLUSTER_LIST.to_string());
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    conn.write_group(&refs).await
}

async fn handle_get_config<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
    cluster_id: ClusterId,
) -> IcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let version = conn.read_key_number(p::VERSION_KEY).await? as u32;
    let _node_type = conn.read_key_number(p::NODETYPE_KEY).await? as u32;
    conn.expect_empty().await?;

    let body = match service.encoded_config(cluster_id, version) {
        Ok(body) => body,
        Err(err) => {
            let error_line = p::error_result_line(&err.to_string());
            conn.write_group(&[p::GET_CONFIG_REPLY, error_line.as_str()])
                .await?;
            return Ok(());
        }
    };

    let result_line = p::key_line(p::RESULT_KEY, p::RESULT_OK);
    let length_line = p::key_line(p::CONTENT_LENGTH_KEY, body.len());
    let mut lines: Vec<&str> = vec![
        p::GET_CONFIG_REPLY,
        result_line.as_str(),
        length_line.as_str(),
        p::CONTENT_TYPE_LINE,
        p::CONTENT_ENCODING_LINE,
        "",
    ];
    for chunk in body.as_bytes().chunks(BASE64_LINE_LEN) {
        // Base64 output is ASCII, so every chunk is valid UTF-8.
        lines.push(std::str::from_utf8(chunk).map_err(|_| IcError::protocol(line!()))?);
    }
    lines.push("");
    conn.write_lines(&lines).await
}

/// Reads the body of a connection-parameter request: optional cluster id
/// line, node1, node2, param.
async fn read_connection_parameter_head<S>(
    conn: &mut LineConnection<S>,
) -> IcResult<(ClusterId, NodeId, NodeId, u32)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = conn.read_line().await?;
    let (cluster_id, node1) = if let Some(value) = p::match_key(&first, p::CLUSTER_ID_KEY) {
        let cluster_id =
            p::parse_number(value).ok_or_else(|| IcError::protocol(line!()))? as ClusterId;
        (cluster_id, conn.read_key_number(p::NODE1_KEY).await? as NodeId)
    } else {
        let node1 = p::match_key(&first, p::NODE1_KEY)
            .and_then(p::parse_number)
            .ok_or_else(|| IcError::protocol(line!()))? as NodeId;
        (0, node1)
    };
    let node2 = conn.read_key_number(p::NODE2_KEY).await? as NodeId;
    let param = conn.read_key_number(p::PARAM_KEY).await? as u32;
    Ok((cluster_id, node1, node2, param))
}

async fn handle_set_connection_parameter<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
) -> IcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let (cluster_id, node1, node2, param) = read_connection_parameter_head(conn).await?;
    let value_text = conn.read_key_value(p::VALUE_KEY).await?;
    let value =
        p::parse_signed(&value_text).ok_or_else(|| IcError::protocol(line!()))?;
    conn.expect_empty().await?;

    match service.set_connection_parameter(cluster_id, node1, node2, param, value) {
        Ok(message) => {
            let message_line = p::key_line(p::MESSAGE_KEY, message);
            let result_line = p::key_line(p::RESULT_KEY, p::RESULT_OK);
            conn.write_group(&[
                p::SET_CONNECTION_PARAMETER_REPLY,
                message_line.as_str(),
                result_line.as_str(),
            ])
            .await
        }
        Err(err) => {
            let message_line = p::key_line(p::MESSAGE_KEY, err.to_string());
            let error_line = p::error_result_line(&err.to_string());
            conn.write_group(&[
                p::SET_CONNECTION_PARAMETER_REPLY,
                message_line.as_str(),
                error_line.as_str(),
            ])
            .await
        }
    }
}

async fn handle_get_connection_parameter<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
) -> IcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let (cluster_id, node1, node2, param) = read_connection_parameter_head(conn).await?;
    conn.expect_empty().await?;

    match service.get_connection_parameter(cluster_id, node1, node2, param) {
        Ok(value) => {
            let value_line = p::key_line(p::VALUE_KEY, value);
            let result_line = p::key_line(p::RESULT_KEY, p::RESULT_OK);
            conn.write_group(&[
                p::GET_CONNECTION_PARAMETER_REPLY,
                value_line.as_str(),
                result_line.as_str(),
            ])
            .await
        }
        Err(err) => {
            let error_line = p::error_result_line(&err.to_string());
            conn.write_group(&[p::GET_CONNECTION_PARAMETER_REPLY, error_line.as_str()])
                .await
        }
    }
}

async fn handle_report_event<S, C>(
    conn: &mut LineConnection<S>,
    service: &C,
) -> IcResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: CsService + ?Sized,
{
    let length = conn.read_key_number(p::LENGTH_KEY).await? as usize;
    let data_text = conn.read_key_value(p::DATA_KEY).await?;
    let words: Vec<u32> = data_text
        .split(' ')
        .filter(|part| !part.is_empty())
        .map(|part| {
            p::parse_number(part)
                .map(|n| n as u32)
                .ok_or_else(|| IcError::protocol(line!()))
        })
        .collect::<IcResult<_>>()?;
    if words.len() != length {
        return Err(IcError::protocol(line!()));
    }
    conn.expect_empty().await?;

    service.report_event(&words);
    let result_line = p::key_line(p::RESULT_KEY, p::RESULT_OK);
    conn.write_group(&[p::REPORT_EVENT_REPLY, result_line.as_str()])
        .await
}
