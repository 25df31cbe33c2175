//! Listen servers: one per unique local (host, port) pair serving as
//! the server side of some link.

use std::sync::Arc;

use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::protocol as p;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::send_node::SendNode;
use crate::proto::LineConnection;

/// A bound listening socket shared by every server-side send node whose
/// local endpoint is this (host, port) pair.
pub struct ListenServer {
    pub hostname: String,
    pub port: u16,
    /// Send nodes waiting for their peer to connect here.
    waiting: Mutex<Vec<Arc<SendNode>>>,
}

impl ListenServer {
    #[must_use]
    pub fn new(hostname: String, port: u16) -> Arc<ListenServer> {
        Arc::new(ListenServer {
            hostname,
            port,
            waiting: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, node: Arc<SendNode>) {
        self.waiting.lock().push(node);
    }

    fn find(&self, my_node_id: u32, peer_node_id: u32) -> Option<Arc<SendNode>> {
        self.waiting
            .lock()
            .iter()
            .find(|node| {
                node.my_node_id == my_node_id && node.other_node_id == peer_node_id
            })
            .cloned()
    }
}

/// Accept loop: authenticate each incoming transporter connection and
/// hand the socket to the matching send node.
pub(crate) async fn run_listen_server(
    server: Arc<ListenServer>,
    mut stop: watch::Receiver<bool>,
) {
    let bind_addr = (server.hostname.as_str(), server.port);
    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(host = %server.hostname, port = server.port, error = %err,
                "listen server failed to bind");
            return;
        }
    };
    tracing::info!(host = %server.hostname, port = server.port, "listen server started");

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
        match login_incoming(&server, stream).await {
            Ok((node, stream)) => {
                tracing::debug!(
                    peer = %peer_addr,
                    node_id = node.other_node_id,
                    "transporter connection accepted"
                );
                node.deliver_incoming(stream);
            }
            Err(err) => {
                tracing::info!(peer = %peer_addr, error = %err,
                    "incoming transporter login rejected");
            }
        }
    }
    tracing::debug!(host = %server.hostname, port = server.port, "listen server stopped");
}

/// Server side of the NDB transporter login, resolving which waiting
/// send node the peer belongs to.
async fn login_incoming(
    server: &Arc<ListenServer>,
    stream: TcpStream,
) -> IcResult<(Arc<SendNode>, TcpStream)> {
    let mut conn = LineConnection::new(stream);
    if conn.read_line().await? != p::NDBD_LINE {
        return Err(IcError::AuthenticateError);
    }
    if conn.read_line().await? != p::NDBD_PASSWD_LINE {
        return Err(IcError::AuthenticateError);
    }
    conn.write_lines(&[p::OK_LINE]).await?;

    // "<client_id> <server_id>": the peer names itself and us.
    let ids = conn.read_line().await?;
    let Some((client_part, server_part)) = ids.split_once(' ') else {
        return Err(IcError::AuthenticateError);
    };
    let client_id = p::parse_number(client_part).ok_or(IcError::AuthenticateError)? as u32;
    let server_id = p::parse_number(server_part).ok_or(IcError::AuthenticateError)? as u32;

    let node = server
        .find(server_id, client_id)
        .ok_or(IcError::AuthenticateError)?;
    conn.write_lines(&[p::TRANSPORTER_TYPE_LINE]).await?;
    Ok((node, conn.into_inner()?))
}
