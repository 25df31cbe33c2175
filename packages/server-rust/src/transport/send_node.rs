//! Per-peer send nodes: connection lifecycle, send queue, send worker.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;
use std::time::{Duration, Instant};

use iclaustron_core::config::SocketLinkConfig;
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::protocol as p;
use iclaustron_core::types::{ClusterId, NodeId};
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;

use super::adaptive::AdaptiveSendState;
use super::pool::PagePool;
use super::{page_word, set_page_word};
use crate::proto::LineConnection;

/// Most pages one vectored write covers.
pub const MAX_SEND_BUFFERS: usize = 16;

/// Most bytes one vectored write covers.
pub const MAX_SEND_SIZE: usize = 64 * 1024;

/// Base back-off between reconnect attempts.
const CONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Lifecycle of a per-peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendNodeState {
    Init,
    Connecting,
    LoggedIn,
    NodeUp,
    NodeDown,
}

pub(crate) struct SendNodeInner {
    pub state: SendNodeState,
    pub queue: VecDeque<Vec<u8>>,
    pub queued_bytes: usize,
    /// Someone is currently performing a send.
    pub send_active: bool,
    /// The send worker has been asked to drain the queue.
    pub send_thread_active: bool,
    pub message_id: u32,
    pub adaptive: AdaptiveSendState,
    pub stop_ordered: bool,
    /// Connection delivered by the listen server for server-side links.
    pub pending_incoming: Option<TcpStream>,
    /// Start state the peer advertised in its last registration confirm.
    pub peer_start_state: u32,
}

/// One half of a per-peer connection: everything the send path needs.
pub struct SendNode {
    pub cluster_id: ClusterId,
    pub my_node_id: NodeId,
    pub other_node_id: NodeId,
    pub link: SocketLinkConfig,
    pub my_hostname: String,
    pub my_port: u16,
    pub peer_hostname: String,
    pub peer_port: u16,
    /// True when this end accepts the connection.
    pub is_server_side: bool,
    pub(crate) inner: Mutex<SendNodeInner>,
    /// Wakes the send worker: buffers queued, connection delivered, stop.
    pub(crate) send_wake: Notify,
    /// Wakes a server-side worker waiting for an accepted connection.
    pub(crate) conn_wake: Notify,
    pub(crate) writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pool: Arc<PagePool>,
}

impl SendNode {
    pub(crate) fn new(
        cluster_id: ClusterId,
        my_node_id: NodeId,
        other_node_id: NodeId,
        link: SocketLinkConfig,
        pool: Arc<PagePool>,
    ) -> Arc<SendNode> {
        let is_server_side = link.server_node_id == my_node_id;
        let my_hostname = link.hostname_of(my_node_id).to_string();
        let peer_hostname = link.hostname_of(other_node_id).to_string();
        let port = link.server_port_number as u16;
        let (my_port, peer_port) = if is_server_side { (port, 0) } else { (0, port) };
        let max_wait = Duration::from_nanos(u64::from(link.max_wait_in_nanos));
        Arc::new(SendNode {
            cluster_id,
            my_node_id,
            other_node_id,
            link,
            my_hostname,
            my_port,
            peer_hostname,
            peer_port,
            is_server_side,
            inner: Mutex::new(SendNodeInner {
                state: SendNodeState::Init,
                queue: VecDeque::new(),
                queued_bytes: 0,
                send_active: false,
                send_thread_active: false,
                message_id: 1,
                adaptive: AdaptiveSendState::new(max_wait, Instant::now()),
                stop_ordered: false,
                pending_incoming: None,
                peer_start_state: 0,
            }),
            send_wake: Notify::new(),
            conn_wake: Notify::new(),
            writer: tokio::sync::Mutex::new(None),
            pool,
        })
    }

    #[must_use]
    pub fn state(&self) -> SendNodeState {
        self.inner.lock().state
    }

    /// Submits framed pages toward the peer.
    ///
    /// Pages land on the send queue atomically; when no other sender is
    /// active and the adaptive algorithm denies further buffering, this
    /// call performs the vectored write itself.
    pub async fn send_messages(
        self: &Arc<Self>,
        pages: Vec<Vec<u8>>,
        force_send: bool,
    ) -> IcResult<()> {
        let batch = {
            let mut inner = self.inner.lock();
            if inner.state != SendNodeState::NodeUp {
                drop(inner);
                self.pool.return_pages(pages);
                return Err(IcError::NodeDown {
                    cluster_id: self.cluster_id,
                    node_id: self.other_node_id,
                });
            }
            let mut pages = pages;
            if self.link.use_message_id {
                for page in &mut pages {
                    stamp_page_message_ids(page, &mut inner.message_id);
                }
            }
            for page in pages {
                inner.queued_bytes += page.len();
                inner.queue.push_back(page);
            }
            if inner.send_active {
                // Step 9 of the active sender picks our pages up.
                return Ok(());
            }
            let now = Instant::now();
            if !force_send && inner.adaptive.decision(now) {
                // Buffered; the receive worker's maintenance pass flushes
                // us if no later sender shows up.
                return Ok(());
            }
            inner.send_active = true;
            inner.adaptive.statistics(now);
            detach_batch(&mut inner)
        };

        let result = self.write_batch(&batch).await;
        self.pool.return_pages(batch);

        match result {
            Ok(()) => {
                let wake = {
                    let mut inner = self.inner.lock();
                    if inner.queue.is_empty() {
                        inner.send_active = false;
                        false
                    } else {
                        inner.send_thread_active = true;
                        true
                    }
                };
                if wake {
                    self.send_wake.notify_one();
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    cluster_id = self.cluster_id,
                    node_id = self.other_node_id,
                    error = %err,
                    "send failed, taking node down"
                );
                self.take_down().await;
                Err(IcError::NodeDown {
                    cluster_id: self.cluster_id,
                    node_id: self.other_node_id,
                })
            }
        }
    }

    /// One vectored write covering the whole batch, restarted on partial
    /// writes.
    async fn write_batch(&self, batch: &[Vec<u8>]) -> IcResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut writer_slot = self.writer.lock().await;
        let writer = writer_slot.as_mut().ok_or(IcError::NodeDown {
            cluster_id: self.cluster_id,
            node_id: self.other_node_id,
        })?;

        let mut page_index = 0usize;
        let mut offset = 0usize;
        while page_index < batch.len() {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() - page_index);
            slices.push(IoSlice::new(&batch[page_index][offset..]));
            for page in &batch[page_index + 1..] {
                slices.push(IoSlice::new(page));
            }
            let mut written = writer.write_vectored(&slices).await?;
            if written == 0 {
                return Err(IcError::NodeDown {
                    cluster_id: self.cluster_id,
                    node_id: self.other_node_id,
                });
            }
            while page_index < batch.len() {
                let remaining = batch[page_index].len() - offset;
                if written >= remaining {
                    written -= remaining;
                    page_index += 1;
                    offset = 0;
                } else {
                    offset += written;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Local part of node-failure handling: state, queue, writer.
    /// Heartbeat and receive-side detachment are the runtime's job.
    pub(crate) async fn take_down(&self) {
        let pages: Vec<Vec<u8>> = {
            let mut inner = self.inner.lock();
            if inner.state == SendNodeState::NodeDown {
                return;
            }
            inner.state = SendNodeState::NodeDown;
            inner.send_active = false;
            inner.send_thread_active = false;
            inner.queued_bytes = 0;
            inner.queue.drain(..).collect()
        };
        self.pool.return_pages(pages);
        *self.writer.lock().await = None;
        self.send_wake.notify_one();
        self.conn_wake.notify_one();
    }

    /// Hands a freshly accepted, authenticated connection to the send
    /// worker of a server-side link.
    pub(crate) fn deliver_incoming(&self, stream: TcpStream) {
        self.inner.lock().pending_incoming = Some(stream);
        self.conn_wake.notify_one();
    }

    pub(crate) fn order_stop(&self) {
        self.inner.lock().stop_ordered = true;
        self.send_wake.notify_one();
        self.conn_wake.notify_one();
    }

    fn stop_ordered(&self) -> bool {
        self.inner.lock().stop_ordered
    }

    /// Drains the queue from the send worker after a wake-up.
    pub(crate) async fn drain_from_worker(self: &Arc<Self>) {
        loop {
            let batch = {
                let mut inner = self.inner.lock();
                if inner.queue.is_empty() || inner.state != SendNodeState::NodeUp {
                    inner.send_active = false;
                    inner.send_thread_active = false;
                    return;
                }
                inner.send_active = true;
                inner.adaptive.statistics(Instant::now());
                detach_batch(&mut inner)
            };
            let result = self.write_batch(&batch).await;
            self.pool.return_pages(batch);
            if result.is_err() {
                self.take_down().await;
                return;
            }
        }
    }

    /// Client side of the NDB transporter login.
    async fn connect_and_login(&self) -> IcResult<TcpStream> {
        let stream =
            TcpStream::connect((self.peer_hostname.as_str(), self.peer_port)).await?;
        let mut conn = LineConnection::new(stream);
        conn.write_lines(&[p::NDBD_LINE, p::NDBD_PASSWD_LINE]).await?;
        if conn.read_line().await? != p::OK_LINE {
            return Err(IcError::AuthenticateError);
        }
        let ids = format!("{} {}", self.my_node_id, self.other_node_id);
        conn.write_lines(&[ids.as_str()]).await?;
        if conn.read_line().await? != p::TRANSPORTER_TYPE_LINE {
            return Err(IcError::AuthenticateError);
        }
        conn.into_inner()
    }
}

fn detach_batch(inner: &mut SendNodeInner) -> Vec<Vec<u8>> {
    let mut batch = Vec::new();
    let mut bytes = 0usize;
    while batch.len() < MAX_SEND_BUFFERS && bytes < MAX_SEND_SIZE {
        let Some(page) = inner.queue.pop_front() else {
            break;
        };
        bytes += page.len();
        inner.queued_bytes -= page.len();
        batch.push(page);
    }
    batch
}

/// Stamps increasing message ids into every message of a framed page,
/// fixing up the trailing checksum word where negotiated.
pub(crate) fn stamp_page_message_ids(page: &mut [u8], next_id: &mut u32) {
    let total_words = page.len() / 4;
    let mut pos = 0usize;
    while pos < total_words {
        let word0 = page_word(page, pos);
        let size = ((word0 >> 8) & 0xFFFF) as usize;
        debug_assert!(size >= 3 && pos + size <= total_words);
        if size < 3 || pos + size > total_words {
            return;
        }
        if word0 & (1 << 2) == 0 {
            // No message-id word negotiated into this message.
            pos += size;
            continue;
        }
        let old = page_word(page, pos + 3);
        set_page_word(page, pos + 3, *next_id);
        if word0 & (1 << 4) != 0 {
            let checksum_index = pos + size - 1;
            let checksum = page_word(page, checksum_index);
            set_page_word(page, checksum_index, checksum ^ old ^ *next_id);
        }
        *next_id = next_id.wrapping_add(1);
        pos += size;
    }
}

/// The per-node send worker: establishes the connection for its side of
/// the link, then sleeps on its wake condition and drains the queue.
pub(crate) async fn run_send_worker(
    node: Arc<SendNode>,
    global: Arc<super::apid::ApidGlobal>,
) {
    tracing::debug!(
        cluster_id = node.cluster_id,
        node_id = node.other_node_id,
        server_side = node.is_server_side,
        "send worker started"
    );
    loop {
        if node.stop_ordered() {
            break;
        }
        let state = node.state();
        match state {
            SendNodeState::Init | SendNodeState::NodeDown => {
                if state == SendNodeState::NodeDown {
                    let jitter = rand::rng().random_range(0..500);
                    tokio::time::sleep(CONNECT_BACKOFF + Duration::from_millis(jitter)).await;
                    if node.stop_ordered() {
                        break;
                    }
                }
                node.inner.lock().state = SendNodeState::Connecting;
                let stream = if node.is_server_side {
                    match wait_for_incoming(&node).await {
                        Some(stream) => stream,
                        None => continue,
                    }
                } else {
                    match node.connect_and_login().await {
                        Ok(stream) => stream,
                        Err(err) => {
                            tracing::debug!(
                                cluster_id = node.cluster_id,
                                node_id = node.other_node_id,
                                error = %err,
                                "connect attempt failed"
                            );
                            node.inner.lock().state = SendNodeState::NodeDown;
                            continue;
                        }
                    }
                };
                if let Err(err) = global.finish_connect(&node, stream).await {
                    tracing::warn!(error = %err, "connection hand-off failed");
                    node.inner.lock().state = SendNodeState::NodeDown;
                }
            }
            SendNodeState::NodeUp | SendNodeState::LoggedIn => {
                node.send_wake.notified().await;
                if node.stop_ordered() {
                    break;
                }
                let should_drain = {
                    let inner = node.inner.lock();
                    inner.send_thread_active || !inner.queue.is_empty()
                };
                if should_drain {
                    node.drain_from_worker().await;
                }
            }
            SendNodeState::Connecting => {
                // Another path is mid-transition; yield briefly.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    tracing::debug!(
        cluster_id = node.cluster_id,
        node_id = node.other_node_id,
        "send worker stopped"
    );
}

/// Waits for the listen server to deliver an accepted connection, or for
/// stop. Returns `None` when no connection arrived (stop or spurious).
async fn wait_for_incoming(node: &Arc<SendNode>) -> Option<TcpStream> {
    loop {
        if let Some(stream) = node.inner.lock().pending_incoming.take() {
            return Some(stream);
        }
        if node.stop_ordered() {
            return None;
        }
        node.conn_wake.notified().await;
        if node.stop_ordered() {
            return None;
        }
    }
}
