//! Receive workers: socket draining, in-place message extraction, and
//! fanout into per-application-thread queues.

use std::sync::Arc;
use std::time::{Duration, Instant};

use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::frame;
use iclaustron_core::types::{ClusterId, NodeId};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use super::apid::ApidGlobal;
use super::pool::RecvPage;
use super::send_node::SendNode;

/// Buckets the fanout hashes receiver module ids into.
pub const NUM_THREAD_LISTS: usize = 16;

/// Cadence of the adaptive-send maintenance pass.
const ADAPTIVE_TICK: Duration = Duration::from_millis(10);

/// Shortest possible message, in bytes.
const MIN_MESSAGE_BYTES: usize = frame::MESSAGE_HEADER_WORDS * 4;

/// One complete message, pointing into a shared receive page.
#[derive(Debug)]
pub struct MessageDesc {
    pub page: Arc<RecvPage>,
    pub offset_words: usize,
    pub len_words: usize,
    pub cluster_id: ClusterId,
    pub sender_node_id: NodeId,
    pub receiver_node_id: NodeId,
    pub receiver_module_id: u32,
    /// Set on the last descriptor of a page's delivered batch: how many
    /// page references that application thread releases at once.
    pub ref_count_releases: i32,
}

impl MessageDesc {
    /// Copies the message words out of the page.
    #[must_use]
    pub fn words(&self) -> Vec<u32> {
        super::page_words(self.page.bytes(), self.offset_words, self.len_words)
    }
}

/// Admin commands other workers queue toward a receive worker.
pub enum ReceiveCmd {
    Add {
        node: Arc<SendNode>,
        reader: OwnedReadHalf,
    },
    Remove {
        cluster_id: ClusterId,
        node_id: NodeId,
    },
    Stop,
}

/// Per-connection receive state.
struct AttachedNode {
    node: Arc<SendNode>,
    reader: OwnedReadHalf,
    /// Current partially-filled receive page.
    page: Vec<u8>,
}

enum Epoch {
    Admin(Option<ReceiveCmd>),
    Readable(usize),
    Tick,
}

/// The receive worker main loop.
pub(crate) async fn run_receive_worker(
    global: Arc<ApidGlobal>,
    mut admin: mpsc::UnboundedReceiver<ReceiveCmd>,
) {
    let mut nodes: Vec<AttachedNode> = Vec::new();
    tracing::debug!("receive worker started");

    loop {
        let event = {
            let readable = wait_any_readable(&nodes);
            tokio::select! {
                cmd = admin.recv() => Epoch::Admin(cmd),
                index = readable, if !nodes.is_empty() => Epoch::Readable(index),
                () = tokio::time::sleep(ADAPTIVE_TICK), if !nodes.is_empty() => Epoch::Tick,
            }
        };

        match event {
            Epoch::Admin(None | Some(ReceiveCmd::Stop)) => break,
            Epoch::Admin(Some(ReceiveCmd::Add { node, reader })) => {
                let Ok(page) = global.recv_pool.get_page() else {
                    tracing::error!("no receive page for new connection");
                    global.handle_node_failure(&node).await;
                    continue;
                };
                tracing::debug!(
                    cluster_id = node.cluster_id,
                    node_id = node.other_node_id,
                    "connection attached to receive worker"
                );
                nodes.push(AttachedNode { node, reader, page });
            }
            Epoch::Admin(Some(ReceiveCmd::Remove { cluster_id, node_id })) => {
                nodes.retain(|attached| {
                    !(attached.node.cluster_id == cluster_id
                        && attached.node.other_node_id == node_id)
                });
            }
            Epoch::Readable(index) => {
                if let Err(err) = drain_readable(&global, &mut nodes[index]).await {
                    let node = Arc::clone(&nodes[index].node);
                    tracing::info!(
                        cluster_id = node.cluster_id,
                        node_id = node.other_node_id,
                        error = %err,
                        "receive side lost connection"
                    );
                    nodes.swap_remove(index);
                    global.handle_node_failure(&node).await;
                }
            }
            Epoch::Tick => {
                // Flush buffers an adaptive wait left behind when no
                // later sender arrived.
                for attached in &nodes {
                    let wake = {
                        let mut inner = attached.node.inner.lock();
                        inner.adaptive.adjust(Instant::now());
                        !inner.queue.is_empty() && !inner.send_active
                    };
                    if wake {
                        attached.node.inner.lock().send_thread_active = true;
                        attached.node.send_wake.notify_one();
                    }
                }
            }
        }
    }
    tracing::debug!("receive worker stopped");
}

/// Resolves to the index of a connection with readable data.
async fn wait_any_readable(nodes: &[AttachedNode]) -> usize {
    if nodes.is_empty() {
        return std::future::pending().await;
    }
    let futures: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(index, attached)| {
            Box::pin(async move {
                // Readiness errors surface from the try_read that follows.
                let _ = attached.reader.readable().await;
                index
            })
        })
        .collect();
    futures_util::future::select_all(futures).await.0
}

/// Reads what the socket has, extracts complete messages, and posts them
/// to the application threads.
async fn drain_readable(global: &Arc<ApidGlobal>, attached: &mut AttachedNode) -> IcResult<()> {
    let page_size = global.recv_pool.page_size();
    loop {
        if attached.page.len() == page_size {
            return Err(IcError::InconsistentData {
                detail: "message larger than a receive page",
            });
        }
        let filled = attached.page.len();
        attached.page.resize(page_size, 0);
        let read = match attached.reader.try_read(&mut attached.page[filled..]) {
            Ok(0) => {
                attached.page.truncate(filled);
                return Err(IcError::NodeDown {
                    cluster_id: attached.node.cluster_id,
                    node_id: attached.node.other_node_id,
                });
            }
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                attached.page.truncate(filled);
                return Ok(());
            }
            Err(err) => {
                attached.page.truncate(filled);
                return Err(err.into());
            }
        };
        attached.page.truncate(filled + read);
        extract_and_post(global, attached)?;
    }
}

/// Splits the filled part of the page into complete messages, carries
/// the partial tail into a fresh page, and posts the descriptors.
fn extract_and_post(global: &Arc<ApidGlobal>, attached: &mut AttachedNode) -> IcResult<()> {
    struct Extracted {
        offset_words: usize,
        len_words: usize,
        receiver_module_id: u32,
    }

    let mut extracted: Vec<Extracted> = Vec::new();
    let mut consumed = 0usize;
    loop {
        let available = attached.page.len() - consumed;
        if available < MIN_MESSAGE_BYTES {
            break;
        }
        let header = super::page_words(&attached.page, consumed / 4, frame::MESSAGE_HEADER_WORDS);
        let (total_words, receiver_module_id) = frame::read_message_early(&header)?;
        let total_bytes = total_words * 4;
        if total_bytes > global.recv_pool.page_size() {
            return Err(IcError::InconsistentData {
                detail: "message larger than a receive page",
            });
        }
        if available < total_bytes {
            break;
        }
        extracted.push(Extracted {
            offset_words: consumed / 4,
            len_words: total_words,
            receiver_module_id,
        });
        consumed += total_bytes;
    }

    if extracted.is_empty() {
        return Ok(());
    }

    // Freeze the page, carry the tail into a fresh one.
    let mut fresh = global.recv_pool.get_page()?;
    fresh.extend_from_slice(&attached.page[consumed..]);
    let full = std::mem::replace(&mut attached.page, fresh);
    let page = RecvPage::new(full, extracted.len() as i32, Arc::clone(&global.recv_pool));

    // Anchor lists hashed by receiver module id, then posted per thread.
    let mut anchors: Vec<Vec<MessageDesc>> = (0..NUM_THREAD_LISTS).map(|_| Vec::new()).collect();
    for item in extracted {
        let bucket = item.receiver_module_id as usize % NUM_THREAD_LISTS;
        anchors[bucket].push(MessageDesc {
            page: Arc::clone(&page),
            offset_words: item.offset_words,
            len_words: item.len_words,
            cluster_id: attached.node.cluster_id,
            sender_node_id: attached.node.other_node_id,
            receiver_node_id: attached.node.my_node_id,
            receiver_module_id: item.receiver_module_id,
            ref_count_releases: 0,
        });
    }
    drop(page);

    post_messages(global, anchors);
    Ok(())
}

/// Posts anchor lists into the owning application threads' input queues,
/// stamping the batch release count on each run's last descriptor.
fn post_messages(global: &Arc<ApidGlobal>, anchors: Vec<Vec<MessageDesc>>) {
    for bucket in anchors {
        if bucket.is_empty() {
            continue;
        }
        // A bucket may mix several threads; deliver per thread in order.
        let mut per_thread: Vec<(u32, Vec<MessageDesc>)> = Vec::new();
        for desc in bucket {
            match per_thread.iter_mut().find(|(id, _)| *id == desc.receiver_module_id) {
                Some((_, list)) => list.push(desc),
                None => per_thread.push((desc.receiver_module_id, vec![desc])),
            }
        }
        for (thread_id, mut batch) in per_thread {
            // The last descriptor from each page carries the number of
            // references its consumer releases for that page.
            let mut index = batch.len();
            while index > 0 {
                index -= 1;
                let page_ptr = Arc::as_ptr(&batch[index].page);
                let run = batch[..=index]
                    .iter()
                    .rev()
                    .take_while(|d| Arc::as_ptr(&d.page) == page_ptr)
                    .count();
                batch[index].ref_count_releases = run as i32;
                index = index.saturating_sub(run - 1);
            }
            global.deliver_to_thread(thread_id, batch);
        }
    }
}
