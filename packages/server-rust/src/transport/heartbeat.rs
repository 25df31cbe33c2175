//! The heartbeat worker.
//!
//! Walks the attached send nodes roughly every three seconds, framing an
//! `API_REGREQ` registration request toward each; a failed send triggers
//! node-failure handling for that peer.

use std::sync::Arc;
use std::time::Duration;

use iclaustron_core::frame::{
    frame_message, ic_reference, MessageHeader, API_REGREQ, QMGR_MODULE,
};
use iclaustron_core::types::{MYSQL_VERSION, NDB_VERSION};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use super::apid::ApidGlobal;
use super::send_node::SendNode;

/// Interval between heartbeat rounds.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(3000);

/// The walked list of send nodes receiving heartbeats.
pub struct HeartbeatList {
    inner: Mutex<HeartbeatInner>,
    /// Signalled when the first node attaches to an empty list.
    pub(crate) wake: Notify,
}

struct HeartbeatInner {
    nodes: Vec<Arc<SendNode>>,
    /// Walk position, kept stable across removals.
    next: usize,
}

impl Default for HeartbeatList {
    fn default() -> Self {
        HeartbeatList {
            inner: Mutex::new(HeartbeatInner {
                nodes: Vec::new(),
                next: 0,
            }),
            wake: Notify::new(),
        }
    }
}

impl HeartbeatList {
    pub fn add(&self, node: Arc<SendNode>) {
        let was_empty = {
            let mut inner = self.inner.lock();
            let was_empty = inner.nodes.is_empty();
            inner.nodes.push(node);
            was_empty
        };
        if was_empty {
            self.wake.notify_one();
        }
    }

    /// Removes a node, moving the walk pointer past it when it was next.
    pub fn remove(&self, node: &Arc<SendNode>) {
        let mut inner = self.inner.lock();
        if let Some(position) = inner
            .nodes
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, node))
        {
            inner.nodes.remove(position);
            if inner.next > position {
                inner.next -= 1;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next node in the circular walk.
    fn next_node(&self) -> Option<Arc<SendNode>> {
        let mut inner = self.inner.lock();
        if inner.nodes.is_empty() {
            return None;
        }
        if inner.next >= inner.nodes.len() {
            inner.next = 0;
        }
        let node = Arc::clone(&inner.nodes[inner.next]);
        inner.next += 1;
        Some(node)
    }

    /// Snapshot of every attached node, in walk order starting at the
    /// current position.
    fn walk_all(&self) -> Vec<Arc<SendNode>> {
        let mut nodes = Vec::new();
        for _ in 0..self.len() {
            match self.next_node() {
                Some(node) => nodes.push(node),
                None => break,
            }
        }
        nodes
    }
}

/// Builds one framed `API_REGREQ` page for a peer. The sender module is
/// the heartbeat worker's reserved thread record, so the registration
/// confirm comes back to its own queue.
fn heartbeat_page(global: &ApidGlobal, node: &SendNode) -> iclaustron_core::IcResult<Vec<u8>> {
    let mut page = global.send_pool.get_page()?;
    let header = MessageHeader {
        message_number: API_REGREQ,
        priority: 1,
        trace_number: 0,
        sender_module: super::apid::HEARTBEAT_THREAD_ID,
        receiver_module: QMGR_MODULE,
        use_message_id: node.link.use_message_id,
        use_checksum: node.link.use_checksum,
    };
    let main = [
        ic_reference(super::apid::HEARTBEAT_THREAD_ID, node.my_node_id),
        NDB_VERSION,
        MYSQL_VERSION,
    ];
    let words = frame_message(&header, &main, &[])?;
    super::push_words(&mut page, &words);
    Ok(page)
}

/// The heartbeat worker main loop.
pub(crate) async fn run_heartbeat_worker(
    global: Arc<ApidGlobal>,
    mut stop: watch::Receiver<bool>,
) {
    tracing::debug!("heartbeat worker started");
    loop {
        if *stop.borrow() {
            break;
        }
        if global.heartbeat.is_empty() {
            tokio::select! {
                () = global.heartbeat.wake.notified() => {}
                _ = stop.changed() => break,
            }
            continue;
        }

        for node in global.heartbeat.walk_all() {
            if *stop.borrow() {
                break;
            }
            let page = match heartbeat_page(&global, &node) {
                Ok(page) => page,
                Err(err) => {
                    // A persistent allocation failure here means the node
                    // cannot prove liveness; terminate in a controlled way.
                    tracing::error!(error = %err, "heartbeat page allocation failed");
                    global.order_stop();
                    break;
                }
            };
            if let Err(err) = node.send_messages(vec![page], false).await {
                tracing::info!(
                    cluster_id = node.cluster_id,
                    node_id = node.other_node_id,
                    error = %err,
                    "heartbeat send failed"
                );
                global.handle_node_failure(&node).await;
            }
        }

        // Drain the registration confirms addressed to our own record.
        if let Err(err) = global
            .poll_thread(super::apid::HEARTBEAT_THREAD_ID, Duration::ZERO)
            .await
        {
            tracing::warn!(error = %err, "heartbeat reply handling failed");
        }

        tokio::select! {
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            _ = stop.changed() => break,
        }
    }
    tracing::debug!("heartbeat worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::pool::PagePool;
    use iclaustron_core::config::SocketLinkConfig;

    fn test_node(other: u32) -> Arc<SendNode> {
        SendNode::new(0, 1, other, SocketLinkConfig::with_defaults(), PagePool::new(64, 4))
    }

    #[test]
    fn walk_visits_every_node_once_per_round() {
        let list = HeartbeatList::default();
        for other in [2u32, 3, 4] {
            list.add(test_node(other));
        }
        let round: Vec<u32> = list.walk_all().iter().map(|n| n.other_node_id).collect();
        assert_eq!(round, vec![2, 3, 4]);
        // The walk is circular: a second round starts over.
        let round: Vec<u32> = list.walk_all().iter().map(|n| n.other_node_id).collect();
        assert_eq!(round, vec![2, 3, 4]);
    }

    #[test]
    fn removal_under_the_walk_pointer_is_safe() {
        let list = HeartbeatList::default();
        let nodes: Vec<_> = [2u32, 3, 4].iter().map(|&o| test_node(o)).collect();
        for node in &nodes {
            list.add(Arc::clone(node));
        }
        // Advance the walk past node 2, then remove node 2.
        let first = list.next_node().unwrap();
        assert_eq!(first.other_node_id, 2);
        list.remove(&nodes[0]);

        let rest: Vec<u32> = (0..list.len())
            .filter_map(|_| list.next_node())
            .map(|n| n.other_node_id)
            .collect();
        assert_eq!(rest, vec![3, 4]);
    }

    #[test]
    fn empty_list_yields_nothing() {
        let list = HeartbeatList::default();
        assert!(list.is_empty());
        assert!(list.next_node().is_none());
        assert!(list.walk_all().is_empty());
    }
}
