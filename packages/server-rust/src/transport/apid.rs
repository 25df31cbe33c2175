//! The global transport handle and the application-thread interface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use iclaustron_core::config::{GridConfig, NodePair};
use iclaustron_core::error::{IcError, IcResult};
use iclaustron_core::frame::{
    frame_message, parse_message, MessageHeader, ParsedMessage, API_REGCONF,
};
use iclaustron_core::types::{ClusterId, NodeId};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use super::handlers::MessageHandlerTable;
use super::heartbeat::{run_heartbeat_worker, HeartbeatList};
use super::listen::{run_listen_server, ListenServer};
use super::pool::{PagePool, RECV_PAGE_SIZE, SEND_PAGE_SIZE};
use super::receive::{run_receive_worker, MessageDesc, ReceiveCmd};
use super::send_node::{run_send_worker, SendNode, SendNodeState};

/// Most application threads one process may register.
pub const MAX_APID_THREADS: u32 = 256;

/// Thread id reserved for the heartbeat worker's own connection record.
pub const HEARTBEAT_THREAD_ID: u32 = 0;

/// Construction knobs for the transport runtime.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub num_receive_workers: usize,
    pub send_page_size: usize,
    pub recv_page_size: usize,
    pub max_send_pages: usize,
    pub max_recv_pages: usize,
}

impl Default for TransportOptions {
    fn default() -> TransportOptions {
        TransportOptions {
            num_receive_workers: 1,
            send_page_size: SEND_PAGE_SIZE,
            recv_page_size: RECV_PAGE_SIZE,
            max_send_pages: 1024,
            max_recv_pages: 1024,
        }
    }
}

/// A received message handed to an application thread.
#[derive(Debug)]
pub struct NdbMessage {
    pub parsed: ParsedMessage,
    /// Normalised message words.
    pub words: Vec<u32>,
    pub cluster_id: ClusterId,
    pub sender_node_id: NodeId,
    pub receiver_node_id: NodeId,
}

impl NdbMessage {
    /// The main payload words.
    #[must_use]
    pub fn main(&self) -> &[u32] {
        &self.words[self.parsed.main.clone()]
    }

    /// One segment payload.
    #[must_use]
    pub fn segment(&self, index: usize) -> Option<&[u32]> {
        self.parsed
            .segments
            .get(index)
            .map(|range| &self.words[range.clone()])
    }
}

/// Per-application-thread record: the input queue and its wait state.
pub struct ThreadConn {
    pub thread_id: u32,
    pub clusters: Vec<ClusterId>,
    queue: Mutex<VecDeque<MessageDesc>>,
    waiting: AtomicBool,
    wake: Notify,
}

/// Worker tasks, joined at shutdown in reverse start order.
#[derive(Default)]
struct WorkerTasks {
    heartbeat: Option<JoinHandle<()>>,
    receive: Vec<JoinHandle<()>>,
    send: Vec<JoinHandle<()>>,
    listen: Vec<JoinHandle<()>>,
}

/// The process-wide transport handle.
pub struct ApidGlobal {
    pub grid: Arc<GridConfig>,
    /// Our node id in every cluster we participate in.
    pub my_node_ids: HashMap<ClusterId, NodeId>,
    pub send_pool: Arc<PagePool>,
    pub(crate) recv_pool: Arc<PagePool>,
    pub handlers: MessageHandlerTable,
    pub(crate) heartbeat: Arc<HeartbeatList>,
    send_nodes: DashMap<(ClusterId, NodeId), Arc<SendNode>>,
    threads: DashMap<u32, Arc<ThreadConn>>,
    receive_admins: Vec<mpsc::UnboundedSender<ReceiveCmd>>,
    next_receive_admin: AtomicUsize,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<WorkerTasks>,
}

impl ApidGlobal {
    /// Builds the transport over a finalized grid configuration and
    /// starts every worker.
    pub fn start(
        grid: Arc<GridConfig>,
        my_node_ids: HashMap<ClusterId, NodeId>,
        options: &TransportOptions,
    ) -> IcResult<Arc<ApidGlobal>> {
        let send_pool = PagePool::new(options.send_page_size, options.max_send_pages);
        let recv_pool = PagePool::new(options.recv_page_size, options.max_recv_pages);
        let (stop_tx, _) = watch::channel(false);

        let mut admin_txs = Vec::new();
        let mut admin_rxs = Vec::new();
        for _ in 0..options.num_receive_workers.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            admin_txs.push(tx);
            admin_rxs.push(rx);
        }

        let global = ApidGlobal {
            grid: Arc::clone(&grid),
            my_node_ids: my_node_ids.clone(),
            send_pool,
            recv_pool,
            handlers: MessageHandlerTable::new(),
            heartbeat: Arc::new(HeartbeatList::default()),
            send_nodes: DashMap::new(),
            threads: DashMap::new(),
            receive_admins: admin_txs,
            next_receive_admin: AtomicUsize::new(0),
            stop_tx,
            tasks: Mutex::new(WorkerTasks::default()),
        };

        // The heartbeat worker owns the reserved thread record so the
        // registration replies it triggers have somewhere to land.
        global.threads.insert(
            HEARTBEAT_THREAD_ID,
            Arc::new(ThreadConn {
                thread_id: HEARTBEAT_THREAD_ID,
                clusters: my_node_ids.keys().copied().collect(),
                queue: Mutex::new(VecDeque::new()),
                waiting: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        );

        global.handlers.register(
            API_REGCONF,
            0,
            Arc::new(|message, global| {
                global.record_peer_registration(message);
                Ok(())
            }),
        );

        // One send node per peer on every cluster we are part of.
        let mut listen_servers: HashMap<(String, u16), Arc<ListenServer>> = HashMap::new();
        for (&cluster_id, &my_node_id) in &my_node_ids {
            let cluster = grid
                .cluster(cluster_id)
                .ok_or(IcError::NoSuchCluster { cluster_id })?;
            for other in cluster.node_ids() {
                if other == my_node_id {
                    continue;
                }
                let pair = NodePair::new(my_node_id, other);
                let Some(link) = cluster.comm(pair) else {
                    tracing::warn!(cluster_id, node_id = other, "no link record for peer");
                    continue;
                };
                let node = SendNode::new(
                    cluster_id,
                    my_node_id,
                    other,
                    link.clone(),
                    Arc::clone(&global.send_pool),
                );
                if node.is_server_side {
                    let key = (node.my_hostname.clone(), node.my_port);
                    let server = listen_servers
                        .entry(key.clone())
                        .or_insert_with(|| ListenServer::new(key.0, key.1));
                    server.register(Arc::clone(&node));
                }
                global.send_nodes.insert((cluster_id, other), node);
            }
        }

        let global = Arc::new(global);
        let mut tasks = WorkerTasks::default();
        for rx in admin_rxs {
            tasks
                .receive
                .push(tokio::spawn(run_receive_worker(Arc::clone(&global), rx)));
        }
        for server in listen_servers.into_values() {
            tasks.listen.push(tokio::spawn(run_listen_server(
                server,
                global.stop_tx.subscribe(),
            )));
        }
        for entry in &global.send_nodes {
            tasks.send.push(tokio::spawn(run_send_worker(
                Arc::clone(entry.value()),
                Arc::clone(&global),
            )));
        }
        tasks.heartbeat = Some(tokio::spawn(run_heartbeat_worker(
            Arc::clone(&global),
            global.stop_tx.subscribe(),
        )));
        *global.tasks.lock() = tasks;

        tracing::info!(
            clusters = my_node_ids.len(),
            peers = global.send_nodes.len(),
            "transport runtime started"
        );
        Ok(global)
    }

    /// The send node toward a peer.
    pub fn send_node(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
    ) -> IcResult<Arc<SendNode>> {
        if !self.my_node_ids.contains_key(&cluster_id) {
            return Err(IcError::NoSuchCluster { cluster_id });
        }
        self.send_nodes
            .get(&(cluster_id, node_id))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(IcError::NoSuchNode {
                cluster_id,
                node_id,
            })
    }

    /// Submits framed pages toward a peer.
    pub async fn send_messages(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        pages: Vec<Vec<u8>>,
        force_send: bool,
    ) -> IcResult<()> {
        let node = match self.send_node(cluster_id, node_id) {
            Ok(node) => node,
            Err(err) => {
                self.send_pool.return_pages(pages);
                return Err(err);
            }
        };
        let result = node.send_messages(pages, force_send).await;
        if result.is_err() {
            self.handle_node_failure(&node).await;
        }
        result
    }

    /// Hands a freshly authenticated connection to the runtime: writer
    /// to the send node, reader to a receive worker, node onto the
    /// heartbeat list.
    pub(crate) async fn finish_connect(
        &self,
        node: &Arc<SendNode>,
        stream: TcpStream,
    ) -> IcResult<()> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        *node.writer.lock().await = Some(writer);
        {
            let mut inner = node.inner.lock();
            inner.state = SendNodeState::LoggedIn;
            inner.message_id = 1;
        }
        let admin = self.pick_receive_admin();
        admin
            .send(ReceiveCmd::Add {
                node: Arc::clone(node),
                reader,
            })
            .map_err(|_| IcError::StopOrdered)?;
        self.heartbeat.add(Arc::clone(node));
        node.inner.lock().state = SendNodeState::NodeUp;
        tracing::info!(
            cluster_id = node.cluster_id,
            node_id = node.other_node_id,
            "peer connection up"
        );
        Ok(())
    }

    fn pick_receive_admin(&self) -> &mpsc::UnboundedSender<ReceiveCmd> {
        let index = self.next_receive_admin.fetch_add(1, Ordering::Relaxed);
        &self.receive_admins[index % self.receive_admins.len()]
    }

    /// Full node-failure handling: local teardown plus heartbeat and
    /// receive-side detachment. Safe to call more than once.
    pub(crate) async fn handle_node_failure(&self, node: &Arc<SendNode>) {
        node.take_down().await;
        self.heartbeat.remove(node);
        for admin in &self.receive_admins {
            let _ = admin.send(ReceiveCmd::Remove {
                cluster_id: node.cluster_id,
                node_id: node.other_node_id,
            });
        }
    }

    /// Default handling of a registration confirm: record the peer's
    /// advertised start state.
    fn record_peer_registration(&self, message: &NdbMessage) {
        let start_state = message.main().get(3).copied().unwrap_or(0);
        if let Some(entry) = self
            .send_nodes
            .get(&(message.cluster_id, message.sender_node_id))
        {
            entry.value().inner.lock().peer_start_state = start_state;
        }
        tracing::debug!(
            cluster_id = message.cluster_id,
            node_id = message.sender_node_id,
            start_state,
            "peer registration confirmed"
        );
    }

    /// Registers a new application thread, binding the first free slot.
    pub fn create_apid_connection(
        self: &Arc<Self>,
        clusters: Vec<ClusterId>,
    ) -> IcResult<ApidConnection> {
        for cluster_id in &clusters {
            if !self.my_node_ids.contains_key(cluster_id) {
                return Err(IcError::NoSuchCluster {
                    cluster_id: *cluster_id,
                });
            }
        }
        for thread_id in 1..MAX_APID_THREADS {
            let entry = self.threads.entry(thread_id);
            if let dashmap::mapref::entry::Entry::Vacant(vacant) = entry {
                vacant.insert(Arc::new(ThreadConn {
                    thread_id,
                    clusters,
                    queue: Mutex::new(VecDeque::new()),
                    waiting: AtomicBool::new(false),
                    wake: Notify::new(),
                }));
                return Ok(ApidConnection {
                    global: Arc::clone(self),
                    thread_id,
                    queries: super::query::QueryTracker::new(),
                });
            }
        }
        Err(IcError::MemAlloc)
    }

    /// Appends a delivered batch to an application thread's input queue,
    /// waking the thread when it marked itself waiting.
    pub(crate) fn deliver_to_thread(&self, thread_id: u32, batch: Vec<MessageDesc>) {
        let Some(thread) = self.threads.get(&thread_id).map(|e| Arc::clone(e.value()))
        else {
            tracing::debug!(thread_id, dropped = batch.len(), "no such application thread");
            return;
        };
        thread.queue.lock().extend(batch);
        if thread.waiting.swap(false, Ordering::AcqRel) {
            thread.wake.notify_one();
        }
    }

    /// Detaches and executes an application thread's input queue.
    ///
    /// Waits up to `timeout` when the queue is empty. Returns the number
    /// of messages executed.
    pub async fn poll_thread(&self, thread_id: u32, timeout: Duration) -> IcResult<usize> {
        let thread = self
            .threads
            .get(&thread_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(IcError::TranslationIndexOutOfBound)?;

        let mut batch: Vec<MessageDesc> = {
            let mut queue = thread.queue.lock();
            queue.drain(..).collect()
        };
        if batch.is_empty() && !timeout.is_zero() {
            thread.waiting.store(true, Ordering::Release);
            let _ = tokio::time::timeout(timeout, thread.wake.notified()).await;
            thread.waiting.store(false, Ordering::Release);
            batch = thread.queue.lock().drain(..).collect();
        }

        let mut executed = 0usize;
        for desc in batch {
            let mut words = desc.words();
            let parsed = parse_message(&mut words)?;
            let message = NdbMessage {
                parsed,
                words,
                cluster_id: desc.cluster_id,
                sender_node_id: desc.sender_node_id,
                receiver_node_id: desc.receiver_node_id,
            };
            match self.handlers.lookup(message.parsed.message_number, 0) {
                Some(handler) => handler(&message, self)?,
                None => {
                    tracing::debug!(
                        message_number = message.parsed.message_number,
                        "no handler registered"
                    );
                }
            }
            if desc.ref_count_releases > 0 {
                desc.page.release(desc.ref_count_releases);
            }
            executed += 1;
        }
        Ok(executed)
    }

    pub(crate) fn remove_thread(&self, thread_id: u32) {
        self.threads.remove(&thread_id);
    }

    /// Orders cooperative shutdown; workers notice at their suspension
    /// points.
    pub fn order_stop(&self) {
        let _ = self.stop_tx.send(true);
        for entry in &self.send_nodes {
            entry.value().order_stop();
        }
        self.heartbeat.wake.notify_one();
        for admin in &self.receive_admins {
            let _ = admin.send(ReceiveCmd::Stop);
        }
        for entry in &self.threads {
            entry.value().wake.notify_one();
        }
    }

    /// Stops every worker and joins them in reverse start order:
    /// heartbeat, then receive workers, then send workers, then listen
    /// servers.
    pub async fn stop(&self) {
        self.order_stop();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if let Some(heartbeat) = tasks.heartbeat {
            let _ = heartbeat.await;
        }
        for task in tasks.receive {
            let _ = task.await;
        }
        for task in tasks.send {
            let _ = task.await;
        }
        for task in tasks.listen {
            let _ = task.await;
        }
        // Drop the connections so peers see the close promptly.
        for entry in &self.send_nodes {
            entry.value().take_down().await;
        }
        tracing::info!("transport runtime stopped");
    }
}

/// An application thread's handle onto the transport.
pub struct ApidConnection {
    global: Arc<ApidGlobal>,
    thread_id: u32,
    queries: super::query::QueryTracker,
}

impl ApidConnection {
    #[must_use]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    #[must_use]
    pub fn global(&self) -> &Arc<ApidGlobal> {
        &self.global
    }

    /// The query lists owned by this application thread.
    #[must_use]
    pub fn queries(&self) -> &super::query::QueryTracker {
        &self.queries
    }

    /// Polls this thread's input queue, executing handlers for every
    /// delivered message.
    pub async fn poll(&self, timeout: Duration) -> IcResult<usize> {
        self.global.poll_thread(self.thread_id, timeout).await
    }

    /// Frames one message into a fresh page and submits it.
    pub async fn send_message(
        &self,
        cluster_id: ClusterId,
        node_id: NodeId,
        message_number: u32,
        receiver_module: u32,
        main: &[u32],
        force_send: bool,
    ) -> IcResult<()> {
        let node = self.global.send_node(cluster_id, node_id)?;
        let header = MessageHeader {
            message_number,
            priority: 1,
            trace_number: 0,
            sender_module: self.thread_id,
            receiver_module,
            use_message_id: node.link.use_message_id,
            use_checksum: node.link.use_checksum,
        };
        let words = frame_message(&header, main, &[])?;
        let mut page = self.global.send_pool.get_page()?;
        super::push_words(&mut page, &words);
        self.global
            .send_messages(cluster_id, node_id, vec![page], force_send)
            .await
    }
}

impl Drop for ApidConnection {
    fn drop(&mut self) {
        self.global.remove_thread(self.thread_id);
    }
}
