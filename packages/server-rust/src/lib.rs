//! iClaustron Server -- config file store, cluster-server runtime, and
//! the data-layer transport.

pub mod files;
pub mod proto;
pub mod runtime;
pub mod transport;

pub use files::{commit_new_generation, lock_and_load, read_version, write_version};
pub use proto::{get_cs_config, ConfigClientOptions, CsService, LineConnection, ServeOutcome};
pub use runtime::{ClusterServer, CsOptions};
pub use transport::{ApidConnection, ApidGlobal, TransportOptions};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}

/// Integration tests for the transport runtime: two peers over real
/// sockets, message delivery, ordering, and liveness.
#[cfg(test)]
mod transport_integration_tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use iclaustron_core::config::{
        ClusterConfig, ClusterInfo, GridConfig, NodeConfig, ParamTarget, SocketLinkConfig,
    };
    use iclaustron_core::registry::{ParamValue, Registry};
    use iclaustron_core::types::NodeKind;

    use crate::transport::{ApidGlobal, SendNodeState, TransportOptions};

    fn set(target: &mut dyn ParamTarget, name: &str, value: ParamValue) {
        let entry = Registry::global().lookup_by_name(name).unwrap();
        target.set_param(entry, &value).unwrap();
    }

    /// A free localhost port, found by binding an ephemeral listener.
    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// One cluster: data server 1 serves the link toward client 3.
    fn two_node_grid(port: u16) -> Arc<GridConfig> {
        let mut cluster = ClusterConfig::new(ClusterInfo {
            cluster_name: "t".to_string(),
            cluster_id: 0,
            password: String::new(),
        });
        let mut ds = NodeConfig::with_defaults(NodeKind::DataServer);
        set(&mut ds, "node_id", ParamValue::Num(1));
        set(&mut ds, "hostname", ParamValue::Str("127.0.0.1".to_string()));
        cluster.add_node(ds).unwrap();
        let mut client = NodeConfig::with_defaults(NodeKind::Client);
        set(&mut client, "node_id", ParamValue::Num(3));
        set(&mut client, "hostname", ParamValue::Str("127.0.0.1".to_string()));
        cluster.add_node(client).unwrap();

        let mut link = SocketLinkConfig::with_defaults();
        link.first_node_id = 1;
        link.second_node_id = 3;
        link.first_hostname = "127.0.0.1".to_string();
        link.second_hostname = "127.0.0.1".to_string();
        link.server_node_id = 1;
        link.server_port_number = u32::from(port);
        link.use_message_id = true;
        link.use_checksum = true;
        cluster.insert_comm(link);

        let mut grid = GridConfig::new();
        grid.add_cluster(cluster).unwrap();
        Arc::new(grid)
    }

    async fn wait_node_up(global: &Arc<ApidGlobal>, peer: u32) -> bool {
        for _ in 0..200 {
            if global.send_node(0, peer).unwrap().state() == SendNodeState::NodeUp {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn messages_flow_between_two_peers_in_order() {
        let port = free_port();
        let grid = two_node_grid(port);

        // The data server side owns the listen socket; start it first.
        let server_side = ApidGlobal::start(
            Arc::clone(&grid),
            HashMap::from([(0u32, 1u32)]),
            &TransportOptions::default(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let client_side = ApidGlobal::start(
            Arc::clone(&grid),
            HashMap::from([(0u32, 3u32)]),
            &TransportOptions::default(),
        )
        .unwrap();

        assert!(wait_node_up(&server_side, 3).await, "server side never up");
        assert!(wait_node_up(&client_side, 1).await, "client side never up");

        // Receiving application thread on the data-server side.
        let received: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        server_side.handlers.register(
            100,
            0,
            Arc::new(move |message, _global| {
                sink.lock().unwrap().push(message.main().to_vec());
                Ok(())
            }),
        );
        let receiver = server_side
            .create_apid_connection(vec![0])
            .unwrap();
        let sender = client_side.create_apid_connection(vec![0]).unwrap();

        // Batches submitted in order by one thread arrive in order.
        for index in 0..5u32 {
            sender
                .send_message(0, 1, 100, receiver.thread_id(), &[index, 7, 8], true)
                .await
                .unwrap();
        }

        let mut executed = 0usize;
        for _ in 0..100 {
            executed += receiver.poll(Duration::from_millis(100)).await.unwrap();
            if executed >= 5 {
                break;
            }
        }
        assert_eq!(executed, 5, "expected five delivered messages");
        let mains = received.lock().unwrap().clone();
        let first_words: Vec<u32> = mains.iter().map(|m| m[0]).collect();
        assert_eq!(first_words, vec![0, 1, 2, 3, 4]);

        client_side.stop().await;
        server_side.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn send_to_unknown_peer_fails_cleanly() {
        let port = free_port();
        let grid = two_node_grid(port);
        let global = ApidGlobal::start(
            grid,
            HashMap::from([(0u32, 1u32)]),
            &TransportOptions::default(),
        )
        .unwrap();

        let conn = global.create_apid_connection(vec![0]).unwrap();
        // Node 9 is not in the grid.
        let err = conn.send_message(0, 9, 100, 1, &[1], true).await.unwrap_err();
        assert!(matches!(
            err,
            iclaustron_core::IcError::NoSuchNode { node_id: 9, .. }
        ));
        // Node 3 exists but is down: nothing connected yet.
        let err = conn.send_message(0, 3, 100, 1, &[1], true).await.unwrap_err();
        assert!(matches!(
            err,
            iclaustron_core::IcError::NodeDown { node_id: 3, .. }
        ));

        global.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peer_loss_takes_node_down() {
        let port = free_port();
        let grid = two_node_grid(port);
        let server_side = ApidGlobal::start(
            Arc::clone(&grid),
            HashMap::from([(0u32, 1u32)]),
            &TransportOptions::default(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let client_side = ApidGlobal::start(
            Arc::clone(&grid),
            HashMap::from([(0u32, 3u32)]),
            &TransportOptions::default(),
        )
        .unwrap();
        assert!(wait_node_up(&server_side, 3).await);
        assert!(wait_node_up(&client_side, 1).await);

        // Kill the client side; the server side notices on its next read.
        client_side.stop().await;
        let mut down = false;
        for _ in 0..200 {
            if server_side.send_node(0, 3).unwrap().state() == SendNodeState::NodeDown {
                down = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(down, "server side never noticed the loss");

        server_side.stop().await;
    }
}
