//! The configuration line protocol: CR-line transport, client driver,
//! and the server-side state machine.

pub mod client;
pub mod line;
pub mod server;

pub use client::{fetch_over, get_cs_config, ConfigClientOptions, FetchedConfig};
pub use line::LineConnection;
pub use server::{serve_connection, CsService, ServeOutcome};

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use iclaustron_core::codec::encode_config;
    use iclaustron_core::config::{ClusterConfig, ClusterInfo, NodeConfig, ParamTarget};
    use iclaustron_core::error::{IcError, IcResult};
    use iclaustron_core::registry::{ParamValue, Registry};
    use iclaustron_core::types::{pack_version, ClusterId, NodeId, NodeKind, NDB_VERSION};

    use super::*;

    fn set(target: &mut dyn ParamTarget, name: &str, value: ParamValue) {
        let entry = Registry::global().lookup_by_name(name).unwrap();
        target.set_param(entry, &value).unwrap();
    }

    fn sample_cluster(name: &str, cluster_id: ClusterId) -> ClusterConfig {
        let mut cluster = ClusterConfig::new(ClusterInfo {
            cluster_name: name.to_string(),
            cluster_id,
            password: String::new(),
        });
        let mut ds = NodeConfig::with_defaults(NodeKind::DataServer);
        set(&mut ds, "node_id", ParamValue::Num(1));
        set(&mut ds, "hostname", ParamValue::Str("ds1".to_string()));
        cluster.add_node(ds).unwrap();
        let mut client = NodeConfig::with_defaults(NodeKind::Client);
        set(&mut client, "node_id", ParamValue::Num(3));
        set(&mut client, "hostname", ParamValue::Str("api1".to_string()));
        cluster.add_node(client).unwrap();
        cluster.synthesize_missing_links();
        cluster
    }

    /// Test service over a fixed two-cluster grid.
    struct MockService {
        clusters: Vec<ClusterConfig>,
        assigned: Mutex<Vec<(ClusterId, NodeId)>>,
        events: Mutex<Vec<Vec<u32>>>,
        ports: Mutex<Vec<(ClusterId, NodeId, NodeId, i64)>>,
    }

    impl MockService {
        fn new() -> MockService {
            MockService {
                clusters: vec![sample_cluster("kalle", 0), sample_cluster("olle", 1)],
                assigned: Mutex::new(Vec::new()),
                events: Mutex::new(Vec::new()),
                ports: Mutex::new(Vec::new()),
            }
        }
    }

    impl CsService for MockService {
        fn cluster_list(&self) -> Vec<(String, ClusterId)> {
            self.clusters
                .iter()
                .map(|c| (c.info.cluster_name.clone(), c.info.cluster_id))
                .collect()
        }

        fn assign_node_id(
            &self,
            cluster_id: ClusterId,
            _node_type: u32,
            requested: NodeId,
        ) -> IcResult<NodeId> {
            let assigned = if requested == 0 { 4 } else { requested };
            self.assigned.lock().unwrap().push((cluster_id, assigned));
            Ok(assigned)
        }

        fn encoded_config(&self, cluster_id: ClusterId, version: u32) -> IcResult<String> {
            let cluster = self
                .clusters
                .iter()
                .find(|c| c.info.cluster_id == cluster_id)
                .ok_or(IcError::NoSuchCluster { cluster_id })?;
            encode_config(cluster, version)
        }

        fn own_node_id(&self) -> NodeId {
            4
        }

        fn set_connection_parameter(
            &self,
            cluster_id: ClusterId,
            node1: NodeId,
            node2: NodeId,
            _param: u32,
            value: i64,
        ) -> IcResult<String> {
            self.ports
                .lock()
                .unwrap()
                .push((cluster_id, node1, node2, value));
            Ok("stored".to_string())
        }

        fn get_connection_parameter(
            &self,
            cluster_id: ClusterId,
            node1: NodeId,
            node2: NodeId,
            _param: u32,
        ) -> IcResult<i64> {
            self.ports
                .lock()
                .unwrap()
                .iter()
                .find(|(c, a, b, _)| *c == cluster_id && *a == node1 && *b == node2)
                .map(|(_, _, _, v)| *v)
                .ok_or(IcError::NoSuchNode {
                    cluster_id,
                    node_id: node1,
                })
        }

        fn report_event(&self, data: &[u32]) {
            self.events.lock().unwrap().push(data.to_vec());
        }
    }

    fn ic_version() -> u32 {
        pack_version(NDB_VERSION, 1)
    }

    /// Spawns the server driver over one end of a duplex pipe.
    fn spawn_server(
        service: std::sync::Arc<MockService>,
    ) -> (
        LineConnection<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<IcResult<()>>,
    ) {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            match serve_connection(LineConnection::new(server_end), service.as_ref()).await? {
                ServeOutcome::Closed | ServeOutcome::Transporter { .. } => Ok(()),
            }
        });
        (LineConnection::new(client_end), handle)
    }

    #[tokio::test]
    async fn full_fetch_of_two_clusters() {
        let service = std::sync::Arc::new(MockService::new());
        let (conn, server) = spawn_server(service.clone());

        let options = ConfigClientOptions {
            endpoints: Vec::new(),
            cluster_names: vec!["kalle".to_string(), "olle".to_string()],
            requested_node_id: 0,
            version: ic_version(),
            node_type: NodeKind::Client.wire_value(),
        };
        let fetched = fetch_over(conn, &options).await.unwrap();

        assert_eq!(fetched.grid.num_clusters(), 2);
        assert_eq!(fetched.node_ids[&0], 4);
        assert_eq!(fetched.node_ids[&1], 4);
        let kalle = fetched.grid.cluster(0).unwrap();
        assert_eq!(kalle.num_nodes(), 2);
        assert_eq!(kalle.node_kind(1), Some(NodeKind::DataServer));
        assert_eq!(kalle.num_comms(), 1);

        drop(server);
    }

    #[tokio::test]
    async fn fetch_single_named_cluster() {
        let service = std::sync::Arc::new(MockService::new());
        let (conn, _server) = spawn_server(service.clone());

        let options = ConfigClientOptions {
            endpoints: Vec::new(),
            cluster_names: vec!["olle".to_string()],
            requested_node_id: 7,
            version: ic_version(),
            node_type: NodeKind::Client.wire_value(),
        };
        let fetched = fetch_over(conn, &options).await.unwrap();
        assert_eq!(fetched.grid.num_clusters(), 1);
        assert_eq!(fetched.node_ids[&1], 7);
        assert_eq!(service.assigned.lock().unwrap().as_slice(), &[(1, 7)]);
    }

    #[tokio::test]
    async fn unknown_cluster_name_is_refused() {
        let service = std::sync::Arc::new(MockService::new());
        let (conn, _server) = spawn_server(service);

        let options = ConfigClientOptions {
            endpoints: Vec::new(),
            cluster_names: vec!["nope".to_string()],
            requested_node_id: 0,
            version: ic_version(),
            node_type: NodeKind::Client.wire_value(),
        };
        assert!(matches!(
            fetch_over(conn, &options).await,
            Err(IcError::NoSuchCluster { .. })
        ));
    }

    #[tokio::test]
    async fn classic_fetch_without_cluster_list() {
        let service = std::sync::Arc::new(MockService::new());
        let (conn, _server) = spawn_server(service);

        let options = ConfigClientOptions {
            endpoints: Vec::new(),
            cluster_names: Vec::new(),
            requested_node_id: 0,
            version: NDB_VERSION & iclaustron_core::types::IC_BASE_VERSION_MASK,
            node_type: NodeKind::Client.wire_value(),
        };
        let fetched = fetch_over(conn, &options).await.unwrap();
        assert_eq!(fetched.grid.num_clusters(), 1);
        assert!(fetched.grid.cluster(0).is_some());
    }

    #[tokio::test]
    async fn get_nodeid_exchange_line_by_line() {
        // The ten-line exchange of the protocol, spelled out.
        let service = std::sync::Arc::new(MockService::new());
        let (mut conn, _server) = spawn_server(service);

        conn.write_group(&[
            "get nodeid",
            "nodeid: 0",
            "version: 1048576",
            "nodetype: 1",
            "user: mysqld",
            "password: mysqld",
            "public key: a public key",
            "endian: little",
            "log_event: 0",
            "cluster_id: 0",
        ])
        .await
        .unwrap();

        assert_eq!(conn.read_line().await.unwrap(), "get nodeid reply");
        assert_eq!(conn.read_line().await.unwrap(), "nodeid: 4");
        assert_eq!(conn.read_line().await.unwrap(), "result: Ok");
        assert_eq!(conn.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn out_of_order_action_closes_connection() {
        let service = std::sync::Arc::new(MockService::new());
        let (client_end, server_end) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            serve_connection(LineConnection::new(server_end), &MockService::new()).await
        });
        drop(service);

        let mut conn = LineConnection::new(client_end);
        // get config before any get nodeid is out of order.
        conn.write_group(&["get config", "version: 0", "nodetype: 1"])
            .await
            .unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(IcError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn mgmd_nodeid_then_connection_parameters() {
        let service = std::sync::Arc::new(MockService::new());
        let (mut conn, _server) = spawn_server(service.clone());

        // One nodeid exchange first, as the state machine requires.
        conn.write_group(&[
            "get nodeid",
            "nodeid: 3",
            "version: 1048576",
            "nodetype: 1",
            "user: mysqld",
            "password: mysqld",
            "public key: a public key",
            "endian: little",
            "log_event: 0",
            "cluster_id: 0",
        ])
        .await
        .unwrap();
        for _ in 0..4 {
            conn.read_line().await.unwrap();
        }

        conn.write_group(&["get mgmd nodeid"]).await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "get mgmd nodeid reply");
        assert_eq!(conn.read_line().await.unwrap(), "nodeid: 4");
        assert_eq!(conn.read_line().await.unwrap(), "");

        // Report a dynamic port, then read it back.
        conn.write_group(&[
            "set connection parameter",
            "cluster_id: 0",
            "node1: 1",
            "node2: 3",
            "param: 406",
            "value: -11877",
        ])
        .await
        .unwrap();
        assert_eq!(
            conn.read_line().await.unwrap(),
            "set connection parameter reply"
        );
        assert_eq!(conn.read_line().await.unwrap(), "message: stored");
        assert_eq!(conn.read_line().await.unwrap(), "result: Ok");
        assert_eq!(conn.read_line().await.unwrap(), "");

        conn.write_group(&[
            "get connection parameter",
            "cluster_id: 0",
            "node1: 1",
            "node2: 3",
            "param: 406",
        ])
        .await
        .unwrap();
        assert_eq!(
            conn.read_line().await.unwrap(),
            "get connection parameter reply"
        );
        assert_eq!(conn.read_line().await.unwrap(), "value: -11877");
        assert_eq!(conn.read_line().await.unwrap(), "result: Ok");
        assert_eq!(conn.read_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn report_event_round_trip() {
        let service = std::sync::Arc::new(MockService::new());
        let (mut conn, server) = spawn_server(service.clone());

        conn.write_group(&["report event", "length: 3", "data: 7 8 9"])
            .await
            .unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "report event reply");
        assert_eq!(conn.read_line().await.unwrap(), "result: Ok");
        assert_eq!(conn.read_line().await.unwrap(), "");

        server.await.unwrap().unwrap();
        assert_eq!(service.events.lock().unwrap().as_slice(), &[vec![7, 8, 9]]);
    }

    #[tokio::test]
    async fn transporter_conversion_surrenders_the_stream() {
        let service = std::sync::Arc::new(MockService::new());
        let (client_end, server_end) = tokio::io::duplex(4096);
        let handle = tokio::spawn(async move {
            serve_connection(LineConnection::new(server_end), &MockService::new()).await
        });
        drop(service);

        let mut conn = LineConnection::new(client_end);
        conn.write_group(&[
            "get nodeid",
            "nodeid: 3",
            "version: 1048576",
            "nodetype: 1",
            "user: mysqld",
            "password: mysqld",
            "public key: a public key",
            "endian: little",
            "log_event: 0",
            "cluster_id: 0",
        ])
        .await
        .unwrap();
        for _ in 0..4 {
            conn.read_line().await.unwrap();
        }
        conn.write_group(&["get mgmd nodeid"]).await.unwrap();
        for _ in 0..3 {
            conn.read_line().await.unwrap();
        }

        conn.write_lines(&["3 1"]).await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), "4 1");

        let outcome = handle.await.unwrap().unwrap();
        match outcome {
            ServeOutcome::Transporter {
                peer_node_id,
                transporter_type,
                cluster_id,
                ..
            } => {
                assert_eq!(peer_node_id, 3);
                assert_eq!(transporter_type, 1);
                assert_eq!(cluster_id, 0);
            }
            ServeOutcome::Closed => panic!("expected transporter conversion"),
        }
    }
}
