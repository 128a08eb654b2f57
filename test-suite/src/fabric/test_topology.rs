use super::*;
use crate::*;
use occams_fabric::{InstanceId, StaticDirectory};
use std::sync::{Arc, Mutex};

type Seen = Arc<Mutex<Vec<(InstanceId, String)>>>;

fn recorder() -> (Seen, impl Fn(InstanceId, &str) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |instance: InstanceId, address: &str| sink.lock().unwrap().push((instance, address.to_string())))
}

#[logfn]
#[rstest]
fn test_connect_listeners(runner: TestRunner) {
    runner.block_on(async move {
        let server = server(None, config(false, "listen-server", true)).await;
        let client = Fabric::builder(config(false, "listen-client", true)).build().await.expect("build");
        let (connected, on_connect) = recorder();
        let (disconnected, on_disconnect) = recorder();
        client.subscribe_to_connect(on_connect).await.expect("subscribe");
        client.subscribe_to_disconnect(on_disconnect).await.expect("subscribe");

        let id = client.connect_to_instance(server.control_address()).await.expect("connect");
        assert_eq!(id, server.instance());
        // a second connect is not a new instance
        client.connect_to_instance(server.control_address()).await.expect("connect again");
        let expect = vec![(server.instance(), server.control_address().to_string())];
        assert_eq!(*connected.lock().unwrap(), expect);
        assert_eq!(client.get_active_connections().await.expect("active"), expect);

        client.open_route_to_node(server.node(ECHO)).await.expect("route");
        assert!(client.disconnect_instance(server.instance()).await.expect("disconnect"));
        assert!(!client.disconnect_instance(server.instance()).await.expect("disconnect again"));
        assert_eq!(*disconnected.lock().unwrap(), expect);
        assert!(client.get_active_connections().await.expect("active").is_empty());
        // routes via the instance went with it
        assert!(client.router().route(server.node(ECHO)).await.expect("query").is_none());
        // and it can no longer be routed to
        assert!(client.open_route_to_node(server.node(ECHO)).await.is_err());
    });
}

#[logfn]
#[rstest]
fn test_connect_to_self(runner: TestRunner) {
    runner.block_on(async move {
        let fabric = server(None, config(false, "self", true)).await;
        let (connected, on_connect) = recorder();
        fabric.subscribe_to_connect(on_connect).await.expect("subscribe");
        let id = fabric.connect_to_instance(fabric.control_address()).await.expect("connect");
        assert_eq!(id, fabric.instance());
        assert!(connected.lock().unwrap().is_empty());
        assert!(fabric.get_active_connections().await.expect("active").is_empty());
        assert!(!fabric.disconnect_instance(fabric.instance()).await.expect("disconnect"));
    });
}

#[logfn]
#[rstest]
fn test_directory(runner: TestRunner) {
    runner.block_on(async move {
        let a = server(None, config(false, "dir-a", true)).await;
        let b = server(None, config(false, "dir-b", true)).await;
        let directory = StaticDirectory(vec![
            a.control_address().to_string(),
            b.control_address().to_string(),
            // unreachable entries are skipped
            "tcp://127.0.0.1:1".to_string(),
        ]);
        let mut config = config(false, "dir-client", true);
        config.control_timeout = Duration::from_millis(500);
        let client = Fabric::builder(config).directory(directory).build().await.expect("build");
        let mut active: Vec<InstanceId> =
            client.get_active_connections().await.expect("active").into_iter().map(|(id, _)| id).collect();
        active.sort();
        let mut expect = vec![a.instance(), b.instance()];
        expect.sort();
        assert_eq!(active, expect);

        // calls across both instances
        for fabric in [&a, &b] {
            let call = client.call(fabric.node(ECHO), Bytes::from_static(b"x")).await.expect("call");
            assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"x"));
        }
    });
}
