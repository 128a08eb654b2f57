use super::*;
use crate::*;
use occams_fabric::FabricError;

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_open_route_idempotent(runner: TestRunner, #[case] ack: bool) {
    runner.block_on(async move {
        let (server, client) = pair(false, ack, &format!("idem-{}", ack)).await;
        let node = server.node(ECHO);
        let first = client.open_route_to_node(node).await.expect("open");
        let second = client.open_route_to_node(node).await.expect("open again");
        assert_eq!(first, second);
        assert_eq!(first.node, node);
        assert!(first.address.starts_with("tcp://127.0.0.1:"));

        let status = client.routing_status().await.expect("status");
        assert_eq!(status.backends.iter().filter(|(a, _)| *a == first.address).count(), 1);

        // the owner bound the node once and knows the caller
        let bound = server.open_binding(node).await.expect("binding");
        assert_eq!(bound, first.address);
        let callers = server
            .reactor()
            .query(move |r| r.state.nodes.get(&node).and_then(|h| h.binding.as_ref()).map(|b| b.callers.len()))
            .await
            .expect("query");
        assert_eq!(callers, Some(1));
    });
}

#[logfn]
#[rstest]
fn test_close_route(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "close-route").await;
        let node = server.node(ECHO);
        let call = client.call(node, Bytes::from_static(b"one")).await.expect("call");
        call.result().await.expect("result");
        assert_eq!(call.finished().await, occams_fabric::client::OpState::Finished);
        let route = client.router().route(node).await.expect("query").expect("route");
        let pool = client.pool().clone();
        assert!(wait_until(|| pool.idle_count(&route.address) == 1).await);

        assert!(client.close_route_to_node(node).await.expect("close"));
        assert!(client.router().route(node).await.expect("query").is_none());
        assert_eq!(client.pool().idle_count(&route.address), 0);
        let status = client.routing_status().await.expect("status");
        assert!(status.channels(&route.address).is_none());
        assert!(!client.close_route_to_node(node).await.expect("close again"));

        // reopened on the next call
        let call = client.call(node, Bytes::from_static(b"two")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"two"));
    });
}

#[logfn]
#[rstest]
fn test_close_routes_via_instance(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "via-instance").await;
        for local in [ECHO, FAN_OUT, SLOW] {
            client.open_route_to_node(server.node(local)).await.expect("open");
        }
        assert_eq!(client.close_routes_via_instance(server.instance()).await.expect("close"), 3);
        for local in [ECHO, FAN_OUT, SLOW] {
            assert!(client.router().route(server.node(local)).await.expect("query").is_none());
        }
        assert_eq!(client.close_routes_via_instance(server.instance()).await.expect("close"), 0);

        // the same command issued remotely, the server holds no routes
        let count = client
            .control()
            .close_routes_via_instance(server.control_address(), client.instance())
            .await
            .expect("remote close");
        assert_eq!(count, 0);
        // the instance itself stays connected
        let active = client.get_active_connections().await.expect("active");
        assert_eq!(active, vec![(server.instance(), server.control_address().to_string())]);
    });
}

#[logfn]
#[rstest]
fn test_bindings(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "bindings").await;
        let node = server.node(ECHO);
        let address = client.control().open_binding(server.control_address(), node).await.expect("bind");
        assert_eq!(server.open_binding(node).await.expect("bind locally"), address);

        client.control().close_binding(server.control_address(), node).await.expect("unbind");
        let missing = server.node(77);
        match client.control().close_binding(server.control_address(), missing).await {
            Err(FabricError::NoSuchNode(n)) => assert_eq!(n, missing),
            other => panic!("unexpected {:?}", other.err()),
        }
        match client.control().open_binding(server.control_address(), missing).await {
            Err(FabricError::NoSuchNode(n)) => assert_eq!(n, missing),
            other => panic!("unexpected {:?}", other.err()),
        }

        assert!(server.unhost_node(node).await.expect("unhost"));
        assert!(!server.unhost_node(node).await.expect("unhost again"));
        assert!(matches!(client.call(node, Bytes::new()).await, Err(FabricError::NoSuchNode(_))));
    });
}
