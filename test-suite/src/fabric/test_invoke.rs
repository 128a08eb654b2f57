use super::*;
use crate::*;
use occams_fabric::client::OpState;
use occams_fabric::{Callback, FabricError, InvokeError, NodeRequest, server::typed};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[logfn]
#[rstest]
#[case(false, true)]
#[case(false, false)]
#[case(true, true)]
#[case(true, false)]
fn test_echo(runner: TestRunner, #[case] inproc: bool, #[case] ack: bool) {
    runner.block_on(async move {
        let (server, client) = pair(inproc, ack, &format!("echo-{}-{}", inproc, ack)).await;
        for i in 0..10 {
            let payload = Bytes::from(format!("hello {}", i));
            let call = client.call(server.node(ECHO), payload.clone()).await.expect("call");
            assert_eq!(call.result().await.expect("result"), payload);
            assert_eq!(call.finished().await, OpState::Finished);
        }
        // sequential calls share one pooled channel
        let route = client.router().route(server.node(ECHO)).await.expect("query").expect("route");
        let pool = client.pool().clone();
        assert!(wait_until(|| pool.idle_count(&route.address) == 1).await);
        client.shutdown().await;
        server.shutdown().await;
    });
}

#[logfn]
#[rstest]
fn test_callbacks_in_order(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "callbacks").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut callbacks: Vec<Callback> = Vec::new();
        for i in 1..=2 {
            let seen = seen.clone();
            callbacks.push(Box::new(move |res| {
                seen.lock().unwrap().push((i, res.expect("part")));
            }));
        }
        let call = client
            .call_with_callbacks(server.node(FAN_OUT), Bytes::from_static(b"sync"), callbacks)
            .await
            .expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"sync"));
        assert_eq!(call.finished().await, OpState::Finished);
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(1, Bytes::from_static(b"part-1")), (2, Bytes::from_static(b"part-2"))]
        );
    });
}

#[logfn]
#[rstest]
fn test_remote_errors(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "errors").await;
        let call = client.call(server.node(FAILING), Bytes::new()).await.expect("call");
        match call.result().await {
            Err(InvokeError::Remote(e)) => {
                assert_eq!(e.code, RemoteError::GENERIC);
                assert_eq!(e.message, "refused");
            }
            other => panic!("unexpected {:?}", other),
        }
        let call = client.call(server.node(PANICKING), Bytes::new()).await.expect("call");
        match call.result().await {
            Err(InvokeError::Remote(e)) => assert_eq!(e.code, RemoteError::PANIC),
            other => panic!("unexpected {:?}", other),
        }
        // the node loop survives the panic
        let call = client.call(server.node(ECHO), Bytes::from_static(b"again")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"again"));

        let missing = server.node(99);
        match client.call(missing, Bytes::new()).await {
            Err(FabricError::NoSuchNode(n)) => assert_eq!(n, missing),
            Err(e) => panic!("unexpected {}", e),
            Ok(_) => panic!("call to a missing node"),
        }
    });
}

#[logfn]
#[rstest]
#[case(true)]
#[case(false)]
fn test_timeout_and_cancel(runner: TestRunner, #[case] timeout: bool) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "cancel").await;
        let call = client.call(server.node(SLOW), Bytes::from_static(b"late")).await.expect("call");
        if timeout {
            call.timeout(Duration::from_millis(50));
            assert_eq!(call.result().await, Err(InvokeError::Timeout));
        } else {
            assert!(call.cancel());
            assert_eq!(call.result().await, Err(InvokeError::Canceled));
        }
        assert_eq!(call.finished().await, OpState::Canceled);
        assert!(!call.cancel());

        // the late reply does not leak into the next call
        tokio::time::sleep(SLOW_DELAY).await;
        let call = client.call(server.node(ECHO), Bytes::from_static(b"next")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"next"));
    });
}

#[logfn]
#[rstest]
fn test_default_call_timeout(runner: TestRunner) {
    runner.block_on(async move {
        let server = server(None, config(false, "timeout-server", true)).await;
        let mut config = config(false, "timeout-client", true);
        config.call_timeout = Duration::from_millis(50);
        let client = Fabric::builder(config).build().await.expect("build");
        client.connect_to_instance(server.control_address()).await.expect("connect");
        let call = client.call(server.node(SLOW), Bytes::new()).await.expect("call");
        assert_eq!(call.result().await, Err(InvokeError::Timeout));
        let call = client.call(server.node(ECHO), Bytes::from_static(b"fast")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"fast"));
    });
}

#[derive(Serialize, Deserialize, Debug)]
struct AddReq {
    a: u64,
    b: u64,
}

#[logfn]
#[rstest]
fn test_call_typed(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "typed").await;
        let adder = typed::<Codec, AddReq, u64, _>(|_node, req: AddReq| Ok(req.a + req.b));
        server.host_node(server.node(10), adder).await.expect("host");
        let sum: u64 = client.call_typed::<Codec, _, _>(server.node(10), &AddReq { a: 1, b: 2 }).await.expect("call");
        assert_eq!(sum, 3);

        // a payload the node cannot decode
        let call = client.call(server.node(10), Bytes::from_static(b"\xc1")).await.expect("call");
        match call.result().await {
            Err(InvokeError::Remote(e)) => assert_eq!(e.code, RemoteError::MALFORMED),
            other => panic!("unexpected {:?}", other),
        }
    });
}

#[logfn]
#[rstest]
fn test_local_node(runner: TestRunner) {
    runner.block_on(async move {
        let fabric = server(None, config(false, "local", true)).await;
        let call = fabric.call(fabric.node(ECHO), Bytes::from_static(b"self")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"self"));

        let late = fabric.node(20);
        fabric.host_node(late, |req: NodeRequest| echo(req)).await.expect("host");
        let call = fabric.call(late, Bytes::from_static(b"late")).await.expect("call");
        assert_eq!(call.result().await.expect("result"), Bytes::from_static(b"late"));

        let foreign = occams_fabric::NodeId::new(occams_fabric::InstanceId::random(), 1);
        assert!(matches!(fabric.host_node(foreign, echo).await, Err(FabricError::NoSuchInstance(_))));
    });
}
