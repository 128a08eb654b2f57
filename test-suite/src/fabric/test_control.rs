use super::*;
use crate::*;
use occams_fabric::{FabricError, InvokeError};
use occams_fabric_core::proto::{CommandType, Preamble, ResponseCode};

#[logfn]
#[rstest]
fn test_instance_status(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "status").await;
        let (instance, nodes) = client.control().get_instance_status(server.control_address()).await.expect("status");
        assert_eq!(instance, server.instance());
        let mut expect: Vec<_> = [ECHO, FAN_OUT, SLOW, FAILING, PANICKING].iter().map(|l| server.node(*l)).collect();
        expect.sort();
        assert_eq!(nodes, expect);
    });
}

#[logfn]
#[rstest]
#[case(99)]
#[case(0)]
fn test_unknown_command(runner: TestRunner, #[case] code: u32) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, &format!("unknown-{}", code)).await;
        let reply = client.control().request(server.control_address(), Preamble(code), Vec::new()).await.expect("reply");
        assert_eq!(reply.code, ResponseCode::UnknownCommand);
        assert!(matches!(reply.into_result(), Err(FabricError::UnknownCommand(c)) if c == code));

        // the control loop keeps serving
        let (instance, _) = client.control().get_instance_status(server.control_address()).await.expect("status");
        assert_eq!(instance, server.instance());
    });
}

#[logfn]
#[rstest]
fn test_malformed_command(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "malformed").await;
        let reply = client
            .control()
            .request(server.control_address(), Preamble::new(CommandType::OpenBindingForNode), vec![Bytes::from_static(b"x")])
            .await
            .expect("reply");
        assert_eq!(reply.code, ResponseCode::Exception);
        match reply.into_result() {
            Err(FabricError::Remote(e)) => assert_eq!(e.code, RemoteError::MALFORMED),
            other => panic!("unexpected {:?}", other),
        }
    });
}

#[logfn]
#[rstest]
#[case(0)]
#[case(3)]
fn test_forward(runner: TestRunner, #[case] parts: u32) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, &format!("forward-{}", parts)).await;
        let results = client.forward(server.node(FAN_OUT), Bytes::from_static(b"fwd"), parts).await.expect("forward");
        assert_eq!(results.len(), parts as usize + 1);
        assert_eq!(results[0], Ok(Bytes::from_static(b"fwd")));
        for part in 1..=parts {
            assert_eq!(results[part as usize], Ok(Bytes::from(format!("part-{}", part))));
        }
        // no route was opened
        assert!(client.router().route(server.node(FAN_OUT)).await.expect("query").is_none());

        let results = client.forward(server.node(FAILING), Bytes::new(), 0).await.expect("forward");
        assert!(matches!(&results[0], Err(InvokeError::Remote(e)) if e.code == RemoteError::GENERIC));

        let missing = server.node(42);
        assert!(matches!(
            client.forward(missing, Bytes::new(), 0).await,
            Err(FabricError::NoSuchNode(n)) if n == missing
        ));
    });
}

#[logfn]
#[rstest]
fn test_control_timeout(runner: TestRunner) {
    runner.block_on(async move {
        let (server, client) = pair(false, true, "control-timeout").await;
        let address = server.control_address().to_string();
        server.shutdown().await;
        drop(server);
        match client.control().get_instance_status(&address).await {
            Err(FabricError::Timeout) | Err(FabricError::Transport(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    });
}
