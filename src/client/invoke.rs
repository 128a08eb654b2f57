//! Issuing invocations and driving them to completion.
//!
//! Each call gets a driver task that owns the pooled connection from acquisition until
//! it is recycled or closed. The caller only ever touches the [AsyncOperation]: waiting
//! on its outcome, or canceling it, which wakes the driver to release the connection.

use super::operation::{AsyncOperation, OpState};
use super::pool::{Connection, ConnectionPool};
use bytes::Bytes;
use occams_fabric_core::Message;
use occams_fabric_core::envelope::delimiter;
use occams_fabric_core::error::{InvokeError, ProtoError};
use occams_fabric_core::proto::{RemoteError, RequestHeader, ResponseHeader, ResponseKind};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Receives one asynchronous response part.
pub type Callback = Box<dyn FnOnce(Result<Bytes, InvokeError>) + Send>;

pub struct Invoker<P: ConnectionPool> {
    pool: Arc<P>,
    rt: Handle,
    timeout: Duration,
}

impl<P: ConnectionPool> Invoker<P> {
    pub fn new(pool: Arc<P>, rt: Handle) -> Self {
        Self { pool, rt, timeout: Duration::from_secs(0) }
    }

    /// Time out every call after `timeout`, zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    /// Send `payload` to the node bound at `address`.
    ///
    /// The request announces `callbacks.len()` asynchronous parts; callback N receives
    /// response part N, every callback is called exactly once, with an error if the
    /// call fails before its part arrived.
    pub fn invoke(&self, address: &str, payload: Bytes, callbacks: Vec<Callback>) -> Call {
        let op = Arc::new(AsyncOperation::new());
        let header = RequestHeader { additional_parts: callbacks.len() as u32 };
        let request = vec![delimiter(), header.encode(), payload];
        let driver = Driver {
            op: op.clone(),
            pool: self.pool.clone(),
            address: address.to_string(),
            outstanding: callbacks.len(),
            callbacks: callbacks.into_iter().map(Some).collect(),
        };
        self.rt.spawn(driver.run(request));
        let call = Call { op, rt: self.rt.clone() };
        if !self.timeout.is_zero() {
            call.timeout(self.timeout);
        }
        call
    }
}

/// The caller's side of an invocation.
pub struct Call {
    op: Arc<AsyncOperation>,
    rt: Handle,
}

impl Call {
    /// The synchronous outcome, part 0 of the response.
    pub async fn result(&self) -> Result<Bytes, InvokeError> {
        self.op.wait().await
    }

    /// False when the call had already completed.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.op.cancel()
    }

    /// Cancel with [InvokeError::Timeout] unless the call completes within `after`.
    pub fn timeout(&self, after: Duration) {
        let op = self.op.clone();
        self.rt.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                // settled in time, nothing to cancel
                _ = op.finished() => return,
            }
            if op.cancel_with(InvokeError::Timeout) {
                debug!("invocation timed out after {:?}", after);
            }
        });
    }

    #[inline]
    pub fn state(&self) -> OpState {
        self.op.state()
    }

    /// Wait until every part arrived or the call was canceled.
    pub async fn finished(&self) -> OpState {
        self.op.finished().await
    }

    #[inline]
    pub fn operation(&self) -> &Arc<AsyncOperation> {
        &self.op
    }
}

struct Driver<P: ConnectionPool> {
    op: Arc<AsyncOperation>,
    pool: Arc<P>,
    address: String,
    callbacks: Vec<Option<Callback>>,
    outstanding: usize,
}

impl<P: ConnectionPool> Driver<P> {
    async fn run(mut self, request: Message) {
        let mut conn = match self.pool.acquire(&self.address).await {
            Ok(conn) => conn,
            Err(e) => {
                let e = InvokeError::from(e);
                debug!("acquire connection to {}: {}", self.address, e);
                self.drain(&e);
                if self.op.transition(OpState::ConnectionPending, OpState::Finished, Some(e.clone()), None) {
                    self.op.deliver(Err(e));
                }
                return;
            }
        };
        if !self.op.transition(OpState::ConnectionPending, OpState::ConnectionAcquired, None, Some(conn.token())) {
            // canceled while connecting, the connection was never used
            self.pool.recycle(conn);
            let e = self.op.snapshot().error.clone().unwrap_or(InvokeError::Canceled);
            return self.drain(&e);
        }
        if let Err(e) = conn.send(request) {
            return self.fail(conn, e);
        }
        let mut synced = false;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.op.cancel_requested() => None,
                r = conn.recv() => Some(r),
            };
            let msg = match received {
                None => return self.abort(conn),
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return self.fail(conn, e),
            };
            let (header, payload) = match parse_response(msg) {
                Ok(r) => r,
                Err(e) => return self.fail(conn, InvokeError::Protocol(e.to_string())),
            };
            let outcome = match header.kind {
                ResponseKind::Result => Ok(payload),
                ResponseKind::Error => Err(InvokeError::Remote(RemoteError::decode(&payload))),
            };
            if header.part == 0 {
                if synced {
                    warn!("duplicate synchronous response from {}, ignored", self.address);
                    continue;
                }
                synced = true;
                let error = outcome.as_ref().err().cloned();
                if !self.op.transition(OpState::ConnectionAcquired, OpState::FinishPending, error.clone(), None) {
                    return self.abort(conn);
                }
                self.op.deliver(outcome);
                if let Some(e) = error {
                    // late parts must not reach a recycled connection
                    self.pool.close(conn);
                    self.drain(&e);
                    return self.settle(None);
                }
            } else {
                let Some(callback) = self.callbacks.get_mut(header.part as usize - 1).and_then(Option::take) else {
                    warn!("unexpected response part {} from {}, ignored", header.part, self.address);
                    continue;
                };
                self.outstanding -= 1;
                fire(callback, outcome);
            }
            if synced && self.outstanding == 0 {
                if self.op.transition(OpState::FinishPending, OpState::Finished, None, None) {
                    self.pool.recycle(conn);
                } else {
                    self.pool.close(conn);
                    self.settle(None);
                }
                return;
            }
        }
    }

    /// The connection broke or spoke garbage.
    fn fail(mut self, conn: P::Conn, e: InvokeError) {
        debug!("invocation on {} failed: {}", self.address, e);
        self.pool.close(conn);
        self.drain(&e);
        if self.op.transition(OpState::ConnectionAcquired, OpState::FinishPending, Some(e.clone()), None) {
            self.op.deliver(Err(e));
            self.settle(None);
        } else {
            self.settle(Some(e));
        }
    }

    /// Canceled while holding the connection.
    fn abort(mut self, conn: P::Conn) {
        self.pool.close(conn);
        let e = self.op.snapshot().error.clone().unwrap_or(InvokeError::Canceled);
        self.drain(&e);
        self.settle(None);
    }

    /// The terminal transition once the connection is released: `Finished`, or
    /// `Canceled` when a cancel got in after part 0.
    fn settle(&self, error: Option<InvokeError>) {
        if !self.op.transition(OpState::FinishPending, OpState::Finished, error, None) {
            self.op.transition(OpState::CancellationPending, OpState::Canceled, None, None);
        }
    }

    /// Callbacks still waiting get `e`, before the final transition.
    fn drain(&mut self, e: &InvokeError) {
        for callback in self.callbacks.iter_mut().filter_map(Option::take) {
            fire(callback, Err(e.clone()));
        }
        self.outstanding = 0;
    }
}

fn fire(callback: Callback, outcome: Result<Bytes, InvokeError>) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        error!("invocation callback panicked");
    }
}

/// `[delimiter][ResponseHeader][payload]`, the delimiter being optional.
fn parse_response(mut msg: Message) -> Result<(ResponseHeader, Bytes), ProtoError> {
    if msg.first().is_some_and(|f| f.is_empty()) {
        msg.remove(0);
    }
    if msg.len() != 2 {
        return Err(ProtoError::Malformed(format!("response of {} frames", msg.len())));
    }
    let payload = msg.pop().unwrap_or_default();
    let header = ResponseHeader::decode(&msg[0])?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use occams_fabric_core::PeerToken;
    use occams_fabric_core::error::{FabricError, TransportError};
    use rstest::*;
    use std::sync::{Mutex, OnceLock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct MockConn {
        token: PeerToken,
        requests: mpsc::UnboundedSender<Message>,
        responses: mpsc::UnboundedReceiver<Message>,
    }

    impl Connection for MockConn {
        fn token(&self) -> PeerToken {
            self.token
        }

        fn send(&mut self, msg: Message) -> Result<(), InvokeError> {
            self.requests.send(msg).map_err(|_| InvokeError::Connection("mock closed".to_string()))
        }

        async fn recv(&mut self) -> Result<Message, InvokeError> {
            self.responses.recv().await.ok_or_else(|| InvokeError::Connection("mock closed".to_string()))
        }
    }

    #[derive(Default)]
    struct MockPool {
        conn: Mutex<Option<MockConn>>,
        recycled: AtomicUsize,
        closed: AtomicUsize,
    }

    impl MockPool {
        fn released(&self) -> (usize, usize) {
            (self.recycled.load(Ordering::SeqCst), self.closed.load(Ordering::SeqCst))
        }
    }

    impl ConnectionPool for MockPool {
        type Conn = MockConn;

        async fn acquire(&self, address: &str) -> Result<MockConn, FabricError> {
            let conn = self.conn.lock().expect("lock").take();
            conn.ok_or_else(|| TransportError::ConnectionRefused(address.to_string()).into())
        }

        fn recycle(&self, _conn: MockConn) {
            self.recycled.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self, _conn: MockConn) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Peer {
        requests: mpsc::UnboundedReceiver<Message>,
        responses: mpsc::UnboundedSender<Message>,
    }

    impl Peer {
        fn respond(&self, header: ResponseHeader, payload: &'static [u8]) {
            let _ = self.responses.send(vec![delimiter(), header.encode(), Bytes::from_static(payload)]);
        }
    }

    fn setup() -> (Invoker<MockPool>, Peer) {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let pool = MockPool::default();
        *pool.conn.lock().expect("lock") =
            Some(MockConn { token: PeerToken::random(), requests: req_tx, responses: resp_rx });
        (Invoker::new(Arc::new(pool), Handle::current()), Peer { requests: req_rx, responses: resp_tx })
    }

    fn recording(log: &Arc<Mutex<Vec<(usize, Result<Bytes, InvokeError>)>>>, n: usize) -> Vec<Callback> {
        (1..=n)
            .map(|i| {
                let log = log.clone();
                let cb: Callback = Box::new(move |r| log.lock().expect("lock").push((i, r)));
                cb
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sync_then_async_parts() {
        let (invoker, mut peer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = invoker.invoke("inproc://node", Bytes::from_static(b"ping"), recording(&log, 2));
        let req = peer.requests.recv().await.expect("request");
        assert_eq!(req[0], delimiter());
        assert_eq!(RequestHeader::decode(&req[1]).expect("header").additional_parts, 2);
        assert_eq!(req[2], Bytes::from_static(b"ping"));

        peer.respond(ResponseHeader::result(0), b"pong");
        assert_eq!(call.result().await, Ok(Bytes::from_static(b"pong")));
        assert_eq!(call.state(), OpState::FinishPending);
        peer.respond(ResponseHeader::result(1), b"one");
        peer.respond(ResponseHeader::result(2), b"two");
        assert_eq!(call.finished().await, OpState::Finished);
        let log = log.lock().expect("lock").clone();
        assert_eq!(
            log,
            vec![(1, Ok(Bytes::from_static(b"one"))), (2, Ok(Bytes::from_static(b"two")))]
        );
        // recycled right after the final transition
        for _ in 0..100 {
            if invoker.pool().released() != (0, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(invoker.pool().released(), (1, 0));
    }

    #[tokio::test]
    async fn test_remote_error_closes_connection() {
        let (invoker, mut peer) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = invoker.invoke("inproc://node", Bytes::new(), recording(&log, 1));
        let _ = peer.requests.recv().await;
        let err = RemoteError::new(RemoteError::GENERIC, "boom");
        let _ = peer.responses.send(vec![delimiter(), ResponseHeader::error(0).encode(), err.encode()]);
        assert_eq!(call.result().await, Err(InvokeError::Remote(err.clone())));
        assert_eq!(call.finished().await, OpState::Finished);
        let log = log.lock().expect("lock").clone();
        assert_eq!(log, vec![(1, Err(InvokeError::Remote(err)))]);
        assert_eq!(invoker.pool().released(), (0, 1));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn test_timeout_and_cancel(#[case] timeout: bool) {
        let (invoker, mut peer) = setup();
        let call = invoker.invoke("inproc://node", Bytes::new(), Vec::new());
        let _ = peer.requests.recv().await;
        let expect = if timeout {
            call.timeout(Duration::from_millis(20));
            InvokeError::Timeout
        } else {
            assert!(call.cancel());
            InvokeError::Canceled
        };
        assert_eq!(call.result().await, Err(expect));
        assert_eq!(call.finished().await, OpState::Canceled);
        // the late response is never seen
        peer.respond(ResponseHeader::result(0), b"late");
        assert!(!call.cancel());
        assert_eq!(invoker.pool().released(), (0, 1));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    #[tokio::test]
    async fn test_cancel_from_callback_while_settling(#[case] remote_error: bool) {
        let (invoker, mut peer) = setup();
        let slot: Arc<OnceLock<Arc<AsyncOperation>>> = Arc::new(OnceLock::new());
        let canceled = Arc::new(AtomicUsize::new(0));
        let callback: Callback = {
            let (slot, canceled) = (slot.clone(), canceled.clone());
            Box::new(move |_| {
                if slot.get().is_some_and(|op| op.cancel()) {
                    canceled.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let call = invoker.invoke("inproc://node", Bytes::new(), vec![callback]);
        let _ = slot.set(call.operation().clone());
        let _ = peer.requests.recv().await;
        if remote_error {
            peer.respond(ResponseHeader::error(0), b"");
        } else {
            let _ = peer.responses.send(vec![delimiter(), Bytes::from_static(b"??")]);
        }
        let state = tokio::time::timeout(Duration::from_secs(1), call.finished()).await.expect("settled");
        assert_eq!(state, OpState::Canceled);
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
        assert_eq!(invoker.pool().released(), (0, 1));
        if remote_error {
            // part 0 was in first, it stays the outcome
            assert!(matches!(call.result().await, Err(InvokeError::Remote(_))));
        } else {
            assert_eq!(call.result().await, Err(InvokeError::Canceled));
        }
    }

    #[tokio::test]
    async fn test_timer_exits_once_settled() {
        let (invoker, mut peer) = setup();
        let invoker = invoker.with_timeout(Duration::from_secs(60));
        let call = invoker.invoke("inproc://node", Bytes::new(), Vec::new());
        let _ = peer.requests.recv().await;
        peer.respond(ResponseHeader::result(0), b"ok");
        assert_eq!(call.finished().await, OpState::Finished);
        // neither the driver nor the timer holds the operation any longer
        for _ in 0..100 {
            if Arc::strong_count(call.operation()) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(Arc::strong_count(call.operation()), 1);
        assert_eq!(call.state(), OpState::Finished);
    }

    #[tokio::test]
    async fn test_acquire_failure_is_sync_error() {
        let pool = MockPool::default();
        let invoker = Invoker::new(Arc::new(pool), Handle::current()).with_timeout(Duration::from_secs(5));
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = invoker.invoke("inproc://nowhere", Bytes::new(), recording(&log, 1));
        assert!(matches!(call.result().await, Err(InvokeError::Connection(_))));
        assert_eq!(call.finished().await, OpState::Finished);
        assert_eq!(log.lock().expect("lock").len(), 1);
        assert_eq!(invoker.pool().released(), (0, 0));
    }

    #[tokio::test]
    async fn test_garbage_response_fails_call() {
        let (invoker, mut peer) = setup();
        let call = invoker.invoke("inproc://node", Bytes::new(), Vec::new());
        let _ = peer.requests.recv().await;
        let _ = peer.responses.send(vec![delimiter(), Bytes::from_static(b"??")]);
        assert!(matches!(call.result().await, Err(InvokeError::Protocol(_))));
        assert_eq!(invoker.pool().released(), (0, 1));
    }
}
