//! Channel tables: pure routing state, mutated only on the reactor thread.
//!
//! [BackendTable] maps a remote address to one physical connection, and every backend
//! owns an [InprocTable] mapping peer tokens to the local channels multiplexed over it.

use crate::reactor::{Handler, Io};
use crate::transport::{Socket, SocketHandle};
use occams_fabric_core::PeerToken;
use occams_fabric_core::config::ReactorConfig;
use occams_fabric_core::error::{ChannelError, TransportError};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Logical endpoint → local channel.
#[derive(Default, Debug)]
pub struct InprocTable {
    by_token: HashMap<PeerToken, SocketHandle>,
    by_handle: HashMap<SocketHandle, PeerToken>,
}

impl InprocTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the channel of `token`, creating it with `connector` on first use.
    pub fn open<S, F>(&mut self, io: &mut Io<S>, token: PeerToken, connector: F) -> Result<SocketHandle, TransportError>
    where
        F: FnOnce(&mut Io<S>, &PeerToken) -> Result<(Socket, Handler<S>), TransportError>,
    {
        if let Some(handle) = self.by_token.get(&token) {
            return Ok(*handle);
        }
        let (socket, handler) = connector(io, &token)?;
        let handle = io.register(socket, handler);
        self.by_token.insert(token, handle);
        self.by_handle.insert(handle, token);
        Ok(handle)
    }

    /// Unknown tokens are a no-op, `Ok(false)`.
    pub fn close<S>(&mut self, io: &mut Io<S>, token: &PeerToken) -> Result<bool, TransportError> {
        let Some(handle) = self.by_token.remove(token) else {
            return Ok(false);
        };
        self.by_handle.remove(&handle);
        io.close(handle)?;
        Ok(true)
    }

    /// Unknown handles are a no-op, `Ok(false)`.
    pub fn close_handle<S>(&mut self, io: &mut Io<S>, handle: SocketHandle) -> Result<bool, TransportError> {
        let Some(token) = self.by_handle.remove(&handle) else {
            return Ok(false);
        };
        self.by_token.remove(&token);
        io.close(handle)?;
        Ok(true)
    }

    /// Close every channel, collecting failures instead of stopping at the first one.
    pub fn close_all<S>(&mut self, io: &mut Io<S>) -> Vec<(PeerToken, TransportError)> {
        let mut failures = Vec::new();
        self.by_handle.clear();
        for (token, handle) in self.by_token.drain() {
            if let Err(e) = io.close(handle) {
                failures.push((token, e));
            }
        }
        failures
    }

    #[inline]
    pub fn get(&self, token: &PeerToken) -> Option<SocketHandle> {
        self.by_token.get(token).copied()
    }

    #[inline]
    pub fn token_of(&self, handle: SocketHandle) -> Option<PeerToken> {
        self.by_handle.get(&handle).copied()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &PeerToken> {
        self.by_token.keys()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// No traffic and no channel for longer than the idle timeout
    Idle,
    /// Too many consecutive send failures
    Failing,
}

/// Activity tracker of one backend connection.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    opened_at: Instant,
    last_activity: Instant,
    send_failures: u32,
    sent: u64,
    received: u64,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { opened_at: now, last_activity: now, send_failures: 0, sent: 0, received: 0 }
    }

    #[inline]
    pub fn record_inbound(&mut self) {
        self.received += 1;
        self.last_activity = Instant::now();
    }

    #[inline]
    pub fn record_outbound(&mut self) {
        self.sent += 1;
        self.send_failures = 0;
        self.last_activity = Instant::now();
    }

    #[inline]
    pub fn record_failure(&mut self) {
        self.send_failures += 1;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened_at)
    }

    #[inline]
    pub fn counters(&self) -> (u64, u64) {
        (self.sent, self.received)
    }

    pub fn verdict(&self, now: Instant, config: &ReactorConfig, open_channels: usize) -> Health {
        if config.backend_max_send_failures > 0 && self.send_failures >= config.backend_max_send_failures {
            return Health::Failing;
        }
        if !config.backend_idle_timeout.is_zero()
            && open_channels == 0
            && self.idle_for(now) >= config.backend_idle_timeout
        {
            return Health::Idle;
        }
        Health::Healthy
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical connection to a remote address.
#[derive(Debug)]
pub struct BackendChannel {
    pub address: String,
    pub handle: SocketHandle,
    pub inproc: InprocTable,
    pub monitor: HealthMonitor,
}

/// Remote address → backend connection.
#[derive(Default, Debug)]
pub struct BackendTable {
    by_address: HashMap<String, BackendChannel>,
    by_handle: HashMap<SocketHandle, String>,
}

impl BackendTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the backend of `address`, connecting it with `connector` on first use.
    pub fn open<S, F>(&mut self, io: &mut Io<S>, address: &str, connector: F) -> Result<SocketHandle, TransportError>
    where
        F: FnOnce(&mut Io<S>, &str) -> Result<(Socket, Handler<S>), TransportError>,
    {
        if let Some(backend) = self.by_address.get(address) {
            return Ok(backend.handle);
        }
        let (socket, handler) = connector(io, address)?;
        let handle = io.register(socket, handler);
        self.by_address.insert(
            address.to_string(),
            BackendChannel {
                address: address.to_string(),
                handle,
                inproc: InprocTable::new(),
                monitor: HealthMonitor::new(),
            },
        );
        self.by_handle.insert(handle, address.to_string());
        Ok(handle)
    }

    /// Close the backend of `address` and every inproc channel under it.
    ///
    /// Unknown addresses are a no-op, `Ok(false)`.
    pub fn close<S>(&mut self, io: &mut Io<S>, address: &str) -> Result<bool, ChannelError> {
        let Some(mut backend) = self.by_address.remove(address) else {
            return Ok(false);
        };
        self.by_handle.remove(&backend.handle);
        let failures = Self::close_channel(io, &mut backend);
        if failures.is_empty() { Ok(true) } else { Err(ChannelError::Close(failures)) }
    }

    fn close_channel<S>(io: &mut Io<S>, backend: &mut BackendChannel) -> Vec<(String, TransportError)> {
        let mut failures: Vec<(String, TransportError)> = backend
            .inproc
            .close_all(io)
            .into_iter()
            .map(|(token, e)| (format!("{}#{}", backend.address, token), e))
            .collect();
        if let Err(e) = io.close(backend.handle) {
            failures.push((backend.address.clone(), e));
        }
        failures
    }

    /// Close every backend, reporting all failures at once.
    pub fn close_all<S>(&mut self, io: &mut Io<S>) -> Result<usize, ChannelError> {
        let mut failures = Vec::new();
        let mut count = 0;
        self.by_handle.clear();
        for (_, mut backend) in self.by_address.drain() {
            count += 1;
            failures.extend(Self::close_channel(io, &mut backend));
        }
        if failures.is_empty() { Ok(count) } else { Err(ChannelError::Close(failures)) }
    }

    #[inline]
    pub fn has_backend_address(&self, address: &str) -> bool {
        self.by_address.contains_key(address)
    }

    #[inline]
    pub fn get(&self, address: &str) -> Option<&BackendChannel> {
        self.by_address.get(address)
    }

    #[inline]
    pub fn get_mut(&mut self, address: &str) -> Option<&mut BackendChannel> {
        self.by_address.get_mut(address)
    }

    #[inline]
    pub fn address_of(&self, handle: SocketHandle) -> Option<&str> {
        self.by_handle.get(&handle).map(|a| a.as_str())
    }

    pub fn get_by_handle_mut(&mut self, handle: SocketHandle) -> Option<&mut BackendChannel> {
        let address = self.by_handle.get(&handle)?;
        self.by_address.get_mut(address)
    }

    pub fn get_inproc_socket(&self, address: &str, token: &PeerToken) -> Option<SocketHandle> {
        self.by_address.get(address).and_then(|b| b.inproc.get(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendChannel> {
        self.by_address.values()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Handler;
    use crate::transport::{Context, SocketKind};
    use captains_log::filter::LogFilter;
    use rstest::*;
    use std::sync::Arc;

    fn pair_at(name: String) -> impl FnOnce(&mut Io<()>, &str) -> Result<(Socket, Handler<()>), TransportError> {
        move |io, _address| {
            let socket = io.create_bound(&name, SocketKind::Pair)?;
            let handler: Handler<()> = Box::new(|_, _, _| {});
            Ok((socket, handler))
        }
    }

    fn inproc_at(
        name: String,
    ) -> impl FnOnce(&mut Io<()>, &PeerToken) -> Result<(Socket, Handler<()>), TransportError> {
        move |io, _token| {
            let socket = io.create_bound(&name, SocketKind::Pair)?;
            let handler: Handler<()> = Box::new(|_, _, _| {});
            Ok((socket, handler))
        }
    }

    #[fixture]
    fn io() -> Io<()> {
        Io::new(Context::new(), Arc::new(LogFilter::new()))
    }

    #[rstest]
    fn test_backend_open_is_idempotent(mut io: Io<()>) {
        let mut table = BackendTable::new();
        let h1 = table.open(&mut io, "tcp://a:1", pair_at("inproc://backend-a".into())).expect("open");
        // second open must not connect again, the connector would fail on the taken name
        let h2 = table.open(&mut io, "tcp://a:1", pair_at("inproc://backend-a".into())).expect("open");
        assert_eq!(h1, h2);
        assert_eq!(table.len(), 1);
        assert_eq!(io.len(), 1);
        assert!(table.has_backend_address("tcp://a:1"));
        assert_eq!(table.address_of(h1), Some("tcp://a:1"));
    }

    #[rstest]
    fn test_close_backend_closes_its_channels(mut io: Io<()>) {
        let mut table = BackendTable::new();
        table.open(&mut io, "tcp://a:1", pair_at("inproc://backend-a".into())).expect("open");
        table.open(&mut io, "tcp://b:2", pair_at("inproc://backend-b".into())).expect("open");
        let t1 = PeerToken::from_name("c1");
        let t2 = PeerToken::from_name("c2");
        let backend = table.get_mut("tcp://a:1").expect("backend");
        let c1 = backend.inproc.open(&mut io, t1, inproc_at("inproc://ch-1".into())).expect("inproc");
        backend.inproc.open(&mut io, t2, inproc_at("inproc://ch-2".into())).expect("inproc");
        assert_eq!(table.get_inproc_socket("tcp://a:1", &t1), Some(c1));
        assert_eq!(io.len(), 4);

        assert!(table.close(&mut io, "tcp://a:1").expect("close"));
        assert_eq!(io.len(), 1);
        assert!(!io.contains(c1));
        assert!(table.get_inproc_socket("tcp://a:1", &t1).is_none());
        assert!(!table.close(&mut io, "tcp://a:1").expect("close again"));

        // names are released with their sockets
        io.create_bound("inproc://ch-1", SocketKind::Pair).expect("rebind");
        assert_eq!(table.close_all(&mut io).expect("close all"), 1);
        assert!(table.is_empty());
    }

    #[rstest]
    fn test_inproc_close_unknown(mut io: Io<()>) {
        let mut table = InprocTable::new();
        let t = PeerToken::random();
        assert!(!table.close(&mut io, &t).expect("close"));
        let h = table.open(&mut io, t, inproc_at("inproc://x".into())).expect("open");
        assert_eq!(table.token_of(h), Some(t));
        assert!(table.close_handle(&mut io, h).expect("close"));
        assert!(!table.close_handle(&mut io, h).expect("close"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_health_verdict() {
        let config = ReactorConfig {
            backend_idle_timeout: Duration::from_secs(10),
            backend_max_send_failures: 2,
            ..Default::default()
        };
        let mut m = HealthMonitor::new();
        let later = Instant::now() + Duration::from_secs(11);
        assert_eq!(m.verdict(Instant::now(), &config, 0), Health::Healthy);
        assert_eq!(m.verdict(later, &config, 0), Health::Idle);
        // open channels keep an idle backend alive
        assert_eq!(m.verdict(later, &config, 1), Health::Healthy);

        m.record_failure();
        m.record_outbound();
        m.record_failure();
        assert_eq!(m.verdict(Instant::now(), &config, 1), Health::Healthy);
        m.record_failure();
        assert_eq!(m.verdict(Instant::now(), &config, 1), Health::Failing);
        assert_eq!(m.counters(), (1, 0));
    }
}
