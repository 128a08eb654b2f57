use crate::transport::{Event, SocketHandle};
use crossfire::{MTx, Rx, mpsc};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Readiness source of the reactor.
///
/// Every socket registered here delivers into one channel, so a poll is a single
/// bounded wait. Events of sockets unregistered in the meantime are discarded.
pub struct Poller {
    tx: MTx<Event>,
    rx: Rx<Event>,
    registered: HashSet<SocketHandle>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_blocking::<Event>();
        Self::with_channel(tx, rx)
    }

    /// Poll a channel created beforehand, so senders can exist before the poller.
    pub fn with_channel(tx: MTx<Event>, rx: Rx<Event>) -> Self {
        Self { tx, rx, registered: HashSet::new() }
    }

    /// The channel sockets registered here must deliver into.
    #[inline]
    pub fn sender(&self) -> &MTx<Event> {
        &self.tx
    }

    #[inline]
    pub fn register(&mut self, handle: SocketHandle) {
        self.registered.insert(handle);
    }

    #[inline]
    pub fn unregister(&mut self, handle: SocketHandle) -> bool {
        self.registered.remove(&handle)
    }

    #[inline]
    pub fn is_registered(&self, handle: SocketHandle) -> bool {
        self.registered.contains(&handle)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Wait at most `timeout` for the next event of a registered socket.
    pub fn poll(&mut self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let ev = self.rx.recv_timeout(left).ok()?;
            if ev.handle.is_reserved() || self.registered.contains(&ev.handle) {
                return Some(ev);
            }
            trace!("drop {:?} of unregistered socket", ev);
        }
    }
}
