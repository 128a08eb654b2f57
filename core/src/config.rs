use std::time::Duration;

/// Config of the connection reactor
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Upper bound of one blocking poll, so the loop observes shutdown and commands
    pub poll_timeout: Duration,
    /// When true, every routing command is answered with an ack on the control channel,
    /// and `submit()` waits for it.
    pub ack_routing_commands: bool,
    /// How long `submit()` waits for an ack
    pub ack_timeout: Duration,
    /// Interval of the maintenance tick (backend health checks)
    pub maintenance_interval: Duration,
    /// A backend with no inproc channel and no traffic for this long is closed.
    /// Zero disables idle reaping.
    pub backend_idle_timeout: Duration,
    /// Consecutive send failures after which a backend is closed. Zero disables it.
    pub backend_max_send_failures: u32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            ack_routing_commands: true,
            ack_timeout: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(1),
            backend_idle_timeout: Duration::from_secs(120),
            backend_max_send_failures: 16,
        }
    }
}

/// Config of the TCP transport
#[derive(Clone, Debug)]
pub struct TcpConfig {
    /// Delay between connect attempts of a dealer
    pub reconnect_interval: Duration,
    /// Give up connecting after this many attempts, zero means retry forever
    pub connect_attempts: u32,
    pub max_frames: u32,
    /// In bytes, the sum of all frames of one message
    pub max_message_size: usize,
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(200),
            connect_attempts: 0,
            max_frames: 64,
            max_message_size: 16 * 1024 * 1024,
            nodelay: true,
        }
    }
}

/// Config of the pooled client connections
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Idle connections kept per backend address
    pub max_idle: usize,
    /// Retry interval when connecting to a channel the reactor has not bound yet
    pub connect_retry: Duration,
    /// Give up connecting to an unbound channel after this long
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 8,
            connect_retry: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// General config of a fabric instance
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Endpoint of the control channel, port 0 picks a free port
    pub control_endpoint: String,
    /// Host node endpoints are bound on, e.g. `tcp://127.0.0.1`.
    /// Node endpoints get a free port each.
    pub bind_prefix: String,
    /// Round trip limit of a control request
    pub control_timeout: Duration,
    /// Applied to every call when non-zero
    pub call_timeout: Duration,
    pub reactor: ReactorConfig,
    pub tcp: TcpConfig,
    pub pool: PoolConfig,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            control_endpoint: "tcp://127.0.0.1:0".to_string(),
            bind_prefix: "tcp://127.0.0.1".to_string(),
            control_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(0),
            reactor: ReactorConfig::default(),
            tcp: TcpConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}
