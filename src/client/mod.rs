//! The calling side: invocations, pooled connections and control requests.

pub mod control;
pub mod invoke;
pub mod operation;
pub mod pool;

pub use control::{ControlClient, ControlReply};
pub use invoke::{Call, Callback, Invoker};
pub use operation::{AsyncOperation, OpSnapshot, OpState};
pub use pool::{ChannelConnection, ChannelPool, Connection, ConnectionPool};
