//! Network transport used by the server binary

pub mod codec;
pub mod proxy;
pub mod tcp;

pub use proxy::{BroadcastProxy, ProxyConfig};
pub use tcp::{TcpTransport, TcpTransportConfig, tcp_transport};
