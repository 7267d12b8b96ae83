//! Local proxy: inbound SOCKS5/HTTP handshakes, routing and relaying.

pub mod inbound;
pub mod metrics;
pub mod relay;
pub mod server;

pub use inbound::{InboundProtocol, InboundRequest, Reply};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use relay::RelayTotals;
pub use server::{FallbackPolicy, ProxyServer, ProxySettings};
