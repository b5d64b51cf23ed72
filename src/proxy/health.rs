//! Latency prober for proxy nodes.
//!
//! Measures reachability by opening a TCP connection to the node's
//! `server:port` and releasing it immediately. No payload is exchanged, so
//! the number reflects route plus handshake latency, not throughput.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::node::{Node, UNREACHABLE};

/// Dial timeout per node.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can measure how long it takes to reach an endpoint.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Round-trip time to `server:port`, or `None` when unreachable.
    async fn measure(&self, server: &str, port: u16) -> Option<Duration>;

    /// Probe a node and record the outcome in `latency_ms`.
    ///
    /// Never fails: an unreachable node gets the `-1` sentinel.
    async fn probe(&self, node: &mut Node) {
        node.latency_ms = Some(match self.measure(&node.server, node.port).await {
            Some(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            None => UNREACHABLE,
        });
    }
}

/// TCP connect prober with a fixed timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

#[async_trait]
impl LatencyProbe for TcpProbe {
    async fn measure(&self, server: &str, port: u16) -> Option<Duration> {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((server, port)))
            .await
        {
            Ok(Ok(stream)) => {
                let elapsed = start.elapsed();
                drop(stream);
                Some(elapsed)
            }
            Ok(Err(e)) => {
                tracing::debug!("probe {server}:{port} failed: {e}");
                None
            }
            Err(_) => {
                tracing::debug!("probe {server}:{port} timed out after {:?}", self.timeout);
                None
            }
        }
    }
}
