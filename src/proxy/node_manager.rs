//! Node selection over a probed subscription.
//!
//! Every node is probed, latencies are written back onto the subscription,
//! and the lowest reachable latency wins. Ties go to the node that appears
//! first in the subscription, so callers that re-order nodes can get a
//! different pick for an otherwise identical set.

use futures_util::StreamExt;

use super::error::{ProxyError, Result};
use super::health::{LatencyProbe, TcpProbe};
use super::node::{Node, Subscription};

/// Default number of probes in flight at once.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 8;

/// Probes nodes and picks the fastest reachable one.
pub struct NodeManager<P = TcpProbe> {
    probe: P,
    concurrency: usize,
}

impl NodeManager<TcpProbe> {
    /// Manager using the TCP connect prober.
    pub fn new() -> Self {
        Self::with_probe(TcpProbe::default())
    }
}

impl Default for NodeManager<TcpProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: LatencyProbe> NodeManager<P> {
    pub fn with_probe(probe: P) -> Self {
        Self {
            probe,
            concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }

    /// Bound on concurrent probes. `1` probes strictly one after another.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Probe every node, recording `latency_ms` in place.
    ///
    /// Results are merged back in input order regardless of which probe
    /// finishes first.
    pub async fn probe_all(&self, nodes: &mut [Node]) {
        let probe = &self.probe;
        let probed: Vec<Node> = futures_util::stream::iter(nodes.iter().cloned())
            .map(|mut node| async move {
                probe.probe(&mut node).await;
                node
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        for (node, result) in nodes.iter_mut().zip(probed) {
            node.latency_ms = result.latency_ms;
        }
    }

    /// Probe the subscription and return the best node.
    ///
    /// # Errors
    /// `NoReachableNode` when the subscription is empty or every probe failed.
    pub async fn select_best(&self, subscription: &mut Subscription) -> Result<Node> {
        if subscription.is_empty() {
            return Err(ProxyError::NoReachableNode { total: 0 });
        }

        tracing::info!(
            "probing {} nodes from {}",
            subscription.len(),
            subscription.source
        );
        self.probe_all(&mut subscription.nodes).await;

        let best = pick_fastest(&subscription.nodes).cloned().ok_or(
            ProxyError::NoReachableNode {
                total: subscription.len(),
            },
        )?;
        tracing::info!(
            "selected node '{}' ({}:{}, {}ms)",
            best.name,
            best.server,
            best.port,
            best.latency_ms.unwrap_or_default()
        );
        Ok(best)
    }
}

/// First node holding the minimum non-negative latency.
///
/// Unprobed and unreachable nodes are ignored.
pub fn pick_fastest(nodes: &[Node]) -> Option<&Node> {
    let mut best: Option<(&Node, i64)> = None;
    for node in nodes {
        let Some(ms) = node.reachable_latency() else {
            continue;
        };
        if best.map_or(true, |(_, min)| ms < min) {
            best = Some((node, ms));
        }
    }
    best.map(|(node, _)| node)
}
