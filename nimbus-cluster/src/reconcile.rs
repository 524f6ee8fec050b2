//! Merging persisted inventory with the provider's live view.

use log::{debug, warn};

use crate::error::ClusterResult;
use crate::node::{Node, NodeState};
use crate::provider::CloudProvider;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Persisted nodes refreshed from a live counterpart
    pub updated: Vec<String>,
    /// Persisted nodes the provider no longer reports
    pub missing: Vec<String>,
}

impl ReconcileReport {
    /// Whether every persisted node was found live
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Replace persisted nodes with their live counterparts, matched by name
///
/// Live nodes without a persisted counterpart are ignored. Persisted
/// nodes with no live counterpart are kept with an unknown state.
pub fn merge_live(nodes: &mut [Node], live: &[Node]) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    for node in nodes.iter_mut() {
        match live.iter().find(|l| l.name == node.name) {
            Some(current) => {
                if current.id != node.id && !node.id.is_empty() {
                    debug!("node {} changed id from {} to {}", node.name, node.id, current.id);
                }
                *node = current.clone();
                report.updated.push(node.name.clone());
            }
            None => {
                warn!(
                    "Node {} (id {}) is no longer reported by the provider; it may have been \
                     terminated outside of nimbus",
                    node.name, node.id
                );
                node.state = NodeState::Unknown;
                report.missing.push(node.name.clone());
            }
        }
    }
    report
}

/// Refreshes an inventory from a provider
pub struct Reconciler<'a> {
    provider: &'a dyn CloudProvider,
}

impl<'a> Reconciler<'a> {
    /// Create a reconciler over `provider`
    pub fn new(provider: &'a dyn CloudProvider) -> Self {
        Reconciler { provider }
    }

    /// Query the provider and merge its view into `nodes`
    pub async fn reconcile(&self, nodes: &mut [Node]) -> ClusterResult<ReconcileReport> {
        let live = self.provider.list_nodes().await?;
        debug!("{} provider reports {} live node(s)", self.provider.name(), live.len());
        Ok(merge_live(nodes, &live))
    }
}
