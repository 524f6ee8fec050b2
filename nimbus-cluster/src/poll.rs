//! Polling until a predicate over the node inventory holds.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::{sleep, timeout_at, Instant};

use crate::error::{ClusterError, ClusterResult};
use crate::node::Node;
use crate::provider::CloudProvider;
use crate::reconcile::{ReconcileReport, Reconciler};

/// An inventory that can be refreshed from its source
#[async_trait]
pub trait Refresh: Send {
    /// Pull the latest state
    async fn refresh(&mut self) -> ClusterResult<()>;

    /// Current view
    fn nodes(&self) -> &[Node];
}

/// A set of nodes refreshed from a provider's live listing
pub struct LiveInventory<'a> {
    reconciler: Reconciler<'a>,
    nodes: Vec<Node>,
    last: ReconcileReport,
}

impl<'a> LiveInventory<'a> {
    /// Track `nodes` through `provider`
    pub fn new(provider: &'a dyn CloudProvider, nodes: Vec<Node>) -> Self {
        LiveInventory { reconciler: Reconciler::new(provider), nodes, last: ReconcileReport::default() }
    }

    /// Report of the most recent refresh
    pub fn last_report(&self) -> &ReconcileReport {
        &self.last
    }

    /// Give the tracked nodes back
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

#[async_trait]
impl Refresh for LiveInventory<'_> {
    async fn refresh(&mut self) -> ClusterResult<()> {
        self.last = self.reconciler.reconcile(&mut self.nodes).await?;
        Ok(())
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Predicate: every node reports a running state
pub fn all_running(nodes: &[Node]) -> ClusterResult<bool> {
    Ok(nodes.iter().all(Node::is_running))
}

/// Refresh, evaluate, sleep; until a predicate holds or a deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Pause between two refreshes
    pub interval: Duration,
    /// Total time allowed
    pub timeout: Duration,
}

impl Poller {
    /// Create a poller
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Poller { interval, timeout }
    }

    /// Wait until `predicate` holds, starting the clock now
    pub async fn wait_until<R, P>(&self, inventory: &mut R, predicate: P) -> ClusterResult<()>
    where
        R: Refresh + ?Sized,
        P: FnMut(&[Node]) -> ClusterResult<bool>,
    {
        self.wait_until_deadline(Instant::now() + self.timeout, inventory, predicate).await
    }

    /// Wait until `predicate` holds or `deadline` passes
    ///
    /// A failed refresh is logged and polling continues. An error from the
    /// predicate aborts the wait. On expiry the caller gets a
    /// `TimeoutError` and must inspect the inventory itself.
    pub async fn wait_until_deadline<R, P>(
        &self,
        deadline: Instant,
        inventory: &mut R,
        mut predicate: P,
    ) -> ClusterResult<()>
    where
        R: Refresh + ?Sized,
        P: FnMut(&[Node]) -> ClusterResult<bool>,
    {
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            match timeout_at(deadline, inventory.refresh()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to refresh node states: {}", e),
                Err(_) => break,
            }

            if predicate(inventory.nodes())? {
                debug!("condition met after {} poll(s)", rounds);
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
        Err(ClusterError::TimeoutError(format!(
            "condition not met within {:?} ({} poll(s))",
            self.timeout, rounds
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;

    struct Scripted {
        nodes: Vec<Node>,
        calls: usize,
        fail_on: Option<usize>,
        running_at: usize,
    }

    #[async_trait]
    impl Refresh for Scripted {
        async fn refresh(&mut self) -> ClusterResult<()> {
            self.calls += 1;
            if Some(self.calls) == self.fail_on {
                return Err(ClusterError::NetworkError("flaky".into()));
            }
            if self.calls >= self.running_at {
                for n in &mut self.nodes {
                    n.state = NodeState::Running;
                }
            }
            Ok(())
        }

        fn nodes(&self) -> &[Node] {
            &self.nodes
        }
    }

    fn scripted(running_at: usize, fail_on: Option<usize>) -> Scripted {
        Scripted { nodes: vec![Node::new("i-1", "c-w001")], calls: 0, fail_on, running_at }
    }

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let poller = Poller::new(Duration::from_secs(60), Duration::from_secs(120));
        let mut inv = scripted(1, None);
        poller.wait_until(&mut inv, all_running).await.unwrap();
        assert_eq!(inv.calls, 1);
    }

    #[tokio::test]
    async fn test_refresh_error_is_not_fatal() {
        let poller = Poller::new(Duration::from_millis(5), Duration::from_secs(5));
        let mut inv = scripted(3, Some(2));
        poller.wait_until(&mut inv, all_running).await.unwrap();
        assert_eq!(inv.calls, 3);
    }

    #[tokio::test]
    async fn test_timeout() {
        let poller = Poller::new(Duration::from_millis(10), Duration::from_millis(35));
        let mut inv = scripted(usize::MAX, None);
        let err = poller.wait_until(&mut inv, all_running).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(inv.calls >= 3);
    }

    #[tokio::test]
    async fn test_predicate_error_aborts() {
        let poller = Poller::new(Duration::from_millis(5), Duration::from_secs(5));
        let mut inv = scripted(usize::MAX, None);
        let err = poller
            .wait_until(&mut inv, |_| Err(ClusterError::NodeNotFound("c-w001".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
        assert_eq!(inv.calls, 1);
    }
}
