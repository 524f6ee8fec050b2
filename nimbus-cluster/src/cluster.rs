//! Cluster controller: drives a cluster through its lifecycle.
//!
//! The controller is the only component that mutates a cluster's node
//! inventory and the only caller of the state store. Every operation that
//! changes the inventory checkpoints it before returning.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::{ClusterOptions, ClusterTemplate, ControllerSettings, LoginConfig, SetupConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::naming::{self, validate_cluster_name, validate_group_name};
use crate::node::Node;
use crate::poll::{all_running, LiveInventory, Poller};
use crate::provider::{CloudProvider, InstanceRequest};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::setup::{plan_setup, SetupProvider};
use crate::ssh::{HostProbe, Ssh2Probe, SshCredentials, SshEndpoint, SshResolver};
use crate::store::{ClusterRecord, StateStore};

/// Lifecycle phase of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPhase {
    /// No nodes
    Empty,
    /// Nodes requested, waiting for them to run
    Provisioning,
    /// Every node reports running
    Steady,
    /// The configuration step succeeded
    Configured,
    /// Provisioning timed out, or some nodes are not running
    Degraded,
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterPhase::Empty => write!(f, "empty"),
            ClusterPhase::Provisioning => write!(f, "provisioning"),
            ClusterPhase::Steady => write!(f, "steady"),
            ClusterPhase::Configured => write!(f, "configured"),
            ClusterPhase::Degraded => write!(f, "degraded"),
        }
    }
}

/// Outcome for one node of a batch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Done
    Ok,
    /// Nothing to do
    Skipped(String),
    /// Attempted and failed
    Failed(String),
}

/// One line of a [`BatchReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// Node the item is about
    pub node: String,
    /// What happened
    pub outcome: ItemOutcome,
}

/// Per-node results of a batch operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Results, in processing order
    pub items: Vec<ItemResult>,
}

impl BatchReport {
    fn push(&mut self, node: &str, outcome: ItemOutcome) {
        self.items.push(ItemResult { node: node.to_string(), outcome });
    }

    fn fail(&mut self, node: &str, reason: impl fmt::Display) {
        self.push(node, ItemOutcome::Failed(reason.to_string()));
    }

    /// Mark an already reported node as failed
    fn downgrade(&mut self, node: &str, reason: impl fmt::Display) {
        if let Some(item) = self.items.iter_mut().find(|i| i.node == node) {
            item.outcome = ItemOutcome::Failed(reason.to_string());
        }
    }

    /// Append another report
    pub fn merge(&mut self, other: BatchReport) {
        self.items.extend(other.items);
    }

    /// Nodes processed successfully
    pub fn succeeded(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, ItemOutcome::Ok))
    }

    /// Nodes that were skipped
    pub fn skipped(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, ItemOutcome::Skipped(_)))
    }

    /// Nodes that failed
    pub fn failed(&self) -> Vec<&str> {
        self.filter(|o| matches!(o, ItemOutcome::Failed(_)))
    }

    /// Whether no item failed
    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    fn filter(&self, pred: impl Fn(&ItemOutcome) -> bool) -> Vec<&str> {
        self.items.iter().filter(|i| pred(&i.outcome)).map(|i| i.node.as_str()).collect()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            match &item.outcome {
                ItemOutcome::Ok => writeln!(f, "  {}: ok", item.node)?,
                ItemOutcome::Skipped(why) => writeln!(f, "  {}: skipped ({})", item.node, why)?,
                ItemOutcome::Failed(why) => writeln!(f, "  {}: FAILED ({})", item.node, why)?,
            }
        }
        Ok(())
    }
}

/// Serializable view of a cluster, for machine-readable listings
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    /// Cluster name
    pub name: String,
    /// Template name
    pub template: String,
    /// Current phase
    pub phase: ClusterPhase,
    /// Default SSH node
    pub ssh_to: Option<String>,
    /// Nodes sorted by name
    pub nodes: Vec<Node>,
}

struct SetupBinding {
    provider: Arc<dyn SetupProvider>,
    config: SetupConfig,
}

/// Drives one cluster through its lifecycle
pub struct ClusterController {
    record: ClusterRecord,
    options: ClusterOptions,
    group_options: BTreeMap<String, BTreeMap<String, String>>,
    provider: Arc<dyn CloudProvider>,
    store: StateStore,
    setup: Option<SetupBinding>,
    login: Option<LoginConfig>,
    settings: ControllerSettings,
    phase: ClusterPhase,
}

impl fmt::Debug for ClusterController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterController")
            .field("name", &self.record.name)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl ClusterController {
    /// Create a new, empty cluster from a template
    pub fn new(
        name: &str,
        template: &ClusterTemplate,
        provider: Arc<dyn CloudProvider>,
        settings: ControllerSettings,
    ) -> ClusterResult<Self> {
        validate_cluster_name(name)?;
        let store = StateStore::new(&settings.storage_path, settings.storage_format)?;
        let mut record = ClusterRecord::new(name, template.name.clone());
        record.options = template.options.to_map();
        Ok(ClusterController {
            record,
            options: template.options.clone(),
            group_options: template.group_options.clone(),
            provider,
            store,
            setup: None,
            login: None,
            settings,
            phase: ClusterPhase::Empty,
        })
    }

    /// Load a persisted cluster and reconcile it with the provider
    ///
    /// Persisted options win over the template's; the template only
    /// contributes group-specific overrides and fills in options for
    /// state files that carry none.
    pub async fn open(
        name: &str,
        template: Option<&ClusterTemplate>,
        provider: Arc<dyn CloudProvider>,
        settings: ControllerSettings,
    ) -> ClusterResult<Self> {
        let store = StateStore::new(&settings.storage_path, settings.storage_format)?;
        let record = store.load(name)?;
        let options = if !record.options.is_empty() {
            ClusterOptions::from_map(record.options.clone())?
        } else if let Some(template) = template {
            template.options.clone()
        } else {
            return Err(ClusterError::ConfigurationError(format!(
                "cluster {} has no stored options and no template to take them from",
                name
            )));
        };

        let mut controller = ClusterController {
            record,
            options,
            group_options: template.map(|t| t.group_options.clone()).unwrap_or_default(),
            provider,
            store,
            setup: None,
            login: None,
            settings,
            phase: ClusterPhase::Empty,
        };
        if let Err(e) = controller.refresh().await {
            warn!("Could not refresh state of cluster {}: {}", name, e);
        }
        controller.phase = controller.observed_phase();
        Ok(controller)
    }

    /// Use `login` for instance creation, SSH and configuration
    pub fn with_login(mut self, login: LoginConfig) -> Self {
        self.login = Some(login);
        self
    }

    /// Use `provider` to configure the cluster
    pub fn with_setup(mut self, provider: Arc<dyn SetupProvider>, config: SetupConfig) -> Self {
        self.setup = Some(SetupBinding { provider, config });
        self
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Template the cluster was created from
    pub fn template(&self) -> &str {
        &self.record.template
    }

    /// Current inventory
    pub fn nodes(&self) -> &[Node] {
        &self.record.nodes
    }

    /// Current phase
    pub fn phase(&self) -> ClusterPhase {
        self.phase
    }

    /// Validated options
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Persisted form of the cluster
    pub fn record(&self) -> &ClusterRecord {
        &self.record
    }

    /// Storage the cluster is persisted in
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Known-hosts file of the cluster
    pub fn known_hosts_path(&self) -> PathBuf {
        self.store.artifact_path(&self.record.name, "known_hosts")
    }

    /// Nodes of `group`, in inventory order
    pub fn group_nodes(&self, group: &str) -> Vec<&Node> {
        self.record
            .nodes
            .iter()
            .filter(|n| naming::group_of(&self.record.name, n).as_deref() == Some(group))
            .collect()
    }

    fn poller(&self) -> Poller {
        Poller::new(self.settings.polling_interval, self.settings.startup_timeout)
    }

    fn observed_phase(&self) -> ClusterPhase {
        if self.record.nodes.is_empty() {
            ClusterPhase::Empty
        } else if self.record.nodes.iter().all(Node::is_running) {
            ClusterPhase::Steady
        } else {
            ClusterPhase::Degraded
        }
    }

    /// Write the current state to storage
    pub fn save(&mut self) -> ClusterResult<()> {
        self.record.options = self.options.to_map();
        self.store.save(&self.record)
    }

    /// Merge the provider's live view into the inventory
    pub async fn refresh(&mut self) -> ClusterResult<ReconcileReport> {
        let report = Reconciler::new(self.provider.as_ref()).reconcile(&mut self.record.nodes).await?;
        if !report.is_clean() {
            warn!(
                "Cluster {}: {} node(s) missing from the provider: {}",
                self.record.name,
                report.missing.len(),
                report.missing.join(", ")
            );
        }
        Ok(report)
    }

    /// Start every group at its desired size and wait for all nodes to run
    ///
    /// If the deadline passes, every node is destroyed and the cluster is
    /// persisted empty, unless each group has at least its
    /// `<group>_nodes_min` nodes running, in which case the running nodes
    /// are kept and the others destroyed.
    pub async fn start(&mut self) -> ClusterResult<BatchReport> {
        let mut report = BatchReport::default();
        self.phase = ClusterPhase::Provisioning;

        let wanted: Vec<(String, u32)> =
            self.options.groups.iter().map(|(g, s)| (g.clone(), s.nodes)).collect();
        for (group, nodes) in wanted {
            let have = self.group_nodes(&group).len() as u32;
            if nodes > have {
                info!("Starting {} {} node(s) for cluster {}", nodes - have, group, self.record.name);
                report.merge(self.add(&group, nodes - have, false).await?);
            }
        }
        self.save()?;

        let provider = Arc::clone(&self.provider);
        let mut inventory = LiveInventory::new(provider.as_ref(), self.record.nodes.clone());
        let outcome = self.poller().wait_until(&mut inventory, all_running).await;
        self.record.nodes = inventory.into_nodes();

        match outcome {
            Ok(()) => {
                self.phase = ClusterPhase::Steady;
                self.save()?;
                info!("Cluster {} started: {} node(s) running", self.record.name, self.record.nodes.len());
                Ok(report)
            }
            Err(e) if e.is_timeout() => {
                self.phase = ClusterPhase::Degraded;
                if self.minimum_running() {
                    let stragglers: Vec<String> =
                        self.record.nodes.iter().filter(|n| !n.is_running()).map(|n| n.name.clone()).collect();
                    warn!(
                        "Not every node of cluster {} is running, but each group reached its minimum; \
                         discarding {} node(s)",
                        self.record.name,
                        stragglers.len()
                    );
                    for name in stragglers {
                        if let Err(err) = self.remove_by_name(&name).await {
                            error!("Could not destroy node {}: {}", name, err);
                        }
                        report.downgrade(&name, "did not reach running state");
                    }
                    self.phase = self.observed_phase();
                    return Ok(report);
                }

                error!("Timeout starting cluster {}, destroying every node", self.record.name);
                let names: Vec<String> = self.record.nodes.iter().map(|n| n.name.clone()).collect();
                for name in names {
                    if let Err(err) = self.remove_by_name(&name).await {
                        error!("Could not destroy node {} during rollback: {}", name, err);
                    }
                }
                self.save()?;
                if self.record.nodes.is_empty() {
                    self.phase = ClusterPhase::Empty;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn minimum_running(&self) -> bool {
        let has_minimum = self.options.groups.values().any(|s| s.min_nodes.is_some());
        has_minimum
            && self.options.groups.iter().all(|(group, size)| {
                let running = self.group_nodes(group).iter().filter(|n| n.is_running()).count() as u32;
                running >= size.required()
            })
    }

    /// Create `count` nodes in `group`
    ///
    /// A failed creation is reported and the batch goes on. With `wait`,
    /// each new node is polled until the startup deadline; nodes that do
    /// not reach a running state are destroyed and reported as failed.
    pub async fn add(&mut self, group: &str, count: u32, wait: bool) -> ClusterResult<BatchReport> {
        validate_group_name(group)?;
        let options = match self.group_options.get(group) {
            Some(overrides) => self.options.for_group(overrides)?,
            None => self.options.clone(),
        };

        let mut report = BatchReport::default();
        let mut created = Vec::new();
        for _ in 0..count {
            let watermark = self.record.watermarks.get(group).copied().unwrap_or(0);
            let index = naming::allocate(&self.record.nodes, &self.record.name, group, watermark);
            let name = naming::node_name(&self.record.name, group, index);
            let request = InstanceRequest::new(&self.record.name, &name, group, &options, self.login.as_ref());
            debug!("requesting instance {:?}", request);

            match self.provider.start_instance(&request).await {
                Ok(mut node) => {
                    if node.name != name {
                        debug!("provider named node {} `{}`, renaming", name, node.name);
                        node.name = name.clone();
                    }
                    if options.floating_ip {
                        match self.provider.allocate_floating_ip(&node).await {
                            Ok(Some(ip)) => node.add_public_ip(ip),
                            Ok(None) => {}
                            Err(e) => warn!("Could not allocate a floating IP for {}: {}", name, e),
                        }
                    }
                    info!("Created node {} (id {})", name, node.id);
                    self.record.nodes.push(node);
                    self.record.watermarks.insert(group.to_string(), index);
                    self.save()?;
                    report.push(&name, ItemOutcome::Ok);
                    created.push(name);
                }
                Err(e) => {
                    error!("Could not create node {}: {}", name, e);
                    report.fail(&name, e);
                }
            }
        }

        if wait && !created.is_empty() {
            let deadline = Instant::now() + self.settings.startup_timeout;
            let poller = self.poller();
            for name in created {
                let Some(node) = self.record.nodes.iter().find(|n| n.name == name).cloned() else {
                    continue;
                };
                let provider = Arc::clone(&self.provider);
                let mut inventory = LiveInventory::new(provider.as_ref(), vec![node]);
                let outcome = poller.wait_until_deadline(deadline, &mut inventory, all_running).await;
                let polled = inventory.into_nodes();

                match outcome {
                    Ok(()) => {
                        if let Some(slot) = self.record.nodes.iter_mut().find(|n| n.name == name) {
                            if let Some(fresh) = polled.into_iter().next() {
                                *slot = fresh;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Node {} did not reach running state ({}), destroying it", name, e);
                        if let Err(err) = self.remove_by_name(&name).await {
                            error!("Could not destroy node {}: {}", name, err);
                        }
                        report.downgrade(&name, format!("did not reach running state: {}", e));
                    }
                }
            }
            self.save()?;
        }
        self.phase = self.observed_phase();
        Ok(report)
    }

    /// Remove the `count` highest-indexed nodes of `group`
    pub async fn remove(&mut self, group: &str, count: usize) -> ClusterResult<BatchReport> {
        validate_group_name(group)?;
        let victims = naming::highest_names(&self.record.nodes, &self.record.name, group, count);
        if victims.len() < count {
            warn!(
                "Group {} has only {} node(s), cannot remove {}",
                group,
                victims.len(),
                count
            );
        }
        let mut report = BatchReport::default();
        for name in victims {
            self.remove_one(&name, &mut report).await;
        }
        self.phase = self.observed_phase();
        Ok(report)
    }

    async fn remove_one(&mut self, name: &str, report: &mut BatchReport) {
        match self.remove_by_name(name).await {
            Ok(()) => report.push(name, ItemOutcome::Ok),
            Err(ClusterError::NodeNotFound(_)) => {
                warn!("Node {} not found in cluster {}", name, self.record.name);
                report.push(name, ItemOutcome::Skipped("not found".to_string()));
            }
            Err(e) => {
                error!("Could not remove node {}: {}", name, e);
                report.fail(name, e);
            }
        }
    }

    /// Destroy node `name` and drop it from the inventory
    pub async fn remove_by_name(&mut self, name: &str) -> ClusterResult<()> {
        if let Err(e) = self.refresh().await {
            warn!("Could not refresh state before removing {}: {}", name, e);
        }
        let position = self
            .record
            .nodes
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_string()))?;
        let node = self.record.nodes[position].clone();

        if let Err(e) = self.provider.deallocate_floating_ip(&node).await {
            warn!("Could not release floating IP of {}: {}", name, e);
        }
        self.provider.stop_instance(&node).await?;
        info!("Destroyed node {} (id {})", name, node.id);

        self.record.nodes.remove(position);
        self.save()
    }

    /// Destroy every node, then delete the cluster's files
    ///
    /// If a node cannot be destroyed the state file is kept, listing the
    /// nodes that are left.
    pub async fn stop(&mut self) -> ClusterResult<BatchReport> {
        if self.store.exists(&self.record.name) {
            self.record = self.store.load(&self.record.name)?;
        }
        let mut names: Vec<String> = self.record.nodes.iter().map(|n| n.name.clone()).collect();
        names.sort();

        let mut report = BatchReport::default();
        for name in names {
            self.remove_one(&name, &mut report).await;
        }

        if self.record.nodes.is_empty() {
            self.store.delete(&self.record.name)?;
            self.phase = ClusterPhase::Empty;
            info!("Cluster {} stopped and removed from storage", self.record.name);
        } else {
            self.save()?;
            self.phase = ClusterPhase::Degraded;
            warn!(
                "Cluster {} not fully stopped: {} node(s) remain",
                self.record.name,
                self.record.nodes.len()
            );
        }
        Ok(report)
    }

    /// Run the configuration tool on the current nodes
    pub async fn configure(&mut self, extra_args: &[String]) -> ClusterResult<bool> {
        let binding = self.setup.as_ref().ok_or_else(|| {
            ClusterError::ConfigurationError(format!("cluster {} has no setup configured", self.record.name))
        })?;
        let request = plan_setup(
            &self.record.name,
            &self.record.nodes,
            &binding.config,
            self.login.as_ref(),
            self.options.ssh_port,
            self.store.base_dir(),
            extra_args,
        );
        let provider = Arc::clone(&binding.provider);
        let ok = provider.setup_cluster(&request).await?;
        if ok {
            self.phase = ClusterPhase::Configured;
        } else {
            warn!("Configuration of cluster {} failed", self.record.name);
        }
        Ok(ok)
    }

    /// Default node to log into: the first node, by name, of the `ssh_to` group
    pub fn ssh_node(&self) -> Option<&Node> {
        let Some(ssh_to) = self.options.ssh_to.as_deref() else {
            info!("no ssh_to specified for cluster {} ({})", self.record.name, self.record.template);
            return None;
        };
        let mut candidates: Vec<&Node> = self
            .record
            .nodes
            .iter()
            .filter(|n| n.name == ssh_to || naming::group_of(&self.record.name, n).as_deref() == Some(ssh_to))
            .collect();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        let node = candidates.first().copied();
        if node.is_none() {
            warn!("no {} node found in cluster {}", ssh_to, self.record.name);
        }
        node
    }

    /// Credentials for logging into the nodes
    pub fn ssh_credentials(&self) -> ClusterResult<SshCredentials> {
        let login = self.login.as_ref().ok_or_else(|| {
            ClusterError::ConfigurationError(format!("cluster {} has no login configured", self.record.name))
        })?;
        Ok(SshCredentials {
            user: login.image_user.clone(),
            private_key: Some(login.user_key_private.clone()),
            password: login.image_user_password.clone(),
        })
    }

    /// Probe connecting with the cluster's login
    pub fn ssh_probe(&self) -> ClusterResult<Ssh2Probe> {
        Ok(Ssh2Probe::new(self.ssh_credentials()?, self.settings.connect_timeout))
    }

    /// Find where node `name` answers SSH, pinning its host keys
    pub async fn ssh_endpoint(
        &self,
        name: &str,
        probe: &dyn HostProbe,
        known_hosts_file: Option<&Path>,
    ) -> ClusterResult<SshEndpoint> {
        let node = self
            .record
            .nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| ClusterError::NodeNotFound(name.to_string()))?;
        let mut resolver = SshResolver::new(
            probe,
            self.known_hosts_path(),
            self.settings.polling_interval,
            self.settings.startup_timeout,
        );
        if let Some(path) = known_hosts_file.filter(|p| p.exists()) {
            resolver = resolver.with_trusted_file(path)?;
        }
        resolver.resolve(node, self.options.ssh_port).await
    }

    /// Machine-readable view
    pub fn summary(&self) -> ClusterSummary {
        let mut nodes = self.record.nodes.clone();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        ClusterSummary {
            name: self.record.name.clone(),
            template: self.record.template.clone(),
            phase: self.phase,
            ssh_to: self.ssh_node().map(|n| n.name.clone()),
            nodes,
        }
    }
}

impl fmt::Display for ClusterController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frontend = self.ssh_node().map(|n| n.name.as_str()).unwrap_or("unknown");
        writeln!(f, "Cluster name:      {}", self.record.name)?;
        writeln!(f, "Cluster template:  {}", self.record.template)?;
        writeln!(f, "Default ssh node:  {}", frontend)?;
        writeln!(f)?;
        if self.record.nodes.is_empty() {
            return writeln!(f, "Cluster does not appear to be in active state");
        }
        let mut nodes: Vec<&Node> = self.record.nodes.iter().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        for node in nodes {
            writeln!(f, "- {}", node)?;
        }
        writeln!(f)?;
        writeln!(f, "To login on the frontend node, run the command:")?;
        writeln!(f)?;
        writeln!(f, "    nimbus ssh {}", self.record.name)?;
        writeln!(f)?;
        writeln!(f, "To upload or download files to the cluster, use the command:")?;
        writeln!(f)?;
        writeln!(f, "    nimbus sftp {}", self.record.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupSize;
    use crate::node::NodeState;
    use crate::setup::MockSetupProvider;
    use crate::testing::FakeCloud;
    use std::time::Duration;

    fn template(groups: &[(&str, u32)]) -> ClusterTemplate {
        let mut raw = BTreeMap::new();
        for (k, v) in [("cloud", "fake"), ("login", "l"), ("setup", "s"), ("flavor", "small"), ("image_id", "img")] {
            raw.insert(k.to_string(), v.to_string());
        }
        raw.insert("ssh_to".to_string(), "frontend".to_string());
        let mut options = ClusterOptions::from_map(raw).unwrap();
        for (group, nodes) in groups {
            options.groups.insert(group.to_string(), GroupSize { nodes: *nodes, min_nodes: None });
        }
        ClusterTemplate { name: "tpl".into(), options, group_options: BTreeMap::new() }
    }

    fn settings(dir: &Path) -> ControllerSettings {
        ControllerSettings::new()
            .storage_path(dir)
            .polling_interval(Duration::from_millis(10))
            .startup_timeout(Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_start_reaches_steady() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        let mut cluster =
            ClusterController::new("c", &template(&[("frontend", 1), ("compute", 2)]), cloud.clone(), settings(dir.path()))
                .unwrap();

        let report = cluster.start().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.succeeded().len(), 3);
        assert_eq!(cluster.phase(), ClusterPhase::Steady);
        assert!(cluster.nodes().iter().all(|n| n.state == NodeState::Running));
        assert_eq!(cluster.ssh_node().map(|n| n.name.as_str()), Some("c-frontend001"));
        assert!(cluster.store().exists("c"));
    }

    #[tokio::test]
    async fn test_add_then_remove_is_lifo_and_never_reuses_indices() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        let mut cluster = ClusterController::new("c", &template(&[]), cloud.clone(), settings(dir.path())).unwrap();

        cluster.add("compute", 3, false).await.unwrap();
        let report = cluster.remove("compute", 2).await.unwrap();
        assert_eq!(report.succeeded(), vec!["c-compute003", "c-compute002"]);

        cluster.add("compute", 1, false).await.unwrap();
        let mut names: Vec<&str> = cluster.nodes().iter().map(|n| n.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["c-compute001", "c-compute004"]);
    }

    #[tokio::test]
    async fn test_add_reports_failures_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_start("c-compute001");
        let mut cluster = ClusterController::new("c", &template(&[]), cloud.clone(), settings(dir.path())).unwrap();

        let report = cluster.add("compute", 2, false).await.unwrap();
        assert_eq!(report.failed(), vec!["c-compute001"]);
        assert_eq!(report.succeeded(), vec!["c-compute002"]);
        assert_eq!(cluster.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_add_with_wait_destroys_stuck_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        cloud.never_running("c-compute002");
        let mut cluster = ClusterController::new("c", &template(&[]), cloud.clone(), settings(dir.path())).unwrap();

        let report = cluster.add("compute", 2, true).await.unwrap();
        assert_eq!(report.succeeded(), vec!["c-compute001"]);
        assert_eq!(report.failed(), vec!["c-compute002"]);
        assert_eq!(cloud.live_names(), vec!["c-compute001"]);
        assert_eq!(cluster.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        let mut cluster = ClusterController::new("c", &template(&[]), cloud, settings(dir.path())).unwrap();
        let err = cluster.remove_by_name("c-compute009").await.unwrap_err();
        assert!(matches!(err, ClusterError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_configure_delegates_to_setup_provider() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FakeCloud::new());
        let mut mock = MockSetupProvider::new();
        mock.expect_setup_cluster()
            .withf(|req| req.hosts.len() == 1 && req.groups.contains_key("frontend"))
            .times(1)
            .returning(|_| Ok(true));

        let mut setup = crate::config::SetupConfig::from_map("s", BTreeMap::new()).unwrap();
        setup.group_roles.insert("frontend".into(), vec!["master".into()]);
        let mut cluster = ClusterController::new("c", &template(&[("frontend", 1)]), cloud, settings(dir.path()))
            .unwrap()
            .with_setup(Arc::new(mock), setup);

        cluster.start().await.unwrap();
        assert!(cluster.configure(&[]).await.unwrap());
        assert_eq!(cluster.phase(), ClusterPhase::Configured);
    }

    #[tokio::test]
    async fn test_configure_without_setup_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster =
            ClusterController::new("c", &template(&[]), Arc::new(FakeCloud::new()), settings(dir.path())).unwrap();
        assert!(matches!(cluster.configure(&[]).await, Err(ClusterError::ConfigurationError(_))));
    }

    #[test]
    fn test_invalid_cluster_name() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClusterController::new("bad_name", &template(&[]), Arc::new(FakeCloud::new()), settings(dir.path()));
        assert!(matches!(result, Err(ClusterError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_display_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster =
            ClusterController::new("c", &template(&[("frontend", 1)]), Arc::new(FakeCloud::new()), settings(dir.path()))
                .unwrap();
        let text = cluster.to_string();
        assert!(text.contains("Cluster does not appear to be in active state"));

        cluster.start().await.unwrap();
        let text = cluster.to_string();
        assert!(text.contains("Cluster name:      c"));
        assert!(text.contains("Default ssh node:  c-frontend001"));
        assert!(text.contains("nimbus ssh c"));

        let json = serde_json::to_value(cluster.summary()).unwrap();
        assert_eq!(json["phase"], "steady");
        assert_eq!(json["nodes"][0]["name"], "c-frontend001");
    }
}
