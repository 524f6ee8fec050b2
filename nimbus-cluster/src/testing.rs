//! In-memory collaborators for tests.
//!
//! `FakeCloud` hands out instances that turn running after a configurable
//! delay, measured from their creation. `FakeProbe` answers SSH probes
//! from a per-address script and records which addresses it would have
//! sent credentials to.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ClusterError, ClusterResult};
use crate::known_hosts::HostKey;
use crate::node::{Node, NodeState};
use crate::provider::{CloudProvider, InstanceRequest};
use crate::ssh::{HostProbe, PinnedKeys, ProbeError};

struct FakeInstance {
    node: Node,
    created: Instant,
    running_after: Option<Duration>,
}

#[derive(Default)]
struct FakeState {
    instances: Vec<FakeInstance>,
    next_id: u32,
    default_delay: Duration,
    delays: BTreeMap<String, Option<Duration>>,
    fail_start: BTreeSet<String>,
    fail_stop: BTreeSet<String>,
    failing_lists: u32,
    started: Vec<String>,
    stopped: Vec<String>,
    released_ips: Vec<String>,
    list_calls: u32,
}

/// Cloud provider keeping its instances in memory
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
}

impl FakeCloud {
    /// Instances run as soon as they are created
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances run `delay` after creation unless configured otherwise
    pub fn with_default_delay(delay: Duration) -> Self {
        let cloud = Self::default();
        cloud.state.lock().default_delay = delay;
        cloud
    }

    /// Node `name` runs `delay` after creation
    pub fn set_running_after(&self, name: &str, delay: Duration) {
        self.state.lock().delays.insert(name.to_string(), Some(delay));
    }

    /// Node `name` stays pending forever
    pub fn never_running(&self, name: &str) {
        self.state.lock().delays.insert(name.to_string(), None);
    }

    /// Creating node `name` fails
    pub fn fail_start(&self, name: &str) {
        self.state.lock().fail_start.insert(name.to_string());
    }

    /// Destroying node `name` fails
    pub fn fail_stop(&self, name: &str) {
        self.state.lock().fail_stop.insert(name.to_string());
    }

    /// Destroying node `name` works again
    pub fn allow_stop(&self, name: &str) {
        self.state.lock().fail_stop.remove(name);
    }

    /// The next `count` listings fail
    pub fn fail_next_lists(&self, count: u32) {
        self.state.lock().failing_lists = count;
    }

    /// Drop node `name` from the live view, as if terminated elsewhere
    pub fn vanish(&self, name: &str) {
        self.state.lock().instances.retain(|i| i.node.name != name);
    }

    /// Add an instance the cluster never created
    pub fn insert_foreign(&self, node: Node) {
        self.state.lock().instances.push(FakeInstance {
            node,
            created: Instant::now(),
            running_after: Some(Duration::ZERO),
        });
    }

    /// Names of created nodes, in creation order
    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    /// Names of destroyed nodes, in destruction order
    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    /// Floating addresses released so far
    pub fn released_ips(&self) -> Vec<String> {
        self.state.lock().released_ips.clone()
    }

    /// Names of live instances, sorted
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().instances.iter().map(|i| i.node.name.clone()).collect();
        names.sort();
        names
    }

    /// Number of listings served
    pub fn list_calls(&self) -> u32 {
        self.state.lock().list_calls
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(ClusterError::NetworkError("listing failed".into()));
        }
        Ok(state
            .instances
            .iter()
            .map(|i| {
                let running = i.running_after.map_or(false, |d| i.created.elapsed() >= d);
                let status = if running { NodeState::Running } else { NodeState::Pending };
                i.node.clone().with_state(status)
            })
            .collect())
    }

    async fn start_instance(&self, request: &InstanceRequest) -> ClusterResult<Node> {
        let mut state = self.state.lock();
        if state.fail_start.contains(&request.name) {
            return Err(ClusterError::ProviderError(format!("quota exceeded creating {}", request.name)));
        }
        state.next_id += 1;
        let n = state.next_id;
        let mut node = Node::new(format!("fake-{}", n), request.name.clone()).with_state(NodeState::Pending);
        node.private_ips.push(format!("10.0.0.{}", n));
        node.public_ips.push(format!("198.51.100.{}", n));
        node.size = Some(request.flavor.clone());
        node.image = Some(request.image_id.clone());

        let running_after = state.delays.get(&request.name).copied().unwrap_or(Some(state.default_delay));
        state.instances.push(FakeInstance { node: node.clone(), created: Instant::now(), running_after });
        state.started.push(request.name.clone());
        Ok(node)
    }

    async fn stop_instance(&self, node: &Node) -> ClusterResult<()> {
        let mut state = self.state.lock();
        if state.fail_stop.contains(&node.name) {
            return Err(ClusterError::ProviderError(format!("cannot destroy {}", node.name)));
        }
        state.instances.retain(|i| i.node.id != node.id);
        state.stopped.push(node.name.clone());
        Ok(())
    }

    async fn allocate_floating_ip(&self, node: &Node) -> ClusterResult<Option<String>> {
        let mut state = self.state.lock();
        let ip = format!("203.0.113.{}", state.next_id);
        if let Some(instance) = state.instances.iter_mut().find(|i| i.node.id == node.id) {
            instance.node.add_public_ip(ip.clone());
        }
        Ok(Some(ip))
    }

    async fn deallocate_floating_ip(&self, node: &Node) -> ClusterResult<()> {
        let mut state = self.state.lock();
        let floating: Vec<String> =
            node.public_ips.iter().filter(|ip| ip.starts_with("203.0.113.")).cloned().collect();
        state.released_ips.extend(floating);
        Ok(())
    }
}

/// SSH probe answering from a script
///
/// Each address has a queue of answers; once it is drained, the last
/// answer repeats. Unscripted addresses are unreachable.
#[derive(Default)]
pub struct FakeProbe {
    scripts: Mutex<BTreeMap<String, VecDeque<Result<Vec<HostKey>, ProbeError>>>>,
    attempts: Mutex<Vec<String>>,
    authenticated: Mutex<Vec<String>>,
}

impl FakeProbe {
    /// Create a probe where every address is unreachable
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue answers for `address`
    pub fn script(&self, address: &str, answers: Vec<Result<Vec<HostKey>, ProbeError>>) {
        self.scripts.lock().insert(address.to_string(), answers.into());
    }

    /// Addresses probed so far, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Addresses whose offered keys passed the pinned-key check, in order
    pub fn authenticated(&self) -> Vec<String> {
        self.authenticated.lock().clone()
    }
}

#[async_trait]
impl HostProbe for FakeProbe {
    async fn probe(&self, address: &str, _port: u16, pinned: &PinnedKeys) -> Result<Vec<HostKey>, ProbeError> {
        self.attempts.lock().push(address.to_string());
        let keys = self.answer(address)?;
        pinned.check(&keys)?;
        self.authenticated.lock().push(address.to_string());
        Ok(keys)
    }
}

impl FakeProbe {
    fn answer(&self, address: &str) -> Result<Vec<HostKey>, ProbeError> {
        let mut scripts = self.scripts.lock();
        match scripts.get_mut(address) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| {
                Err(ProbeError::Unreachable("script exhausted".into()))
            }),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(ProbeError::Unreachable("script exhausted".into()))),
            None => Err(ProbeError::Unreachable(format!("connection refused by {}", address))),
        }
    }
}
