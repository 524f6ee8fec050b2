//! Node module for cluster node identification and provider-reported state.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

/// Lifecycle state of an instance as reported by the cloud provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Instance is being created
    Pending,

    /// Instance is up
    Running,

    /// Instance is rebooting
    Rebooting,

    /// Instance is stopped but still allocated
    Stopped,

    /// Instance has been destroyed
    Terminated,

    /// State not reported, or the instance vanished from the provider's view
    #[default]
    Unknown,
}

impl NodeState {
    /// Check if the instance reached a running state
    pub fn is_running(&self) -> bool {
        *self == NodeState::Running
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Pending => write!(f, "pending"),
            NodeState::Running => write!(f, "running"),
            NodeState::Rebooting => write!(f, "rebooting"),
            NodeState::Stopped => write!(f, "stopped"),
            NodeState::Terminated => write!(f, "terminated"),
            NodeState::Unknown => write!(f, "unknown"),
        }
    }
}

/// A virtual machine belonging to a cluster
///
/// `id` is opaque and assigned by the cloud; `name` is derived by the
/// cluster (see [`crate::naming`]) and is the only record of the node's
/// group membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Cloud-assigned instance identifier
    pub id: String,

    /// `<cluster>-<group><index>`
    pub name: String,

    /// Last known provider state
    #[serde(default)]
    pub state: NodeState,

    /// Publicly routable addresses
    #[serde(default)]
    pub public_ips: Vec<String>,

    /// Addresses on the cloud's private network
    #[serde(default)]
    pub private_ips: Vec<String>,

    /// Flavor or instance size
    #[serde(default)]
    pub size: Option<String>,

    /// Creation timestamp as reported by the provider
    #[serde(default)]
    pub created_at: Option<String>,

    /// Image reference
    #[serde(default)]
    pub image: Option<String>,

    /// Provider-specific metadata
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Node {
    /// Create a node with no addresses and an unknown state
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Node {
            id: id.into(),
            name: name.into(),
            state: NodeState::Unknown,
            public_ips: Vec::new(),
            private_ips: Vec::new(),
            size: None,
            created_at: None,
            image: None,
            extra: BTreeMap::new(),
        }
    }

    /// Set the state, builder style
    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    /// Check if node is running
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// All known addresses, private ones first
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.private_ips
            .iter()
            .chain(self.public_ips.iter())
            .map(String::as_str)
    }

    /// Preferred address for reaching the node from outside the cloud
    pub fn preferred_address(&self) -> Option<&str> {
        self.public_ips
            .first()
            .or_else(|| self.private_ips.first())
            .map(String::as_str)
    }

    /// Record an extra address handed out by the provider, e.g. a floating IP
    pub fn add_public_ip(&mut self, ip: String) {
        if !self.public_ips.contains(&ip) {
            self.public_ips.push(ip);
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id: {}, state: {})", self.name, self.id, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        let yaml = serde_yaml::to_string(&NodeState::Running).unwrap();
        assert_eq!(yaml.trim(), "running");

        let state: NodeState = serde_json::from_str("\"terminated\"").unwrap();
        assert_eq!(state, NodeState::Terminated);
    }

    #[test]
    fn test_missing_fields_default() {
        let node: Node = serde_json::from_str(r#"{"id": "i-1", "name": "c-compute001"}"#).unwrap();
        assert_eq!(node.state, NodeState::Unknown);
        assert!(node.public_ips.is_empty());
        assert!(node.size.is_none());
    }

    #[test]
    fn test_addresses_private_first() {
        let mut node = Node::new("i-1", "c-frontend001");
        node.public_ips = vec!["203.0.113.5".to_string()];
        node.private_ips = vec!["10.0.0.5".to_string()];

        let addrs: Vec<&str> = node.addresses().collect();
        assert_eq!(addrs, vec!["10.0.0.5", "203.0.113.5"]);
        assert_eq!(node.preferred_address(), Some("203.0.113.5"));
    }

    #[test]
    fn test_add_public_ip_is_idempotent() {
        let mut node = Node::new("i-1", "c-frontend001");
        node.add_public_ip("198.51.100.7".to_string());
        node.add_public_ip("198.51.100.7".to_string());
        assert_eq!(node.public_ips.len(), 1);
    }
}
