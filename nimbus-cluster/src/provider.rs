//! Cloud provider capability and the static host pool backend.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{CloudConfig, ClusterOptions, LoginConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeState};

/// Everything a backend needs to create one instance
#[derive(Clone, PartialEq)]
pub struct InstanceRequest {
    /// Cluster the instance belongs to
    pub cluster: String,
    /// Node name, `<cluster>-<group><index>`
    pub name: String,
    /// Node group
    pub group: String,
    /// Image identifier
    pub image_id: String,
    /// Instance flavor
    pub flavor: String,
    /// Security groups
    pub security_groups: Vec<String>,
    /// Networks to attach
    pub network_ids: Vec<String>,
    /// User data passed to the image
    pub image_userdata: String,
    /// Whether a floating IP should be attached
    pub floating_ip: bool,
    /// Account on the image
    pub image_user: String,
    /// Key pair name registered on the cloud
    pub key_name: String,
    /// Public key to import if the key pair is missing
    pub public_key: Option<PathBuf>,
    /// Private key matching `key_name`
    pub private_key: Option<PathBuf>,
    /// Remaining options, passed through untouched
    pub options: BTreeMap<String, String>,
}

impl fmt::Debug for InstanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRequest")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("image_id", &self.image_id)
            .field("flavor", &self.flavor)
            .field("security_groups", &self.security_groups)
            .field("network_ids", &self.network_ids)
            .field("floating_ip", &self.floating_ip)
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

impl InstanceRequest {
    /// Build a request from a group's merged options and the login section
    pub fn new(
        cluster: &str,
        name: &str,
        group: &str,
        options: &ClusterOptions,
        login: Option<&LoginConfig>,
    ) -> Self {
        let userdata = match login {
            Some(l) if options.image_userdata.is_empty() => l.image_userdata.clone(),
            _ => options.image_userdata.clone(),
        };
        InstanceRequest {
            cluster: cluster.to_string(),
            name: name.to_string(),
            group: group.to_string(),
            image_id: options.image_id.clone(),
            flavor: options.flavor.clone(),
            security_groups: options.security_groups.clone(),
            network_ids: options.network_ids.clone(),
            image_userdata: userdata,
            floating_ip: options.floating_ip,
            image_user: login.map(|l| l.image_user.clone()).unwrap_or_default(),
            key_name: login.map(|l| l.user_key_name.clone()).unwrap_or_default(),
            public_key: login.and_then(|l| l.user_key_public.clone()),
            private_key: login.map(|l| l.user_key_private.clone()),
            options: options.extra.clone(),
        }
    }
}

/// Capability interface implemented by each cloud backend
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short backend name, for logging
    fn name(&self) -> &str;

    /// Every instance currently live on the cloud
    async fn list_nodes(&self) -> ClusterResult<Vec<Node>>;

    /// Create one instance
    async fn start_instance(&self, request: &InstanceRequest) -> ClusterResult<Node>;

    /// Destroy an instance
    async fn stop_instance(&self, node: &Node) -> ClusterResult<()>;

    /// Attach a floating address to `node`, returning it
    async fn allocate_floating_ip(&self, _node: &Node) -> ClusterResult<Option<String>> {
        Ok(None)
    }

    /// Release any floating address attached to `node`
    async fn deallocate_floating_ip(&self, _node: &Node) -> ClusterResult<()> {
        Ok(())
    }
}

/// A host of the static pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHost {
    /// Address reachable from the control machine
    pub address: String,
    /// Address on the private network, if different
    pub private_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claim {
    id: String,
    name: String,
    flavor: String,
    image: String,
    created_at: String,
}

/// Provider backed by a fixed list of pre-existing hosts
///
/// Creating an instance claims the first free host; destroying it
/// releases the host. Claims are kept in `<storage>/pools/<cloud>.json`
/// so they survive across invocations.
pub struct StaticPool {
    cloud: String,
    hosts: Vec<PoolHost>,
    claims_path: PathBuf,
    // host address -> claim
    claims: Mutex<BTreeMap<String, Claim>>,
}

impl StaticPool {
    /// Open the pool, loading claims made by earlier invocations
    pub fn new(cloud: &str, hosts: Vec<PoolHost>, storage: &Path) -> ClusterResult<Self> {
        if hosts.is_empty() {
            return Err(ClusterError::ConfigurationError(format!(
                "cloud/{}: a static pool needs at least one host",
                cloud
            )));
        }
        let claims_path = storage.join("pools").join(format!("{}.json", cloud));
        let claims = if claims_path.is_file() {
            serde_json::from_slice(&fs::read(&claims_path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(StaticPool {
            cloud: cloud.to_string(),
            hosts,
            claims_path,
            claims: Mutex::new(claims),
        })
    }

    /// Build a pool from the `hosts` and `private_hosts` options of a cloud section
    pub fn from_config(cloud: &CloudConfig, storage: &Path) -> ClusterResult<Self> {
        let list = |key: &str| -> Vec<String> {
            cloud
                .options
                .get(key)
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default()
        };
        let public = list("hosts");
        let private = list("private_hosts");
        if !private.is_empty() && private.len() != public.len() {
            return Err(ClusterError::ConfigurationError(format!(
                "cloud/{}: `private_hosts` must list one address per entry of `hosts`",
                cloud.name
            )));
        }
        let hosts = public
            .into_iter()
            .enumerate()
            .map(|(i, address)| PoolHost { address, private_address: private.get(i).cloned() })
            .collect();
        Self::new(&cloud.name, hosts, storage)
    }

    /// Number of hosts not claimed by any node
    pub fn free_hosts(&self) -> usize {
        let claims = self.claims.lock();
        self.hosts.iter().filter(|h| !claims.contains_key(&h.address)).count()
    }

    fn persist(&self, claims: &BTreeMap<String, Claim>) -> ClusterResult<()> {
        if let Some(dir) = self.claims_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.claims_path, serde_json::to_vec_pretty(claims)?)?;
        Ok(())
    }

    fn to_node(&self, host: &PoolHost, claim: &Claim) -> Node {
        let mut node = Node::new(claim.id.clone(), claim.name.clone()).with_state(NodeState::Running);
        node.public_ips.push(host.address.clone());
        if let Some(private) = &host.private_address {
            node.private_ips.push(private.clone());
        }
        node.size = Some(claim.flavor.clone());
        node.image = Some(claim.image.clone());
        node.created_at = Some(claim.created_at.clone());
        node.extra.insert("pool".to_string(), self.cloud.clone());
        node
    }
}

#[async_trait]
impl CloudProvider for StaticPool {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        let claims = self.claims.lock();
        Ok(self
            .hosts
            .iter()
            .filter_map(|host| claims.get(&host.address).map(|claim| self.to_node(host, claim)))
            .collect())
    }

    async fn start_instance(&self, request: &InstanceRequest) -> ClusterResult<Node> {
        let mut claims = self.claims.lock();
        if let Some((address, _)) = claims.iter().find(|(_, c)| c.name == request.name) {
            return Err(ClusterError::ProviderError(format!(
                "host {} is already claimed by {}",
                address, request.name
            )));
        }
        let host = self
            .hosts
            .iter()
            .find(|h| !claims.contains_key(&h.address))
            .ok_or_else(|| {
                ClusterError::ProviderError(format!("no free host left in static pool `{}`", self.cloud))
            })?;

        let claim = Claim {
            id: Uuid::new_v4().to_string(),
            name: request.name.clone(),
            flavor: request.flavor.clone(),
            image: request.image_id.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let node = self.to_node(host, &claim);
        claims.insert(host.address.clone(), claim);
        self.persist(&claims)?;
        info!("Claimed host {} for node {}", host.address, request.name);
        Ok(node)
    }

    async fn stop_instance(&self, node: &Node) -> ClusterResult<()> {
        let mut claims = self.claims.lock();
        let address = claims.iter().find(|(_, c)| c.id == node.id).map(|(a, _)| a.clone());
        match address {
            Some(address) => {
                claims.remove(&address);
                self.persist(&claims)?;
                info!("Released host {} held by {}", address, node.name);
            }
            None => warn!("Node {} holds no host in static pool `{}`", node.name, self.cloud),
        }
        Ok(())
    }
}

/// Create the provider backend named by a cloud section
pub fn create_provider(cloud: &CloudConfig, storage: &Path) -> ClusterResult<Arc<dyn CloudProvider>> {
    debug!("creating `{}` provider for cloud {}", cloud.provider, cloud.name);
    match cloud.provider.as_str() {
        "static" => Ok(Arc::new(StaticPool::from_config(cloud, storage)?)),
        other => Err(ClusterError::ConfigurationError(format!(
            "cloud/{}: unsupported provider `{}`",
            cloud.name, other
        ))),
    }
}
