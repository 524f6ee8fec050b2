//! Hand-off to the configuration-management tool.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::{LoginConfig, SetupConfig};
use crate::error::{ClusterError, ClusterResult};
use crate::naming::group_of;
use crate::node::Node;

/// Default user that privilege escalation switches to
pub const DEFAULT_SUDO_USER: &str = "root";

/// A node as seen by the configuration tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupHost {
    /// Node name
    pub name: String,
    /// Node group
    pub group: String,
    /// Address to connect to
    pub address: Option<String>,
    /// SSH port
    pub port: u16,
}

/// Everything the configuration tool needs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct SetupRequest {
    /// Cluster name
    pub cluster: String,
    /// Node group -> roles the group's nodes play
    pub groups: BTreeMap<String, Vec<String>>,
    /// Node group -> variables
    pub environment: BTreeMap<String, BTreeMap<String, String>>,
    /// Variables common to the whole run
    pub global_options: BTreeMap<String, String>,
    /// Nodes, sorted by name
    pub hosts: Vec<SetupHost>,
    /// Remote user
    pub user: String,
    /// Private key used to log in
    pub private_key: Option<PathBuf>,
    /// Directory where run artifacts go
    pub storage_path: PathBuf,
    /// Whether to escalate privileges
    pub sudo: bool,
    /// User to escalate to
    pub sudo_user: String,
    /// Extra command-line arguments
    pub extra_args: Vec<String>,
}

/// Build the request for configuring `nodes`
///
/// Roles come from the `<group>_groups` options. Every group receives the
/// `global_var_*` variables, then its own `<group>_var_*` variables on top.
pub fn plan_setup(
    cluster: &str,
    nodes: &[Node],
    setup: &SetupConfig,
    login: Option<&LoginConfig>,
    ssh_port: u16,
    storage_path: &Path,
    extra_args: &[String],
) -> SetupRequest {
    let mut hosts: Vec<SetupHost> = nodes
        .iter()
        .filter_map(|node| {
            let group = group_of(cluster, node)?;
            Some(SetupHost {
                name: node.name.clone(),
                group,
                address: node.preferred_address().map(str::to_string),
                port: ssh_port,
            })
        })
        .collect();
    hosts.sort_by(|a, b| a.name.cmp(&b.name));

    let mut groups = BTreeMap::new();
    let mut environment = BTreeMap::new();
    for host in &hosts {
        if groups.contains_key(&host.group) {
            continue;
        }
        match setup.group_roles.get(&host.group) {
            Some(roles) => {
                groups.insert(host.group.clone(), roles.clone());
            }
            None => warn!("No roles configured for node group {}; its nodes will not be configured", host.group),
        }
        let mut vars = setup.global_vars.clone();
        if let Some(own) = setup.group_vars.get(&host.group) {
            vars.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        environment.insert(host.group.clone(), vars);
    }

    SetupRequest {
        cluster: cluster.to_string(),
        groups,
        environment,
        global_options: setup.options.clone(),
        hosts,
        user: login.map(|l| l.image_user.clone()).unwrap_or_default(),
        private_key: login.map(|l| l.user_key_private.clone()),
        storage_path: storage_path.to_path_buf(),
        sudo: login.map_or(true, |l| l.image_sudo),
        sudo_user: login
            .map(|l| l.image_user_sudo.clone())
            .unwrap_or_else(|| DEFAULT_SUDO_USER.to_string()),
        extra_args: extra_args.to_vec(),
    }
}

/// Configuration-management collaborator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SetupProvider: Send + Sync {
    /// Configure the cluster; returns whether the run succeeded
    async fn setup_cluster(&self, request: &SetupRequest) -> ClusterResult<bool>;
}

fn quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:@,+".contains(c)) {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

/// Render an INI inventory for `request`
pub fn render_inventory(request: &SetupRequest) -> String {
    let mut roles: BTreeMap<&str, Vec<&SetupHost>> = BTreeMap::new();
    for host in &request.hosts {
        for role in request.groups.get(&host.group).into_iter().flatten() {
            roles.entry(role.as_str()).or_default().push(host);
        }
    }

    let mut out = String::new();
    for (role, hosts) in roles {
        let _ = writeln!(out, "[{}]", role);
        for host in hosts {
            let _ = write!(out, "{}", host.name);
            if let Some(address) = &host.address {
                let _ = write!(out, " ansible_host={}", address);
            }
            let _ = write!(out, " ansible_port={}", host.port);
            if !request.user.is_empty() {
                let _ = write!(out, " ansible_user={}", quote(&request.user));
            }
            if let Some(key) = &request.private_key {
                let _ = write!(out, " ansible_ssh_private_key_file={}", quote(&key.to_string_lossy()));
            }
            for (var, value) in request.environment.get(&host.group).into_iter().flatten() {
                let _ = write!(out, " {}={}", var, quote(value));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    if !request.global_options.is_empty() {
        out.push_str("[all:vars]\n");
        for (key, value) in &request.global_options {
            let _ = writeln!(out, "{}={}", key, quote(value));
        }
    }
    out
}

/// Runs `ansible-playbook` against a generated inventory
#[derive(Debug, Clone)]
pub struct AnsibleSetup {
    playbook: PathBuf,
    command: PathBuf,
    extra_args: Vec<String>,
}

impl AnsibleSetup {
    /// Create a runner for `playbook`
    pub fn new(playbook: impl Into<PathBuf>) -> Self {
        AnsibleSetup {
            playbook: playbook.into(),
            command: PathBuf::from("ansible-playbook"),
            extra_args: Vec::new(),
        }
    }

    /// Use a specific executable
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    /// Arguments passed on every run
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build from a setup section
    pub fn from_config(setup: &SetupConfig) -> ClusterResult<Self> {
        let playbook = setup.playbook_path.clone().ok_or_else(|| {
            ClusterError::ConfigurationError(format!("setup/{}: `playbook_path` is required", setup.name))
        })?;
        let mut runner = AnsibleSetup::new(playbook).with_extra_args(setup.extra_args.clone());
        if let Some(command) = &setup.command {
            runner = runner.with_command(command);
        }
        Ok(runner)
    }

    /// Inventory file of a cluster
    pub fn inventory_path(request: &SetupRequest) -> PathBuf {
        request.storage_path.join(format!("{}.inventory", request.cluster))
    }

    /// Command line for `request`, without the program name
    pub fn arguments(&self, request: &SetupRequest, inventory: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            inventory.to_string_lossy().into_owned(),
            self.playbook.to_string_lossy().into_owned(),
        ];
        if request.sudo {
            args.push("--become".to_string());
            args.push(format!("--become-user={}", request.sudo_user));
        }
        args.extend(self.extra_args.iter().cloned());
        args.extend(request.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl SetupProvider for AnsibleSetup {
    async fn setup_cluster(&self, request: &SetupRequest) -> ClusterResult<bool> {
        if request.groups.is_empty() {
            warn!("Cluster {} has no node group with roles, nothing to configure", request.cluster);
            return Ok(false);
        }

        let inventory = Self::inventory_path(request);
        fs::create_dir_all(&request.storage_path)?;
        fs::write(&inventory, render_inventory(request))?;
        debug!("wrote inventory {}", inventory.display());

        let args = self.arguments(request, &inventory);
        let known_hosts = request.storage_path.join(format!("{}.known_hosts", request.cluster));
        info!("Running {} {}", self.command.display(), args.join(" "));
        let status = Command::new(&self.command)
            .args(&args)
            .env("ANSIBLE_FORKS", "10")
            .env(
                "ANSIBLE_SSH_ARGS",
                format!("-o UserKnownHostsFile={} -o StrictHostKeyChecking=yes", known_hosts.display()),
            )
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| {
                ClusterError::SetupError(format!("cannot run {}: {}", self.command.display(), e))
            })?;

        if status.success() {
            info!("Cluster {} correctly configured", request.cluster);
        } else {
            warn!("{} exited with {}", self.command.display(), status);
        }
        Ok(status.success())
    }
}

/// Create the setup backend named by a setup section
pub fn create_setup_provider(setup: &SetupConfig) -> ClusterResult<Arc<dyn SetupProvider>> {
    match setup.provider.as_str() {
        "ansible" => Ok(Arc::new(AnsibleSetup::from_config(setup)?)),
        other => Err(ClusterError::ConfigurationError(format!(
            "setup/{}: unsupported provider `{}`",
            setup.name, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeState;

    fn setup_config() -> SetupConfig {
        let mut group_roles = BTreeMap::new();
        group_roles.insert("frontend".to_string(), vec!["slurm_master".to_string()]);
        group_roles.insert("compute".to_string(), vec!["slurm_worker".to_string()]);
        let mut global_vars = BTreeMap::new();
        global_vars.insert("version".to_string(), "23.02".to_string());
        global_vars.insert("mem".to_string(), "8G".to_string());
        let mut compute = BTreeMap::new();
        compute.insert("mem".to_string(), "64G".to_string());
        let mut group_vars = BTreeMap::new();
        group_vars.insert("compute".to_string(), compute);
        SetupConfig {
            name: "slurm".into(),
            provider: "ansible".into(),
            playbook_path: Some(PathBuf::from("/srv/site.yml")),
            command: None,
            extra_args: vec!["--diff".into()],
            group_roles,
            global_vars,
            group_vars,
            options: BTreeMap::new(),
        }
    }

    fn nodes() -> Vec<Node> {
        ["c-compute002", "c-frontend001", "c-compute001", "other-compute001"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut node = Node::new(format!("i-{}", i), *name).with_state(NodeState::Running);
                node.public_ips.push(format!("203.0.113.{}", i + 1));
                node
            })
            .collect()
    }

    #[test]
    fn test_plan_applies_global_vars_to_every_group() {
        let request = plan_setup("c", &nodes(), &setup_config(), None, 22, Path::new("/tmp/s"), &[]);

        assert_eq!(request.hosts.len(), 3);
        assert_eq!(request.hosts[0].name, "c-compute001");
        assert_eq!(request.environment["frontend"]["version"], "23.02");
        assert_eq!(request.environment["frontend"]["mem"], "8G");
        assert_eq!(request.environment["compute"]["version"], "23.02");
        assert_eq!(request.environment["compute"]["mem"], "64G");
        assert_eq!(request.groups["compute"], vec!["slurm_worker"]);
        assert!(request.sudo);
        assert_eq!(request.sudo_user, DEFAULT_SUDO_USER);
    }

    #[test]
    fn test_inventory_lists_hosts_per_role() {
        let request = plan_setup("c", &nodes(), &setup_config(), None, 2222, Path::new("/tmp/s"), &[]);
        let inventory = render_inventory(&request);

        assert!(inventory.contains("[slurm_master]\nc-frontend001 ansible_host=203.0.113.2 ansible_port=2222"));
        assert!(inventory.contains("[slurm_worker]\nc-compute001"));
        assert!(inventory.contains("mem=64G"));
        assert!(!inventory.contains("other-compute001"));
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain-value"), "plain-value");
        assert_eq!(quote("two words"), "\"two words\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[test]
    fn test_arguments() {
        let runner = AnsibleSetup::from_config(&setup_config()).unwrap();
        let mut request = plan_setup("c", &nodes(), &setup_config(), None, 22, Path::new("/s"), &["-vv".to_string()]);
        let args = runner.arguments(&request, Path::new("/s/c.inventory"));
        assert_eq!(
            args,
            vec!["-i", "/s/c.inventory", "/srv/site.yml", "--become", "--become-user=root", "--diff", "-vv"]
        );

        request.sudo = false;
        assert!(!runner.arguments(&request, Path::new("/s/c.inventory")).contains(&"--become".to_string()));
    }

    #[test]
    fn test_unknown_setup_provider() {
        let mut config = setup_config();
        config.provider = "chef".into();
        assert!(create_setup_provider(&config).is_err());
        config.provider = "ansible".into();
        config.playbook_path = None;
        assert!(create_setup_provider(&config).is_err());
    }

    #[tokio::test]
    async fn test_failed_command_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let runner = AnsibleSetup::new("/srv/site.yml").with_command("false");
        let request = plan_setup("c", &nodes(), &setup_config(), None, 22, dir.path(), &[]);
        assert!(!runner.setup_cluster(&request).await.unwrap());
        assert!(dir.path().join("c.inventory").is_file());
    }

    #[tokio::test]
    async fn test_mock_provider() {
        let mut mock = MockSetupProvider::new();
        mock.expect_setup_cluster()
            .withf(|req| req.cluster == "c" && req.extra_args == vec!["-v".to_string()])
            .times(1)
            .returning(|_| Ok(true));
        let request = plan_setup("c", &nodes(), &setup_config(), None, 22, Path::new("/s"), &["-v".to_string()]);
        assert!(mock.setup_cluster(&request).await.unwrap());
    }
}
