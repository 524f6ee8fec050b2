//! Configuration module for nimbus.
//!
//! The configuration file is YAML with four top-level sections, each a
//! map from an entity name to a flat option map:
//!
//! ```yaml
//! cloud:
//!   lab: { provider: static, hosts: "10.0.0.1,10.0.0.2,10.0.0.3" }
//! login:
//!   ubuntu:
//!     image_user: ubuntu
//!     image_sudo: true
//!     user_key_name: nimbus
//!     user_key_private: ~/.ssh/id_rsa
//! setup:
//!   slurm:
//!     playbook_path: ~/playbooks/site.yml
//!     frontend_groups: slurm_master
//!     compute_groups: slurm_worker
//!     global_var_slurm_version: "23.02"
//! cluster:
//!   slurm:
//!     cloud: lab
//!     login: ubuntu
//!     setup: slurm
//!     image_id: ubuntu-22.04
//!     flavor: m1.small
//!     frontend_nodes: 1
//!     compute_nodes: 2
//!     ssh_to: frontend
//!     groups:
//!       compute: { flavor: m1.large }
//! ```
//!
//! Every entity is validated once, against an explicit option table, into
//! a closed struct. Open string maps do not travel past this module except
//! as provider pass-through options.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{ClusterError, ClusterResult};
use crate::naming::validate_group_name;
use crate::store::StorageFormat;

/// Default time allowed for nodes to reach a running state, in seconds
pub const DEFAULT_STARTUP_TIMEOUT: u64 = 600;

/// Default interval between provider polls, in seconds
pub const DEFAULT_POLLING_INTERVAL: u64 = 10;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default TCP connect timeout for SSH probes, in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "~/.nimbus/config.yaml";

/// Default directory holding persisted cluster state
pub const DEFAULT_STORAGE_PATH: &str = "~/.nimbus/storage";

/// Value type accepted by an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Any string, possibly empty
    Text,
    /// A string with at least one non-blank character
    NonEmpty,
    /// yes/no, true/false, on/off, 1/0
    Boolean,
    /// Non-negative integer
    Count,
    /// TCP port
    Port,
    /// Path to an existing file
    ReadableFile,
}

/// One row of an entity's option table
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    /// Option key
    pub name: &'static str,
    /// Accepted value type
    pub kind: OptionKind,
    /// Value used when the key is absent
    pub default: Option<&'static str>,
    /// Whether the key must be present when there is no default
    pub required: bool,
}

const fn opt(name: &'static str, kind: OptionKind) -> OptionSpec {
    OptionSpec { name, kind, default: None, required: false }
}

const fn req(name: &'static str, kind: OptionKind) -> OptionSpec {
    OptionSpec { name, kind, default: None, required: true }
}

const fn def(name: &'static str, kind: OptionKind, default: &'static str) -> OptionSpec {
    OptionSpec { name, kind, default: Some(default), required: false }
}

/// Options of a `cluster` section
pub const CLUSTER_OPTIONS: &[OptionSpec] = &[
    req("cloud", OptionKind::NonEmpty),
    req("login", OptionKind::NonEmpty),
    req("setup", OptionKind::NonEmpty),
    req("flavor", OptionKind::NonEmpty),
    req("image_id", OptionKind::NonEmpty),
    def("floating_ip", OptionKind::Boolean, "false"),
    opt("security_group", OptionKind::Text),
    opt("security_groups", OptionKind::Text),
    def("image_userdata", OptionKind::Text, ""),
    opt("network_ids", OptionKind::Text),
    opt("ssh_to", OptionKind::Text),
    def("ssh_port", OptionKind::Port, "22"),
];

/// Options of a `login` section
pub const LOGIN_OPTIONS: &[OptionSpec] = &[
    req("image_user", OptionKind::NonEmpty),
    req("image_sudo", OptionKind::Boolean),
    req("user_key_name", OptionKind::Text),
    req("user_key_private", OptionKind::ReadableFile),
    opt("user_key_public", OptionKind::ReadableFile),
    def("image_user_sudo", OptionKind::NonEmpty, "root"),
    def("image_userdata", OptionKind::Text, ""),
    opt("image_user_password", OptionKind::Text),
];

/// Options of a `setup` section
pub const SETUP_OPTIONS: &[OptionSpec] = &[
    def("provider", OptionKind::NonEmpty, "ansible"),
    opt("playbook_path", OptionKind::ReadableFile),
    opt("ansible_command", OptionKind::ReadableFile),
    opt("ansible_extra_args", OptionKind::Text),
];

/// Options of a `cloud` section; the rest is provider specific
pub const CLOUD_OPTIONS: &[OptionSpec] = &[req("provider", OptionKind::NonEmpty)];

const CLUSTER_KEY_RENAMES: &[(&str, &str)] = &[("setup_provider", "setup")];
const CLOUD_KEY_RENAMES: &[(&str, &str)] = &[("tenant_name", "project_name")];
const SETUP_KEY_RENAMES: &[(&str, &str)] = &[("ssh_pipelining", "ansible_ssh_pipelining")];

/// Configuration-management groups that were renamed upstream
const RENAMED_ROLES: &[(&str, &str)] = &[
    ("gluster_client", "glusterfs_client"),
    ("gluster_data", "glusterfs_server"),
    ("gridengine_clients", "gridengine_worker"),
    ("slurm_clients", "slurm_worker"),
    ("slurm_workers", "slurm_worker"),
];

static MIN_NODES_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9A-Za-z_-]+)_min_nodes$").unwrap());
static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").unwrap());

/// Expand a leading `~` and `$VAR` / `${VAR}` references in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = ENV_VAR.replace_all(path, |caps: &regex::Captures<'_>| {
        let var = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or_default();
        std::env::var(var).unwrap_or_else(|_| caps[0].to_string())
    });
    if expanded == "~" || expanded.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(expanded.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(expanded.into_owned())
}

/// Parse a boolean option value
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn apply_renames(entity: &str, options: &mut BTreeMap<String, String>, renames: &[(&str, &str)]) {
    for (old, new) in renames {
        if let Some(value) = options.remove(*old) {
            warn!("{}: option `{}` is deprecated, use `{}` instead", entity, old, new);
            options.entry(new.to_string()).or_insert(value);
        }
    }
}

fn check_value(entity: &str, spec: &OptionSpec, value: &str) -> ClusterResult<()> {
    let invalid = |what: &str| {
        Err(ClusterError::ConfigurationError(format!(
            "{}: option `{}` must be {}, got `{}`",
            entity, spec.name, what, value
        )))
    };
    match spec.kind {
        OptionKind::Text => Ok(()),
        OptionKind::NonEmpty if value.trim().is_empty() => invalid("a non-empty string"),
        OptionKind::NonEmpty => Ok(()),
        OptionKind::Boolean if parse_bool(value).is_none() => invalid("a boolean"),
        OptionKind::Boolean => Ok(()),
        OptionKind::Count if value.trim().parse::<u32>().is_err() => invalid("a non-negative integer"),
        OptionKind::Count => Ok(()),
        OptionKind::Port => match value.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(()),
            _ => invalid("a TCP port"),
        },
        OptionKind::ReadableFile if !expand_path(value).is_file() => invalid("a readable file"),
        OptionKind::ReadableFile => Ok(()),
    }
}

/// Validate `options` against `table`, filling in defaults
///
/// Keys not in the table are accepted only if `dynamic` returns true for
/// them; their values are returned untouched.
pub fn validate_options(
    entity: &str,
    table: &[OptionSpec],
    mut options: BTreeMap<String, String>,
    dynamic: impl Fn(&str) -> bool,
) -> ClusterResult<BTreeMap<String, String>> {
    for spec in table {
        match options.get(spec.name) {
            Some(value) => check_value(entity, spec, value)?,
            None => match spec.default {
                Some(default) => {
                    options.insert(spec.name.to_string(), default.to_string());
                }
                None if spec.required => {
                    return Err(ClusterError::ConfigurationError(format!(
                        "{}: missing required option `{}`",
                        entity, spec.name
                    )));
                }
                None => {}
            },
        }
    }
    if let Some(unknown) = options
        .keys()
        .find(|k| !table.iter().any(|s| s.name == k.as_str()) && !dynamic(k.as_str()))
    {
        return Err(ClusterError::ConfigurationError(format!(
            "{}: unknown option `{}`",
            entity, unknown
        )));
    }
    Ok(options)
}

/// Desired size of a node group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupSize {
    /// Number of nodes requested at start
    pub nodes: u32,
    /// Minimum number of running nodes for a start to be accepted
    pub min_nodes: Option<u32>,
}

impl GroupSize {
    /// Nodes that must be running for a start to succeed
    pub fn required(&self) -> u32 {
        self.min_nodes.map_or(self.nodes, |min| min.min(self.nodes))
    }
}

/// Validated options of a cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    /// Name of the cloud section
    pub cloud: String,
    /// Name of the login section
    pub login: String,
    /// Name of the setup section
    pub setup: String,
    /// Instance flavor
    pub flavor: String,
    /// Image identifier
    pub image_id: String,
    /// Whether each node gets a floating IP
    pub floating_ip: bool,
    /// Security groups attached to each node
    pub security_groups: Vec<String>,
    /// User data passed to the image
    pub image_userdata: String,
    /// Networks each node is attached to
    pub network_ids: Vec<String>,
    /// Group whose first node is the default SSH target
    pub ssh_to: Option<String>,
    /// SSH port on the nodes
    pub ssh_port: u16,
    /// Desired size per group, from `<group>_nodes` / `<group>_nodes_min`
    pub groups: BTreeMap<String, GroupSize>,
    /// Any other option, passed through to the provider
    pub extra: BTreeMap<String, String>,
}

impl ClusterOptions {
    /// Validate a flat option map
    pub fn from_map(mut options: BTreeMap<String, String>) -> ClusterResult<Self> {
        apply_renames("cluster", &mut options, CLUSTER_KEY_RENAMES);
        let legacy_min: Vec<String> =
            options.keys().filter(|k| MIN_NODES_KEY.is_match(k)).cloned().collect();
        for key in legacy_min {
            let group = MIN_NODES_KEY.replace(&key, "$1").into_owned();
            let renamed = format!("{}_nodes_min", group);
            warn!("cluster: option `{}` is deprecated, use `{}` instead", key, renamed);
            if let Some(value) = options.remove(&key) {
                options.entry(renamed).or_insert(value);
            }
        }

        let options = validate_options("cluster", CLUSTER_OPTIONS, options, |_| true)?;

        let mut groups: BTreeMap<String, GroupSize> = BTreeMap::new();
        let mut extra = BTreeMap::new();
        for (key, value) in &options {
            if CLUSTER_OPTIONS.iter().any(|s| s.name == key.as_str()) {
                continue;
            }
            let count = |v: &str| {
                v.trim().parse::<u32>().map_err(|_| {
                    ClusterError::ConfigurationError(format!(
                        "cluster: option `{}` must be a non-negative integer, got `{}`",
                        key, v
                    ))
                })
            };
            if let Some(group) = key.strip_suffix("_nodes_min") {
                validate_group_name(group)?;
                groups.entry(group.to_string()).or_default().min_nodes = Some(count(value)?);
            } else if let Some(group) = key.strip_suffix("_nodes") {
                validate_group_name(group)?;
                groups.entry(group.to_string()).or_default().nodes = count(value)?;
            } else {
                extra.insert(key.clone(), value.clone());
            }
        }

        let get = |k: &str| options.get(k).cloned().unwrap_or_default();
        let mut security_groups = split_list(&get("security_group"));
        for sg in split_list(&get("security_groups")) {
            if !security_groups.contains(&sg) {
                security_groups.push(sg);
            }
        }

        Ok(ClusterOptions {
            cloud: get("cloud"),
            login: get("login"),
            setup: get("setup"),
            flavor: get("flavor"),
            image_id: get("image_id"),
            floating_ip: parse_bool(&get("floating_ip")).unwrap_or(false),
            security_groups,
            image_userdata: get("image_userdata"),
            network_ids: split_list(&get("network_ids")),
            ssh_to: options.get("ssh_to").filter(|s| !s.trim().is_empty()).cloned(),
            ssh_port: get("ssh_port").trim().parse().unwrap_or(DEFAULT_SSH_PORT),
            groups,
            extra,
        })
    }

    /// Flatten back into the persisted string map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("cloud".into(), self.cloud.clone());
        map.insert("login".into(), self.login.clone());
        map.insert("setup".into(), self.setup.clone());
        map.insert("flavor".into(), self.flavor.clone());
        map.insert("image_id".into(), self.image_id.clone());
        map.insert("floating_ip".into(), self.floating_ip.to_string());
        if !self.security_groups.is_empty() {
            map.insert("security_groups".into(), self.security_groups.join(","));
        }
        map.insert("image_userdata".into(), self.image_userdata.clone());
        if !self.network_ids.is_empty() {
            map.insert("network_ids".into(), self.network_ids.join(","));
        }
        if let Some(ssh_to) = &self.ssh_to {
            map.insert("ssh_to".into(), ssh_to.clone());
        }
        map.insert("ssh_port".into(), self.ssh_port.to_string());
        for (group, size) in &self.groups {
            map.insert(format!("{}_nodes", group), size.nodes.to_string());
            if let Some(min) = size.min_nodes {
                map.insert(format!("{}_nodes_min", group), min.to_string());
            }
        }
        map
    }

    /// Options with a group's overrides applied on top
    pub fn for_group(&self, overrides: &BTreeMap<String, String>) -> ClusterResult<Self> {
        if overrides.is_empty() {
            return Ok(self.clone());
        }
        let mut map = self.to_map();
        if overrides.contains_key("security_group") {
            map.remove("security_groups");
        }
        map.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self::from_map(map)
    }

    /// Override the desired node count of a group
    pub fn set_group_nodes(&mut self, group: &str, nodes: u32) -> ClusterResult<()> {
        validate_group_name(group)?;
        self.groups.entry(group.to_string()).or_default().nodes = nodes;
        Ok(())
    }
}

/// A cluster section: the options plus per-group overrides
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTemplate {
    /// Template name
    pub name: String,
    /// Global options
    pub options: ClusterOptions,
    /// Group-specific overrides, `group -> {option: value}`
    pub group_options: BTreeMap<String, BTreeMap<String, String>>,
}

/// A cloud section
#[derive(Debug, Clone, PartialEq)]
pub struct CloudConfig {
    /// Section name
    pub name: String,
    /// Backend implementing the cloud
    pub provider: String,
    /// Provider-specific options
    pub options: BTreeMap<String, String>,
}

/// A login section: how to reach and authenticate on the nodes
#[derive(Clone, PartialEq)]
pub struct LoginConfig {
    /// Section name
    pub name: String,
    /// Account on the image
    pub image_user: String,
    /// Whether configuration runs with privilege escalation
    pub image_sudo: bool,
    /// User that privilege escalation switches to
    pub image_user_sudo: String,
    /// Name of the key pair registered on the cloud
    pub user_key_name: String,
    /// Private key used for SSH
    pub user_key_private: PathBuf,
    /// Public key imported into the cloud
    pub user_key_public: Option<PathBuf>,
    /// Password authentication fallback
    pub image_user_password: Option<String>,
    /// User data passed to the image
    pub image_userdata: String,
}

impl fmt::Debug for LoginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginConfig")
            .field("name", &self.name)
            .field("image_user", &self.image_user)
            .field("image_sudo", &self.image_sudo)
            .field("image_user_sudo", &self.image_user_sudo)
            .field("user_key_name", &self.user_key_name)
            .field("user_key_private", &self.user_key_private)
            .field("user_key_public", &self.user_key_public)
            .field("image_user_password", &self.image_user_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl LoginConfig {
    /// Validate a login section
    pub fn from_map(name: &str, options: BTreeMap<String, String>) -> ClusterResult<Self> {
        let entity = format!("login/{}", name);
        let options = validate_options(&entity, LOGIN_OPTIONS, options, |_| false)?;
        let get = |k: &str| options.get(k).cloned().unwrap_or_default();
        Ok(LoginConfig {
            name: name.to_string(),
            image_user: get("image_user"),
            image_sudo: parse_bool(&get("image_sudo")).unwrap_or(true),
            image_user_sudo: get("image_user_sudo"),
            user_key_name: get("user_key_name"),
            user_key_private: expand_path(&get("user_key_private")),
            user_key_public: options.get("user_key_public").map(|p| expand_path(p)),
            image_user_password: options.get("image_user_password").cloned(),
            image_userdata: get("image_userdata"),
        })
    }
}

/// A setup section: how the configuration-management tool is driven
#[derive(Debug, Clone, PartialEq)]
pub struct SetupConfig {
    /// Section name
    pub name: String,
    /// Configuration-management backend
    pub provider: String,
    /// Playbook run against the cluster
    pub playbook_path: Option<PathBuf>,
    /// Explicit path of the tool's executable
    pub command: Option<PathBuf>,
    /// Extra arguments always passed to the tool
    pub extra_args: Vec<String>,
    /// Roles of each node group, from `<group>_groups`
    pub group_roles: BTreeMap<String, Vec<String>>,
    /// Variables for every group, from `global_var_<var>`
    pub global_vars: BTreeMap<String, String>,
    /// Variables of a single group, from `<group>_var_<var>`
    pub group_vars: BTreeMap<String, BTreeMap<String, String>>,
    /// Remaining options, handed to the tool as global variables
    pub options: BTreeMap<String, String>,
}

impl SetupConfig {
    /// Validate a setup section, splitting out roles and variables
    pub fn from_map(name: &str, mut options: BTreeMap<String, String>) -> ClusterResult<Self> {
        let entity = format!("setup/{}", name);
        apply_renames(&entity, &mut options, SETUP_KEY_RENAMES);
        let options = validate_options(&entity, SETUP_OPTIONS, options, |_| true)?;

        let mut group_roles = BTreeMap::new();
        let mut global_vars = BTreeMap::new();
        let mut group_vars: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut rest = BTreeMap::new();
        for (key, value) in &options {
            if SETUP_OPTIONS.iter().any(|s| s.name == key.as_str()) {
                continue;
            }
            if let Some(var) = key.strip_prefix("global_var_") {
                global_vars.insert(var.to_string(), value.clone());
            } else if let Some((group, var)) = key.split_once("_var_") {
                group_vars.entry(group.to_string()).or_default().insert(var.to_string(), value.clone());
            } else if let Some(group) = key.strip_suffix("_groups") {
                let roles = split_list(value)
                    .into_iter()
                    .map(|role| match RENAMED_ROLES.iter().find(|(old, _)| *old == role) {
                        Some((old, new)) => {
                            warn!("{}: group `{}` has been renamed to `{}`", entity, old, new);
                            new.to_string()
                        }
                        None => role,
                    })
                    .collect();
                group_roles.insert(group.to_string(), roles);
            } else {
                rest.insert(key.clone(), value.clone());
            }
        }

        Ok(SetupConfig {
            name: name.to_string(),
            provider: options.get("provider").cloned().unwrap_or_else(|| "ansible".to_string()),
            playbook_path: options.get("playbook_path").map(|p| expand_path(p)),
            command: options.get("ansible_command").map(|p| expand_path(p)),
            extra_args: options
                .get("ansible_extra_args")
                .map(|a| a.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            group_roles,
            global_vars,
            group_vars,
            options: rest,
        })
    }
}

impl CloudConfig {
    /// Validate a cloud section
    pub fn from_map(name: &str, mut options: BTreeMap<String, String>) -> ClusterResult<Self> {
        let entity = format!("cloud/{}", name);
        apply_renames(&entity, &mut options, CLOUD_KEY_RENAMES);
        let mut options = validate_options(&entity, CLOUD_OPTIONS, options, |_| true)?;
        let provider = options.remove("provider").unwrap_or_default();
        Ok(CloudConfig { name: name.to_string(), provider, options })
    }
}

/// A template with every section it references resolved
#[derive(Debug, Clone)]
pub struct ResolvedTemplate {
    /// The cluster section
    pub template: ClusterTemplate,
    /// Its cloud
    pub cloud: CloudConfig,
    /// Its login
    pub login: LoginConfig,
    /// Its setup
    pub setup: SetupConfig,
}

type RawSection = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Default, Deserialize)]
struct RawClusterSection {
    #[serde(default)]
    groups: BTreeMap<String, RawSection>,
    #[serde(flatten)]
    options: RawSection,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    cloud: BTreeMap<String, RawSection>,
    #[serde(default)]
    login: BTreeMap<String, RawSection>,
    #[serde(default)]
    setup: BTreeMap<String, RawSection>,
    #[serde(default)]
    cluster: BTreeMap<String, RawClusterSection>,
}

impl RawConfig {
    fn merge(&mut self, other: RawConfig) {
        self.cloud.extend(other.cloud);
        self.login.extend(other.login);
        self.setup.extend(other.setup);
        self.cluster.extend(other.cluster);
    }
}

fn scalar_to_string(entity: &str, key: &str, value: &serde_yaml::Value) -> ClusterResult<String> {
    use serde_yaml::Value;
    match value {
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        Value::Sequence(items) => {
            let items: ClusterResult<Vec<String>> =
                items.iter().map(|v| scalar_to_string(entity, key, v)).collect();
            Ok(items?.join(","))
        }
        _ => Err(ClusterError::ConfigurationError(format!(
            "{}: option `{}` must be a scalar or a list",
            entity, key
        ))),
    }
}

fn flatten(entity: &str, section: &RawSection) -> ClusterResult<BTreeMap<String, String>> {
    section
        .iter()
        .map(|(k, v)| Ok((k.clone(), scalar_to_string(entity, k, v)?)))
        .collect()
}

/// The parsed configuration file
#[derive(Debug, Default)]
pub struct Configuration {
    raw: RawConfig,
}

impl Configuration {
    /// Load the configuration file and every `*.yaml` file in `<path>.d/`
    pub fn load(path: &Path) -> ClusterResult<Self> {
        let mut raw = RawConfig::default();
        let mut found = false;

        if path.is_file() {
            raw.merge(Self::read_file(path)?);
            found = true;
        }

        let mut dir = path.as_os_str().to_owned();
        dir.push(".d");
        let dir = PathBuf::from(dir);
        if dir.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.is_file()
                        && matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
                })
                .collect();
            files.sort();
            for file in files {
                raw.merge(Self::read_file(&file)?);
                found = true;
            }
        }

        if !found {
            return Err(ClusterError::ConfigurationError(format!(
                "Unable to read configuration file `{}`",
                path.display()
            )));
        }
        Ok(Configuration { raw })
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> ClusterResult<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ClusterError::ConfigurationError(format!("Failed to parse configuration: {}", e)))?;
        Ok(Configuration { raw })
    }

    fn read_file(path: &Path) -> ClusterResult<RawConfig> {
        debug!("reading configuration file {}", path.display());
        let file = fs::File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| {
            ClusterError::ConfigurationError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Template names with the node counts they declare
    pub fn templates(&self) -> BTreeMap<String, Vec<(String, String)>> {
        self.raw
            .cluster
            .iter()
            .map(|(name, section)| {
                let counts = section
                    .options
                    .iter()
                    .filter_map(|(k, v)| {
                        let group = k.strip_suffix("_nodes")?;
                        Some((group.to_string(), scalar_to_string(name, k, v).ok()?))
                    })
                    .collect();
                (name.clone(), counts)
            })
            .collect()
    }

    /// Validate and return a cluster template
    pub fn cluster_template(&self, name: &str) -> ClusterResult<ClusterTemplate> {
        let section = self.raw.cluster.get(name).ok_or_else(|| {
            ClusterError::ConfigurationError(format!("no cluster template `{}` in configuration", name))
        })?;
        let entity = format!("cluster/{}", name);
        let options = ClusterOptions::from_map(flatten(&entity, &section.options)?)?;
        let mut group_options = BTreeMap::new();
        for (group, overrides) in &section.groups {
            validate_group_name(group)?;
            debug!("extra group options ({}) detected for {}", group, name);
            group_options.insert(group.clone(), flatten(&entity, overrides)?);
        }
        Ok(ClusterTemplate { name: name.to_string(), options, group_options })
    }

    /// Validate and return a cloud section
    pub fn cloud(&self, name: &str) -> ClusterResult<CloudConfig> {
        let section = self.section(&self.raw.cloud, "cloud", name)?;
        CloudConfig::from_map(name, flatten(name, section)?)
    }

    /// Validate and return a login section
    pub fn login(&self, name: &str) -> ClusterResult<LoginConfig> {
        let section = self.section(&self.raw.login, "login", name)?;
        LoginConfig::from_map(name, flatten(name, section)?)
    }

    /// Validate and return a setup section
    pub fn setup(&self, name: &str) -> ClusterResult<SetupConfig> {
        let section = self.section(&self.raw.setup, "setup", name)?;
        SetupConfig::from_map(name, flatten(name, section)?)
    }

    /// Resolve a template and the sections it refers to
    pub fn resolve(&self, template: &str) -> ClusterResult<ResolvedTemplate> {
        let template = self.cluster_template(template)?;
        let cloud = self.cloud(&template.options.cloud)?;
        let login = self.login(&template.options.login)?;
        let setup = self.setup(&template.options.setup)?;
        Ok(ResolvedTemplate { template, cloud, login, setup })
    }

    fn section<'a>(
        &self,
        sections: &'a BTreeMap<String, RawSection>,
        kind: &str,
        name: &str,
    ) -> ClusterResult<&'a RawSection> {
        sections.get(name).ok_or_else(|| {
            ClusterError::ConfigurationError(format!("no {} section `{}` in configuration", kind, name))
        })
    }
}

/// Runtime settings of the cluster controller
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Directory holding state and known-hosts files
    pub storage_path: PathBuf,

    /// Encoding of the state files
    pub storage_format: StorageFormat,

    /// Deadline for nodes to run and for SSH to answer
    pub startup_timeout: Duration,

    /// Pause between provider polls and SSH retries
    pub polling_interval: Duration,

    /// TCP connect timeout of a single SSH probe
    pub connect_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            storage_path: expand_path(DEFAULT_STORAGE_PATH),
            storage_format: StorageFormat::Yaml,
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT),
            polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

impl ControllerSettings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage directory
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Set the state file encoding
    pub fn storage_format(mut self, format: StorageFormat) -> Self {
        self.storage_format = format;
        self
    }

    /// Set the startup deadline
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Set the polling interval
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the SSH connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the settings
    pub fn build(self) -> ClusterResult<Self> {
        if self.polling_interval.is_zero() {
            return Err(ClusterError::ConfigurationError(
                "polling interval must be greater than zero".to_string(),
            ));
        }
        if self.startup_timeout < self.polling_interval {
            return Err(ClusterError::ConfigurationError(
                "startup timeout must not be shorter than the polling interval".to_string(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn cluster_map() -> BTreeMap<String, String> {
        map(&[
            ("cloud", "lab"),
            ("login", "ubuntu"),
            ("setup", "slurm"),
            ("flavor", "m1.small"),
            ("image_id", "img-1"),
            ("frontend_nodes", "1"),
            ("compute_nodes", "4"),
        ])
    }

    #[test]
    fn test_cluster_defaults() {
        let options = ClusterOptions::from_map(cluster_map()).unwrap();
        assert!(!options.floating_ip);
        assert_eq!(options.ssh_port, DEFAULT_SSH_PORT);
        assert_eq!(options.groups["compute"].nodes, 4);
        assert_eq!(options.groups["frontend"].nodes, 1);
        assert!(options.extra.is_empty());
    }

    #[test]
    fn test_cluster_missing_required() {
        let mut raw = cluster_map();
        raw.remove("image_id");
        match ClusterOptions::from_map(raw).unwrap_err() {
            ClusterError::ConfigurationError(msg) => assert!(msg.contains("image_id")),
            other => panic!("Expected ConfigurationError, got {:?}", other),
        }
    }

    #[test]
    fn test_cluster_rejects_bad_values() {
        let mut raw = cluster_map();
        raw.insert("compute_nodes".into(), "many".into());
        assert!(ClusterOptions::from_map(raw).is_err());

        let mut raw = cluster_map();
        raw.insert("floating_ip".into(), "perhaps".into());
        assert!(ClusterOptions::from_map(raw).is_err());

        let mut raw = cluster_map();
        raw.insert("flavor".into(), "  ".into());
        assert!(ClusterOptions::from_map(raw).is_err());
    }

    #[test]
    fn test_cluster_key_renames() {
        let mut raw = cluster_map();
        raw.remove("setup");
        raw.insert("setup_provider".into(), "slurm".into());
        raw.insert("compute_min_nodes".into(), "2".into());
        let options = ClusterOptions::from_map(raw).unwrap();
        assert_eq!(options.setup, "slurm");
        assert_eq!(options.groups["compute"].min_nodes, Some(2));
        assert_eq!(options.groups["compute"].required(), 2);
    }

    #[test]
    fn test_cluster_map_round_trip() {
        let mut raw = cluster_map();
        raw.insert("security_group".into(), "default, ssh".into());
        raw.insert("network_ids".into(), "net-a,net-b".into());
        raw.insert("availability_zone".into(), "nova".into());
        let options = ClusterOptions::from_map(raw).unwrap();
        assert_eq!(options.security_groups, vec!["default", "ssh"]);
        assert_eq!(options.extra["availability_zone"], "nova");

        let again = ClusterOptions::from_map(options.to_map()).unwrap();
        assert_eq!(again, options);
    }

    #[test]
    fn test_group_overrides() {
        let options = ClusterOptions::from_map(cluster_map()).unwrap();
        let overrides = map(&[("flavor", "m1.xlarge"), ("gpu_type", "a100")]);
        let merged = options.for_group(&overrides).unwrap();
        assert_eq!(merged.flavor, "m1.xlarge");
        assert_eq!(merged.extra["gpu_type"], "a100");
        assert_eq!(merged.image_id, options.image_id);
    }

    #[test]
    fn test_setup_splits_roles_and_vars() {
        let raw = map(&[
            ("frontend_groups", "slurm_master"),
            ("compute_groups", "slurm_clients, ganglia_monitor"),
            ("global_var_slurm_version", "23.02"),
            ("compute_var_mem", "64G"),
            ("ssh_pipelining", "yes"),
        ]);
        let setup = SetupConfig::from_map("slurm", raw).unwrap();
        assert_eq!(setup.provider, "ansible");
        assert_eq!(setup.group_roles["compute"], vec!["slurm_worker", "ganglia_monitor"]);
        assert_eq!(setup.global_vars["slurm_version"], "23.02");
        assert_eq!(setup.group_vars["compute"]["mem"], "64G");
        assert_eq!(setup.options["ansible_ssh_pipelining"], "yes");
    }

    #[test]
    fn test_login_requires_key_file() {
        let raw = map(&[
            ("image_user", "ubuntu"),
            ("image_sudo", "yes"),
            ("user_key_name", "nimbus"),
            ("user_key_private", "/definitely/not/here"),
        ]);
        assert!(LoginConfig::from_map("ubuntu", raw).is_err());
    }

    #[test]
    fn test_login_debug_redacts_password() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "not really a key").unwrap();
        let raw = map(&[
            ("image_user", "ubuntu"),
            ("image_sudo", "no"),
            ("user_key_name", "nimbus"),
            ("user_key_private", key.path().to_str().unwrap()),
            ("image_user_password", "hunter2"),
        ]);
        let login = LoginConfig::from_map("ubuntu", raw).unwrap();
        assert!(!login.image_sudo);
        assert_eq!(login.image_user_sudo, "root");
        assert!(!format!("{:?}", login).contains("hunter2"));
    }

    #[test]
    fn test_login_rejects_unknown_keys() {
        let raw = map(&[("image_user", "ubuntu"), ("image_sudo", "yes"), ("colour", "blue")]);
        assert!(LoginConfig::from_map("ubuntu", raw).is_err());
    }

    #[test]
    fn test_configuration_from_yaml() {
        let yaml = r#"
cloud:
  lab:
    provider: static
    tenant_name: research
    hosts: [10.0.0.1, 10.0.0.2]
cluster:
  slurm:
    cloud: lab
    login: ubuntu
    setup: slurm
    flavor: m1.small
    image_id: img-1
    frontend_nodes: 1
    compute_nodes: 2
    floating_ip: yes
    groups:
      compute:
        flavor: m1.large
"#;
        let config = Configuration::from_yaml_str(yaml).unwrap();
        let template = config.cluster_template("slurm").unwrap();
        assert!(template.options.floating_ip);
        assert_eq!(template.group_options["compute"]["flavor"], "m1.large");

        let cloud = config.cloud("lab").unwrap();
        assert_eq!(cloud.provider, "static");
        assert_eq!(cloud.options["project_name"], "research");
        assert_eq!(cloud.options["hosts"], "10.0.0.1,10.0.0.2");

        let templates = config.templates();
        assert_eq!(templates["slurm"].len(), 2);
        assert!(config.cluster_template("missing").is_err());
    }

    #[test]
    fn test_configuration_directory_merge() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("config.yaml");
        fs::write(&main, "cloud:\n  a: { provider: static }\n").unwrap();
        let extra = dir.path().join("config.yaml.d");
        fs::create_dir(&extra).unwrap();
        fs::write(extra.join("10-more.yaml"), "cloud:\n  b: { provider: static }\n").unwrap();
        fs::write(extra.join("README"), "ignored").unwrap();

        let config = Configuration::load(&main).unwrap();
        assert!(config.cloud("a").is_ok());
        assert!(config.cloud("b").is_ok());

        assert!(Configuration::load(&dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("NIMBUS_TEST_DIR", "/srv/nimbus");
        assert_eq!(expand_path("$NIMBUS_TEST_DIR/keys"), PathBuf::from("/srv/nimbus/keys"));
        assert_eq!(expand_path("${NIMBUS_TEST_DIR}/x"), PathBuf::from("/srv/nimbus/x"));
        assert_eq!(expand_path("/plain"), PathBuf::from("/plain"));
    }

    #[test]
    fn test_settings_validation() {
        assert!(ControllerSettings::new().build().is_ok());
        assert!(ControllerSettings::new().polling_interval(Duration::ZERO).build().is_err());
        assert!(ControllerSettings::new()
            .startup_timeout(Duration::from_secs(1))
            .polling_interval(Duration::from_secs(5))
            .build()
            .is_err());
    }
}
