//! Persistence of cluster state.
//!
//! Each cluster is stored as one file `<storage>/<name>.<ext>` in the
//! configured [`StorageFormat`]. Files written by older releases, which
//! keyed nodes by group, are still readable.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeState};

/// Encoding of state files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageFormat {
    /// Human readable YAML
    #[default]
    Yaml,
    /// JSON
    Json,
    /// Compact binary encoding
    Binary,
}

impl StorageFormat {
    /// All formats, in lookup order
    pub const ALL: [StorageFormat; 3] = [StorageFormat::Yaml, StorageFormat::Json, StorageFormat::Binary];

    /// File extension used for the format
    pub fn extension(&self) -> &'static str {
        match self {
            StorageFormat::Yaml => "yaml",
            StorageFormat::Json => "json",
            StorageFormat::Binary => "bin",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }
}

impl std::str::FromStr for StorageFormat {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Ok(StorageFormat::Yaml),
            "json" => Ok(StorageFormat::Json),
            "bin" | "binary" => Ok(StorageFormat::Binary),
            other => Err(ClusterError::ConfigurationError(format!(
                "unknown storage format `{}`",
                other
            ))),
        }
    }
}

/// Everything persisted about one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Cluster name
    pub name: String,

    /// Template the cluster was created from
    pub template: String,

    /// Validated cluster options, flattened
    #[serde(default)]
    pub options: BTreeMap<String, String>,

    /// Inventory
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Highest index ever issued, per group
    #[serde(default)]
    pub watermarks: BTreeMap<String, u32>,
}

impl ClusterRecord {
    /// Create an empty record
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        ClusterRecord {
            name: name.into(),
            template: template.into(),
            options: BTreeMap::new(),
            nodes: Vec::new(),
            watermarks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyNode {
    #[serde(default)]
    cluster_name: Option<String>,
    name: String,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    preferred_ip: Option<String>,
    #[serde(default)]
    ips: Vec<String>,
}

// Older files wrote option values as native scalars
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegacyValue {
    Text(String),
    Flag(bool),
    Number(serde_json::Number),
}

impl LegacyValue {
    fn into_string(self) -> String {
        match self {
            LegacyValue::Text(s) => s,
            LegacyValue::Flag(b) => b.to_string(),
            LegacyValue::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    name: String,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, Option<LegacyValue>>,
    #[serde(default)]
    nodes: BTreeMap<String, Vec<LegacyNode>>,
}

fn decode_current(format: StorageFormat, data: &[u8]) -> ClusterResult<ClusterRecord> {
    Ok(match format {
        StorageFormat::Yaml => serde_yaml::from_slice(data)?,
        StorageFormat::Json => serde_json::from_slice(data)?,
        StorageFormat::Binary => bincode::deserialize(data)?,
    })
}

fn decode_legacy(format: StorageFormat, data: &[u8]) -> ClusterResult<ClusterRecord> {
    let legacy: LegacyRecord = match format {
        StorageFormat::Yaml => serde_yaml::from_slice(data)?,
        StorageFormat::Json => serde_json::from_slice(data)?,
        StorageFormat::Binary => {
            return Err(ClusterError::SerializationError(
                "binary state files have no legacy layout".to_string(),
            ))
        }
    };

    let mut record = ClusterRecord::new(
        legacy.name.clone(),
        legacy.template.unwrap_or_else(|| legacy.name.clone()),
    );
    record.options = legacy
        .options
        .into_iter()
        .filter_map(|(key, value)| Some((key, value?.into_string())))
        .collect();
    for entries in legacy.nodes.into_values() {
        for entry in entries {
            let cluster = entry.cluster_name.as_deref().unwrap_or(&legacy.name);
            let name = format!("{}-{}", cluster, entry.name);
            if record.nodes.iter().any(|n| n.name == name) {
                debug!("legacy state lists {} twice, keeping the first entry", name);
                continue;
            }
            let mut node = Node::new(entry.instance_id.unwrap_or_default(), name)
                .with_state(NodeState::Unknown);
            for ip in entry.ips {
                node.private_ips.push(ip);
            }
            if let Some(ip) = entry.preferred_ip {
                node.add_public_ip(ip);
            }
            record.nodes.push(node);
        }
    }
    Ok(record)
}

/// Decode a state file, falling back to the legacy group-keyed layout
pub fn decode(format: StorageFormat, data: &[u8]) -> ClusterResult<ClusterRecord> {
    match decode_current(format, data) {
        Ok(record) => Ok(record),
        Err(current) => decode_legacy(format, data).map_err(|_| current),
    }
}

/// Encode a record
pub fn encode(format: StorageFormat, record: &ClusterRecord) -> ClusterResult<Vec<u8>> {
    Ok(match format {
        StorageFormat::Yaml => serde_yaml::to_string(record)?.into_bytes(),
        StorageFormat::Json => serde_json::to_vec_pretty(record)?,
        StorageFormat::Binary => bincode::serialize(record)?,
    })
}

/// File-system store of cluster records
#[derive(Debug, Clone)]
pub struct StateStore {
    base_dir: PathBuf,
    format: StorageFormat,
}

impl StateStore {
    /// Create a store rooted at `base_dir`, creating it if needed
    pub fn new<P: AsRef<Path>>(base_dir: P, format: StorageFormat) -> ClusterResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).map_err(|e| {
            ClusterError::StorageError(format!("cannot create {}: {}", base_dir.display(), e))
        })?;
        Ok(StateStore { base_dir, format })
    }

    /// Directory holding the state files
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Format new records are written in
    pub fn format(&self) -> StorageFormat {
        self.format
    }

    /// Path of the state file of `name` in the configured format
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", name, self.format.extension()))
    }

    /// Path of a sibling artifact of `name`, e.g. its known-hosts file
    pub fn artifact_path(&self, name: &str, extension: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", name, extension))
    }

    fn existing_path(&self, name: &str) -> Option<(StorageFormat, PathBuf)> {
        std::iter::once(self.format)
            .chain(StorageFormat::ALL.into_iter().filter(|f| *f != self.format))
            .map(|f| (f, self.base_dir.join(format!("{}.{}", name, f.extension()))))
            .find(|(_, path)| path.is_file())
    }

    /// Write a record, replacing any previous state of the same cluster
    pub fn save(&self, record: &ClusterRecord) -> ClusterResult<()> {
        let data = encode(self.format, record)?;
        let path = self.path_for(&record.name);
        let tmp = self.base_dir.join(format!(".{}.{}.tmp", record.name, self.format.extension()));

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp)?;
        file.write_all(&data)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;

        for other in StorageFormat::ALL.into_iter().filter(|f| *f != self.format) {
            let stale = self.base_dir.join(format!("{}.{}", record.name, other.extension()));
            if stale.is_file() {
                debug!("removing stale state file {}", stale.display());
                fs::remove_file(stale)?;
            }
        }

        debug!("Saved cluster {} ({} nodes) to {}", record.name, record.nodes.len(), path.display());
        Ok(())
    }

    /// Read the record of `name`
    pub fn load(&self, name: &str) -> ClusterResult<ClusterRecord> {
        let (format, path) = self
            .existing_path(name)
            .ok_or_else(|| ClusterError::ClusterNotFound(name.to_string()))?;
        let data = fs::read(&path)?;
        decode(format, &data).map_err(|e| {
            ClusterError::StorageError(format!("cannot decode {}: {}", path.display(), e))
        })
    }

    /// Whether state exists for `name`
    pub fn exists(&self, name: &str) -> bool {
        self.existing_path(name).is_some()
    }

    /// Delete every file belonging to `name`
    ///
    /// Only files whose stem is exactly `name` are touched, so deleting
    /// `slurm` leaves `slurm-2` alone.
    pub fn delete(&self, name: &str) -> ClusterResult<()> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(name) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed == 0 {
            warn!("Attempt to delete non-existent cluster {}", name);
        } else {
            debug!("Deleted {} file(s) of cluster {}", removed, name);
        }
        Ok(())
    }

    /// Names of all stored clusters, sorted
    pub fn list(&self) -> ClusterResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).and_then(StorageFormat::from_extension);
            let stem = path.file_stem().and_then(|s| s.to_str());
            if let (Some(_), Some(stem)) = (ext, stem) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str) -> ClusterRecord {
        let mut record = ClusterRecord::new(name, "slurm");
        record.options.insert("flavor".into(), "m1.small".into());
        let mut node = Node::new("i-1", format!("{}-compute001", name)).with_state(NodeState::Running);
        node.private_ips.push("10.0.0.1".into());
        node.extra.insert("zone".into(), "a".into());
        record.nodes.push(node);
        record.watermarks.insert("compute".into(), 3);
        record
    }

    #[test]
    fn test_save_and_load_each_format() {
        for format in StorageFormat::ALL {
            let dir = tempdir().unwrap();
            let store = StateStore::new(dir.path(), format).unwrap();
            let rec = record("alpha");
            store.save(&rec).unwrap();
            assert!(store.path_for("alpha").is_file());
            assert_eq!(store.load("alpha").unwrap(), rec);
        }
    }

    #[test]
    fn test_load_missing_cluster() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), StorageFormat::Json).unwrap();
        assert!(matches!(store.load("ghost"), Err(ClusterError::ClusterNotFound(_))));
        assert!(!store.exists("ghost"));
    }

    #[test]
    fn test_load_falls_back_to_other_format() {
        let dir = tempdir().unwrap();
        StateStore::new(dir.path(), StorageFormat::Json).unwrap().save(&record("beta")).unwrap();

        let store = StateStore::new(dir.path(), StorageFormat::Yaml).unwrap();
        assert!(store.exists("beta"));
        assert_eq!(store.load("beta").unwrap().nodes.len(), 1);

        store.save(&store.load("beta").unwrap()).unwrap();
        assert!(!dir.path().join("beta.json").exists());
        assert!(dir.path().join("beta.yaml").exists());
    }

    #[test]
    fn test_delete_matches_exact_stem() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), StorageFormat::Yaml).unwrap();
        store.save(&record("slurm")).unwrap();
        store.save(&record("slurm-2")).unwrap();
        fs::write(store.artifact_path("slurm", "known_hosts"), "").unwrap();

        store.delete("slurm").unwrap();
        assert!(!store.exists("slurm"));
        assert!(!store.artifact_path("slurm", "known_hosts").exists());
        assert!(store.exists("slurm-2"));
        assert_eq!(store.list().unwrap(), vec!["slurm-2".to_string()]);
    }

    #[test]
    fn test_list_ignores_other_files() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path(), StorageFormat::Yaml).unwrap();
        store.save(&record("a")).unwrap();
        store.save(&record("b")).unwrap();
        fs::write(store.artifact_path("a", "known_hosts"), "").unwrap();
        fs::create_dir(dir.path().join("pools")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_decode_legacy_layout() {
        let yaml = r#"
name: old
template: slurm
options:
  flavor: m1.small
  compute_nodes: 2
  floating_ip: false
  image_userdata:
nodes:
  compute:
    - { cluster_name: old, name: compute001, instance_id: i-1, ips: [10.0.0.1] }
    - { cluster_name: old, name: compute001, instance_id: i-dup }
  frontend:
    - { name: frontend001, instance_id: i-2, preferred_ip: 203.0.113.9 }
"#;
        let record = decode(StorageFormat::Yaml, yaml.as_bytes()).unwrap();
        assert_eq!(record.template, "slurm");
        assert_eq!(record.nodes.len(), 2);
        assert_eq!(record.options.get("flavor").map(String::as_str), Some("m1.small"));
        assert_eq!(record.options.get("compute_nodes").map(String::as_str), Some("2"));
        assert_eq!(record.options.get("floating_ip").map(String::as_str), Some("false"));
        assert!(!record.options.contains_key("image_userdata"));

        let compute = record.nodes.iter().find(|n| n.name == "old-compute001").unwrap();
        assert_eq!(compute.id, "i-1");
        assert_eq!(compute.state, NodeState::Unknown);
        assert_eq!(compute.private_ips, vec!["10.0.0.1"]);

        let frontend = record.nodes.iter().find(|n| n.name == "old-frontend001").unwrap();
        assert_eq!(frontend.preferred_address(), Some("203.0.113.9"));
    }

    #[test]
    fn test_legacy_options_survive_a_save() {
        let dir = tempdir().unwrap();
        let json = r#"{"name": "old", "template": "slurm",
            "options": {"flavor": "m1.small", "compute_nodes": "2"},
            "nodes": {"compute": [{"name": "compute001", "instance_id": "i-1"}]}}"#;
        fs::write(dir.path().join("old.json"), json).unwrap();

        let store = StateStore::new(dir.path(), StorageFormat::Yaml).unwrap();
        let record = store.load("old").unwrap();
        assert_eq!(record.options.len(), 2);
        store.save(&record).unwrap();
        assert_eq!(store.load("old").unwrap().options, record.options);
    }

    #[test]
    fn test_decode_garbage_reports_error() {
        assert!(decode(StorageFormat::Json, b"{ not json").is_err());
        assert!(decode(StorageFormat::Binary, b"\x01").is_err());
    }

    #[test]
    fn test_storage_format_from_str() {
        assert_eq!("YAML".parse::<StorageFormat>().unwrap(), StorageFormat::Yaml);
        assert_eq!("binary".parse::<StorageFormat>().unwrap(), StorageFormat::Binary);
        assert!("pickle".parse::<StorageFormat>().is_err());
    }
}
