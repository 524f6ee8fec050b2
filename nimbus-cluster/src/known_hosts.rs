//! Per-cluster SSH known-hosts record, in OpenSSH format.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use log::{debug, warn};

use crate::error::ClusterResult;

/// A host key offered by a server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    /// Key type, e.g. `ssh-ed25519`
    pub key_type: String,
    /// Base64 encoded key material
    pub key: String,
}

impl HostKey {
    /// Create a host key
    pub fn new(key_type: impl Into<String>, key: impl Into<String>) -> Self {
        HostKey { key_type: key_type.into(), key: key.into() }
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key_type, self.key)
    }
}

/// Result of checking a key against the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The same key is pinned for the host
    Trusted,
    /// Nothing is pinned for this host and key type
    Unknown,
    /// A different key of the same type is pinned
    Mismatch,
}

/// Host name as written in a known-hosts file
pub fn host_pattern(address: &str, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{}]:{}", address, port)
    }
}

/// Mapping `host -> {key type -> key}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownHosts {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl KnownHosts {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a record; a missing file yields an empty record
    pub fn load(path: &Path) -> ClusterResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    /// Parse OpenSSH known-hosts text
    ///
    /// Hashed host names and `@cert-authority`/`@revoked` lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut record = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(hosts), Some(key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
            else {
                warn!("skipping malformed known-hosts line {}", lineno + 1);
                continue;
            };
            if hosts.starts_with('|') {
                debug!("skipping hashed known-hosts entry on line {}", lineno + 1);
                continue;
            }
            for host in hosts.split(',') {
                record
                    .entries
                    .entry(host.to_string())
                    .or_default()
                    .entry(key_type.to_string())
                    .or_insert_with(|| key.to_string());
            }
        }
        record
    }

    /// Whether any key is pinned for `host`
    pub fn contains_host(&self, host: &str) -> bool {
        self.entries.contains_key(host)
    }

    /// Keys pinned for `host`
    pub fn keys(&self, host: &str) -> Vec<HostKey> {
        self.entries
            .get(host)
            .map(|keys| keys.iter().map(|(t, k)| HostKey::new(t.clone(), k.clone())).collect())
            .unwrap_or_default()
    }

    /// Number of pinned hosts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pinned
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check `key` against what is pinned for `host`
    pub fn verify(&self, host: &str, key: &HostKey) -> Verdict {
        match self.entries.get(host).and_then(|keys| keys.get(&key.key_type)) {
            Some(pinned) if *pinned == key.key => Verdict::Trusted,
            Some(_) => Verdict::Mismatch,
            None => Verdict::Unknown,
        }
    }

    /// Pin keys for `host`, leaving existing entries untouched
    ///
    /// Returns the number of keys added.
    pub fn merge(&mut self, host: &str, keys: &[HostKey]) -> usize {
        let pinned = self.entries.entry(host.to_string()).or_default();
        let mut added = 0;
        for key in keys {
            if !pinned.contains_key(&key.key_type) {
                pinned.insert(key.key_type.clone(), key.key.clone());
                added += 1;
            }
        }
        added
    }

    /// Add every entry of `other` not already present
    pub fn extend(&mut self, other: &KnownHosts) {
        for (host, keys) in &other.entries {
            let pinned = self.entries.entry(host.clone()).or_default();
            for (key_type, key) in keys {
                pinned.entry(key_type.clone()).or_insert_with(|| key.clone());
            }
        }
    }

    /// Write the whole record to `path`
    pub fn save(&self, path: &Path) -> ClusterResult<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        file.write_all(self.to_string().as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl fmt::Display for KnownHosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (host, keys) in &self.entries {
            for (key_type, key) in keys {
                writeln!(f, "{} {} {}", host, key_type, key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
10.0.0.1,node1 ssh-ed25519 AAAAC3Nza1
[10.0.0.2]:2222 ssh-rsa AAAAB3Nza2 root@node2
|1|abc=|def= ssh-rsa AAAAhashed
@cert-authority *.example ssh-rsa AAAAca
garbage
";

    #[test]
    fn test_parse_openssh_format() {
        let record = KnownHosts::parse(SAMPLE);
        assert_eq!(record.len(), 3);
        assert_eq!(record.keys("node1"), vec![HostKey::new("ssh-ed25519", "AAAAC3Nza1")]);
        assert!(record.contains_host("[10.0.0.2]:2222"));
    }

    #[test]
    fn test_verify() {
        let record = KnownHosts::parse(SAMPLE);
        assert_eq!(record.verify("10.0.0.1", &HostKey::new("ssh-ed25519", "AAAAC3Nza1")), Verdict::Trusted);
        assert_eq!(record.verify("10.0.0.1", &HostKey::new("ssh-ed25519", "other")), Verdict::Mismatch);
        assert_eq!(record.verify("10.0.0.1", &HostKey::new("ssh-rsa", "x")), Verdict::Unknown);
        assert_eq!(record.verify("10.9.9.9", &HostKey::new("ssh-rsa", "x")), Verdict::Unknown);
    }

    #[test]
    fn test_merge_is_additive() {
        let mut record = KnownHosts::parse(SAMPLE);
        let added = record.merge(
            "10.0.0.1",
            &[HostKey::new("ssh-ed25519", "replacement"), HostKey::new("ssh-rsa", "AAAAnew")],
        );
        assert_eq!(added, 1);
        assert_eq!(record.verify("10.0.0.1", &HostKey::new("ssh-ed25519", "AAAAC3Nza1")), Verdict::Trusted);
        assert_eq!(record.keys("node1").len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.known_hosts");
        assert!(KnownHosts::load(&path).unwrap().is_empty());

        let mut record = KnownHosts::new();
        record.merge(&host_pattern("10.0.0.5", 22), &[HostKey::new("ssh-ed25519", "AAAA5")]);
        record.merge(&host_pattern("10.0.0.6", 2022), &[HostKey::new("ssh-rsa", "AAAA6")]);
        record.save(&path).unwrap();

        let loaded = KnownHosts::load(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.contains_host("[10.0.0.6]:2022"));
    }
}
