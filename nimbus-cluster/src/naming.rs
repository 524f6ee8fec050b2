//! Node identity allocation.
//!
//! A node's name is `<cluster>-<group><index>` with a zero-padded index.
//! The name is the only place group membership is recorded, so every
//! function here works by parsing names back into `(group, index)`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ClusterError, ClusterResult};
use crate::node::Node;

/// Width of the zero-padded index
pub const INDEX_WIDTH: usize = 3;

static CLUSTER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap());

// Groups must not end in a digit, otherwise the index boundary is ambiguous.
static GROUP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]([A-Za-z0-9-]*[A-Za-z])?$").unwrap());

/// Check that a cluster name is usable as a hostname prefix
pub fn validate_cluster_name(name: &str) -> ClusterResult<()> {
    if CLUSTER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ClusterError::ConfigurationError(format!(
            "`{}` is not a valid cluster name: use letters, digits and hyphens only",
            name
        )))
    }
}

/// Check that a group name can be embedded in node names
pub fn validate_group_name(group: &str) -> ClusterResult<()> {
    if GROUP_NAME.is_match(group) {
        Ok(())
    } else {
        Err(ClusterError::ConfigurationError(format!(
            "`{}` is not a valid node group name: it must start and end with a letter \
             and contain only letters, digits and hyphens",
            group
        )))
    }
}

/// Build the name of node `index` of `group`
pub fn node_name(cluster: &str, group: &str, index: u32) -> String {
    format!("{}-{}{:0width$}", cluster, group, index, width = INDEX_WIDTH)
}

/// Recover `(group, index)` from a node name issued for `cluster`
pub fn parse_node_name(cluster: &str, name: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(cluster)?.strip_prefix('-')?;
    let digits = rest.len() - rest.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == rest.len() {
        return None;
    }
    let (group, index) = rest.split_at(rest.len() - digits);
    let index = index.parse::<u32>().ok()?;
    if index == 0 {
        return None;
    }
    Some((group.to_string(), index))
}

/// Indices currently allocated in `group`, unordered
pub fn group_indices<'a>(
    nodes: &'a [Node],
    cluster: &'a str,
    group: &'a str,
) -> impl Iterator<Item = u32> + 'a {
    nodes
        .iter()
        .filter_map(move |n| parse_node_name(cluster, &n.name))
        .filter(move |(g, _)| g == group)
        .map(|(_, i)| i)
}

/// Smallest index greater than every index present in `group`, or 1
pub fn next_index(nodes: &[Node], cluster: &str, group: &str) -> u32 {
    group_indices(nodes, cluster, group).max().unwrap_or(0) + 1
}

/// Next index taking the group's high-water mark into account
///
/// `watermark` is the highest index ever issued in the group, so indices
/// of removed nodes are never handed out again.
pub fn allocate(nodes: &[Node], cluster: &str, group: &str, watermark: u32) -> u32 {
    next_index(nodes, cluster, group).max(watermark + 1)
}

/// Names of the `count` highest-indexed nodes of `group`, highest first
///
/// The names are returned as stored, which need not be zero-padded.
pub fn highest_names(nodes: &[Node], cluster: &str, group: &str, count: usize) -> Vec<String> {
    let mut indexed: Vec<(u32, &str)> = nodes
        .iter()
        .filter_map(|n| match parse_node_name(cluster, &n.name) {
            Some((g, i)) if g == group => Some((i, n.name.as_str())),
            _ => None,
        })
        .collect();
    indexed.sort_unstable_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    indexed.into_iter().take(count).map(|(_, name)| name.to_string()).collect()
}

/// Group of a node, if its name belongs to `cluster`
pub fn group_of(cluster: &str, node: &Node) -> Option<String> {
    parse_node_name(cluster, &node.name).map(|(g, _)| g)
}
