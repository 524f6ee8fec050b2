use std::time::Duration;

use nimbus_cluster::testing::FakeProbe;
use nimbus_cluster::{ClusterError, HostKey, KnownHosts, Node, ProbeError, SshEndpoint, SshResolver, Verdict};

const A: &str = "10.0.0.5";
const B: &str = "203.0.113.5";

fn node() -> Node {
    let mut node = Node::new("i-5", "lab-frontend001");
    node.private_ips.push(A.to_string());
    node.public_ips.push(B.to_string());
    node
}

fn key() -> HostKey {
    HostKey::new("ssh-ed25519", "AAAAC3NzaC1lZDI1NTE5AAAAIB")
}

#[tokio::test]
async fn test_second_address_after_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("lab.known_hosts");
    let probe = FakeProbe::new();
    probe.script(B, vec![Err(ProbeError::Unreachable("booting".into())), Ok(vec![key()])]);

    let resolver = SshResolver::new(&probe, &known_hosts, Duration::from_millis(10), Duration::from_secs(5));
    let endpoint = resolver.resolve(&node(), 22).await.unwrap();

    assert_eq!(endpoint, SshEndpoint { address: B.to_string(), port: 22 });
    assert_eq!(probe.attempts(), vec![A, B, A, B]);
    let record = KnownHosts::load(&known_hosts).unwrap();
    assert_eq!(record.verify(B, &key()), Verdict::Trusted);
    assert!(!record.contains_host(A));
}

#[tokio::test]
async fn test_timeout_leaves_no_state() {
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("lab.known_hosts");
    let probe = FakeProbe::new();

    let resolver = SshResolver::new(&probe, &known_hosts, Duration::from_millis(10), Duration::from_millis(60));
    let err = resolver.resolve(&node(), 22).await.unwrap_err();

    assert!(matches!(err, ClusterError::TimeoutError(_)));
    assert!(probe.attempts().len() >= 4);
    assert!(!known_hosts.exists());
}

#[tokio::test]
async fn test_private_address_preferred() {
    let dir = tempfile::tempdir().unwrap();
    let probe = FakeProbe::new();
    probe.script(A, vec![Ok(vec![key()])]);
    probe.script(B, vec![Ok(vec![key()])]);

    let resolver = SshResolver::new(&probe, dir.path().join("k"), Duration::from_millis(10), Duration::from_secs(1));
    let endpoint = resolver.resolve(&node(), 2222).await.unwrap();
    assert_eq!(endpoint.address, A);
    assert_eq!(endpoint.port, 2222);

    let record = KnownHosts::load(&dir.path().join("k")).unwrap();
    assert!(record.contains_host("[10.0.0.5]:2222"));
}

#[tokio::test]
async fn test_mismatched_host_key_disqualifies_address() {
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("lab.known_hosts");
    let mut pinned = KnownHosts::new();
    pinned.merge(A, &[HostKey::new("ssh-ed25519", "AAAAold")]);
    pinned.merge("192.0.2.1", &[HostKey::new("ssh-rsa", "AAAAother")]);
    pinned.save(&known_hosts).unwrap();

    let probe = FakeProbe::new();
    probe.script(A, vec![Ok(vec![key()])]);
    probe.script(B, vec![Err(ProbeError::Unreachable("slow".into())), Ok(vec![key()])]);

    let resolver = SshResolver::new(&probe, &known_hosts, Duration::from_millis(10), Duration::from_secs(5));
    let endpoint = resolver.resolve(&node(), 22).await.unwrap();
    assert_eq!(endpoint.address, B);
    // A is dropped after the mismatch and never probed again
    assert_eq!(probe.attempts(), vec![A, B, B]);
    // no credentials go to a server whose key contradicts the pinned one
    assert_eq!(probe.authenticated(), vec![B]);

    let record = KnownHosts::load(&known_hosts).unwrap();
    assert_eq!(record.verify(A, &HostKey::new("ssh-ed25519", "AAAAold")), Verdict::Trusted);
    assert!(record.contains_host("192.0.2.1"));
    assert_eq!(record.verify(B, &key()), Verdict::Trusted);
}

#[tokio::test]
async fn test_protocol_errors_on_every_address() {
    let dir = tempfile::tempdir().unwrap();
    let probe = FakeProbe::new();
    probe.script(A, vec![Err(ProbeError::Protocol("authentication failed".into()))]);
    probe.script(B, vec![Err(ProbeError::Protocol("authentication failed".into()))]);

    let resolver = SshResolver::new(&probe, dir.path().join("k"), Duration::from_millis(10), Duration::from_secs(5));
    let err = resolver.resolve(&node(), 22).await.unwrap_err();
    assert!(matches!(err, ClusterError::SshError(_)));
    assert_eq!(probe.attempts().len(), 2);
}

#[tokio::test]
async fn test_trusted_file_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let trusted_path = dir.path().join("global_known_hosts");
    std::fs::write(&trusted_path, format!("{} ssh-ed25519 AAAAglobal\n", A)).unwrap();

    let probe = FakeProbe::new();
    probe.script(A, vec![Ok(vec![key()])]);
    probe.script(B, vec![Ok(vec![key()])]);

    let resolver = SshResolver::new(&probe, dir.path().join("k"), Duration::from_millis(10), Duration::from_secs(1))
        .with_trusted_file(&trusted_path)
        .unwrap();
    let endpoint = resolver.resolve(&node(), 22).await.unwrap();
    assert_eq!(endpoint.address, B);
    assert_eq!(probe.authenticated(), vec![B]);
}

#[tokio::test]
async fn test_node_without_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let probe = FakeProbe::new();
    let resolver = SshResolver::new(&probe, dir.path().join("k"), Duration::from_millis(10), Duration::from_secs(1));
    let err = resolver.resolve(&Node::new("i-1", "lab-compute001"), 22).await.unwrap_err();
    assert!(matches!(err, ClusterError::SshError(_)));
    assert!(probe.attempts().is_empty());
}
