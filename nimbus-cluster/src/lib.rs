//! Nimbus cluster lifecycle engine
//!
//! This crate provisions named clusters of virtual machines organised in
//! node groups, keeps their state on disk across invocations, reconciles
//! that state with what the cloud reports, resolves SSH endpoints with
//! host key pinning, and hands configured clusters over to a
//! configuration-management tool.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]
#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod known_hosts;
pub mod naming;
pub mod node;
pub mod poll;
pub mod provider;
pub mod reconcile;
pub mod setup;
pub mod ssh;
pub mod store;

// Fake collaborators shared by unit and integration tests
#[doc(hidden)]
pub mod testing;

pub use cluster::{BatchReport, ClusterController, ClusterPhase, ClusterSummary, ItemOutcome, ItemResult};
pub use config::{
    CloudConfig, ClusterOptions, ClusterTemplate, Configuration, ControllerSettings, GroupSize, LoginConfig,
    ResolvedTemplate, SetupConfig,
};
pub use error::{ClusterError, ClusterResult};
pub use known_hosts::{HostKey, KnownHosts, Verdict};
pub use node::{Node, NodeState};
pub use poll::{Poller, Refresh};
pub use provider::{create_provider, CloudProvider, InstanceRequest, StaticPool};
pub use reconcile::{ReconcileReport, Reconciler};
pub use setup::{create_setup_provider, plan_setup, AnsibleSetup, SetupProvider, SetupRequest};
pub use ssh::{HostProbe, PinnedKeys, ProbeError, Ssh2Probe, SshCredentials, SshEndpoint, SshResolver};
pub use store::{ClusterRecord, StateStore, StorageFormat};
