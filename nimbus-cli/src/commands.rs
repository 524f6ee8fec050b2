//! Execution of the CLI subcommands.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use log::{debug, info, warn};
use nimbus_cluster::config::{expand_path, DEFAULT_CONFIG_PATH, DEFAULT_STORAGE_PATH};
use nimbus_cluster::naming::group_of;
use nimbus_cluster::{
    create_provider, create_setup_provider, BatchReport, ClusterController, ClusterError, ClusterOptions,
    Configuration, ControllerSettings, StateStore,
};
use tokio::process::Command as Process;

use crate::{glob_to_regex, Cli, CliError, Command, RemoteArgs, ResizeArgs, StartArgs};

/// Run a parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let storage = cli.storage.unwrap_or_else(|| expand_path(DEFAULT_STORAGE_PATH));
    let config_path = cli.config.unwrap_or_else(|| expand_path(DEFAULT_CONFIG_PATH));
    fs::create_dir_all(&storage)
        .with_context(|| format!("cannot create storage directory {}", storage.display()))?;
    let settings = ControllerSettings::new().storage_path(&storage).build()?;
    let ctx = Context { config_path, settings };

    match cli.command {
        Command::Start(args) => ctx.start(args).await,
        Command::Stop { cluster, yes } => ctx.stop(&cluster, yes).await,
        Command::Resize(args) => ctx.resize(args).await,
        Command::RemoveNode { cluster, node, yes } => ctx.remove_node(&cluster, &node, yes).await,
        Command::List => ctx.list(),
        Command::ListTemplates { patterns } => ctx.list_templates(&patterns),
        Command::ListNodes { cluster, json, pretty_json } => ctx.list_nodes(&cluster, json, pretty_json).await,
        Command::Setup { cluster, extra } => ctx.setup(&cluster, &extra).await,
        Command::Ssh(args) => ctx.remote("ssh", args).await,
        Command::Sftp(args) => ctx.remote("sftp", args).await,
    }
}

struct Context {
    config_path: PathBuf,
    settings: ControllerSettings,
}

impl Context {
    fn configuration(&self) -> Result<Configuration> {
        Configuration::load(&self.config_path)
            .with_context(|| format!("loading configuration from {}", self.config_path.display()))
    }

    fn store(&self) -> Result<StateStore> {
        Ok(StateStore::new(&self.settings.storage_path, self.settings.storage_format)?)
    }

    /// Open a stored cluster with the collaborators its options name
    async fn open(&self, name: &str, with_setup: bool) -> Result<ClusterController> {
        let record = self.store()?.load(name)?;
        let config = self.configuration()?;
        let template = match config.cluster_template(&record.template) {
            Ok(template) => Some(template),
            Err(e) => {
                warn!("Template {} of cluster {} is unusable: {}", record.template, name, e);
                None
            }
        };
        let options = if record.options.is_empty() {
            template
                .as_ref()
                .map(|t| t.options.clone())
                .with_context(|| format!("cluster {} has no stored options and no template", name))?
        } else {
            ClusterOptions::from_map(record.options.clone())?
        };

        let cloud = config.cloud(&options.cloud)?;
        let provider = create_provider(&cloud, &self.settings.storage_path)?;
        let mut cluster = ClusterController::open(name, template.as_ref(), provider, self.settings.clone()).await?;
        match config.login(&options.login) {
            Ok(login) => cluster = cluster.with_login(login),
            Err(e) => warn!("No usable login for cluster {}: {}", name, e),
        }
        if with_setup {
            let setup = config.setup(&options.setup)?;
            cluster = cluster.with_setup(create_setup_provider(&setup)?, setup);
        }
        Ok(cluster)
    }

    async fn start(&self, args: StartArgs) -> Result<()> {
        let name = args.name.unwrap_or_else(|| args.template.clone());
        ensure_name_free(&self.store()?, &name)?;

        let config = self.configuration()?;
        let mut resolved = config.resolve(&args.template)?;
        for spec in &args.nodes {
            resolved.template.options.set_group_nodes(&spec.group, spec.count)?;
        }
        let setup = if args.no_setup { None } else { Some(create_setup_provider(&resolved.setup)?) };

        let provider = create_provider(&resolved.cloud, &self.settings.storage_path)?;
        let mut cluster = ClusterController::new(&name, &resolved.template, provider, self.settings.clone())?
            .with_login(resolved.login.clone());
        if let Some(setup) = setup {
            cluster = cluster.with_setup(setup, resolved.setup.clone());
        }

        println!("Starting cluster `{}` with:", name);
        for (group, size) in &resolved.template.options.groups {
            println!("* {} {} nodes.", size.nodes, group);
        }
        println!("(This may take a while...)");
        let report = cluster.start().await?;
        print_report("start", &report);

        pin_host_keys(&cluster).await;
        if !args.no_setup {
            configure(&mut cluster, &[]).await?;
        }
        println!("{}", cluster);
        Ok(())
    }

    async fn stop(&self, name: &str, yes: bool) -> Result<()> {
        let mut cluster = self.open(name, false).await?;
        if !yes {
            confirm(format!(
                "Do you really want to stop cluster `{}`? This destroys all of its {} node(s)",
                name,
                cluster.nodes().len()
            ))
            .await?;
        }
        println!("Destroying cluster `{}` ...", name);
        let report = cluster.stop().await?;
        print_report("stop", &report);
        if !report.is_success() {
            bail!("cluster `{}` was not fully stopped; its state file lists the remaining nodes", name);
        }
        Ok(())
    }

    async fn resize(&self, args: ResizeArgs) -> Result<()> {
        if args.add.is_empty() && args.remove.is_empty() {
            bail!("nothing to do: use --add and/or --remove");
        }
        let with_setup = !args.add.is_empty() && !args.no_setup;
        let mut cluster = self.open(&args.cluster, with_setup).await?;
        if !args.remove.is_empty() && !args.yes {
            let what: Vec<String> = args.remove.iter().map(|s| s.to_string()).collect();
            confirm(format!("Do you really want to remove {} from cluster `{}`?", what.join(", "), args.cluster))
                .await?;
        }

        let mut report = BatchReport::default();
        for spec in &args.remove {
            println!("Removing {} node(s) from group {} ...", spec.count, spec.group);
            report.merge(cluster.remove(&spec.group, spec.count as usize).await?);
        }
        for spec in &args.add {
            println!("Adding {} node(s) to group {} ...", spec.count, spec.group);
            report.merge(cluster.add(&spec.group, spec.count, true).await?);
        }
        print_report("resize", &report);

        if !args.add.is_empty() {
            pin_host_keys(&cluster).await;
            if with_setup {
                configure(&mut cluster, &[]).await?;
            }
        }
        println!("{}", cluster);
        Ok(())
    }

    async fn remove_node(&self, name: &str, node: &str, yes: bool) -> Result<()> {
        let mut cluster = self.open(name, false).await?;
        if !yes {
            confirm(format!("Do you really want to remove node `{}` from cluster `{}`?", node, name)).await?;
        }
        match cluster.remove_by_name(node).await {
            Ok(()) => println!("Node {} removed", node),
            Err(ClusterError::NodeNotFound(_)) => bail!("node `{}` not found in cluster `{}`", node, name),
            Err(e) => return Err(e.into()),
        }
        println!("{}", cluster);
        Ok(())
    }

    fn list(&self) -> Result<()> {
        let store = self.store()?;
        let names = store.list()?;
        if names.is_empty() {
            println!("No clusters found.");
            return Ok(());
        }
        println!("The following clusters have been started.");
        println!("Please note that there's no guarantee that they are fully configured:");
        for name in names {
            let record = match store.load(&name) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Cannot read state of cluster {}: {}", name, e);
                    continue;
                }
            };
            let mut groups: BTreeMap<String, usize> = BTreeMap::new();
            for node in &record.nodes {
                if let Some(group) = group_of(&record.name, node) {
                    *groups.entry(group).or_default() += 1;
                }
            }
            println!();
            println!("{}", record.name);
            println!("{}", "-".repeat(record.name.len()));
            println!("  name:           {}", record.name);
            println!("  template:       {}", record.template);
            for (group, count) in groups {
                println!("  - {} nodes: {}", group, count);
            }
        }
        Ok(())
    }

    fn list_templates(&self, patterns: &[String]) -> Result<()> {
        let config = self.configuration()?;
        let filters = patterns
            .iter()
            .map(|p| glob_to_regex(p).with_context(|| format!("invalid pattern `{}`", p)))
            .collect::<Result<Vec<_>>>()?;
        let templates: Vec<_> = config
            .templates()
            .into_iter()
            .filter(|(name, _)| filters.is_empty() || filters.iter().any(|re| re.is_match(name)))
            .collect();

        println!("{} matching cluster templates found.", templates.len());
        for (name, counts) in templates {
            println!();
            println!("name:     {}", name);
            for (group, count) in counts {
                println!("{} nodes: {}", group, count);
            }
        }
        Ok(())
    }

    async fn list_nodes(&self, name: &str, json: bool, pretty_json: bool) -> Result<()> {
        let cluster = self.open(name, false).await?;
        if pretty_json {
            println!("{}", serde_json::to_string_pretty(&cluster.summary())?);
        } else if json {
            println!("{}", serde_json::to_string(&cluster.summary())?);
        } else {
            println!("{}", cluster);
        }
        Ok(())
    }

    async fn setup(&self, name: &str, extra: &[String]) -> Result<()> {
        let mut cluster = self.open(name, true).await?;
        if !configure(&mut cluster, extra).await? {
            bail!("configuration of cluster `{}` failed", name);
        }
        Ok(())
    }

    async fn remote(&self, program: &str, args: RemoteArgs) -> Result<()> {
        let cluster = self.open(&args.cluster, false).await?;
        let node = match args.node {
            Some(node) => node,
            None => cluster
                .ssh_node()
                .map(|n| n.name.clone())
                .with_context(|| format!("cluster `{}` has no node to connect to", args.cluster))?,
        };
        let credentials = cluster.ssh_credentials()?;
        let probe = cluster.ssh_probe()?;
        let endpoint = cluster.ssh_endpoint(&node, &probe, None).await?;

        let mut command = Process::new(program);
        command.args(client_args(
            program,
            credentials.private_key.as_deref(),
            &cluster.known_hosts_path(),
            &format!("{}@{}", credentials.user, endpoint.address),
            endpoint.port,
            &args.args,
        ));
        debug!("running {:?}", command);

        let status = command.status().await.with_context(|| format!("cannot run {}", program))?;
        if !status.success() {
            return Err(CliError::ChildFailed { program: program.to_string(), code: status.code().unwrap_or(1) }.into());
        }
        Ok(())
    }
}

/// Refuse to start over a cluster that still has nodes
///
/// A state file without nodes is what a rolled-back start leaves behind,
/// so its name may be reused.
fn ensure_name_free(store: &StateStore, name: &str) -> Result<()> {
    if !store.exists(name) {
        return Ok(());
    }
    match store.load(name) {
        Ok(record) if record.nodes.is_empty() => {
            info!("Cluster `{}` has no nodes left, starting it afresh", name);
            Ok(())
        }
        _ => bail!("cluster `{}` already exists; resize it or stop it first", name),
    }
}

/// Command line of the `ssh` or `sftp` client; user arguments follow the destination
fn client_args(
    program: &str,
    private_key: Option<&Path>,
    known_hosts: &Path,
    destination: &str,
    port: u16,
    extra: &[String],
) -> Vec<String> {
    let mut argv = Vec::with_capacity(extra.len() + 8);
    if let Some(key) = private_key {
        argv.push("-i".to_string());
        argv.push(key.display().to_string());
    }
    argv.push(if program == "sftp" { "-P" } else { "-p" }.to_string());
    argv.push(port.to_string());
    argv.push("-o".to_string());
    argv.push(format!("UserKnownHostsFile={}", known_hosts.display()));
    argv.push("-o".to_string());
    argv.push("StrictHostKeyChecking=yes".to_string());
    argv.push(destination.to_string());
    argv.extend(extra.iter().cloned());
    argv
}

/// Resolve every node's SSH endpoint so its host keys are pinned
async fn pin_host_keys(cluster: &ClusterController) {
    let probe = match cluster.ssh_probe() {
        Ok(probe) => probe,
        Err(e) => {
            warn!("Skipping SSH checks: {}", e);
            return;
        }
    };
    let mut names: Vec<String> = cluster.nodes().iter().map(|n| n.name.clone()).collect();
    names.sort();
    for name in names {
        match cluster.ssh_endpoint(&name, &probe, None).await {
            Ok(endpoint) => info!("Node {} answers SSH on {}", name, endpoint),
            Err(e) => warn!("Node {} is not reachable over SSH: {}", name, e),
        }
    }
}

async fn configure(cluster: &mut ClusterController, extra: &[String]) -> Result<bool> {
    println!("Configuring the cluster ...");
    println!("(this too may take a while)");
    let ok = cluster.configure(extra).await?;
    if ok {
        println!("Your cluster `{}` is ready!", cluster.name());
    } else {
        println!();
        println!("WARNING: YOUR CLUSTER IS NOT READY YET!");
    }
    Ok(ok)
}

fn print_report(operation: &str, report: &BatchReport) {
    if report.is_success() && report.skipped().is_empty() {
        debug!("{}: {}", operation, report);
        return;
    }
    println!("Some nodes need attention after {}:", operation);
    print!("{}", report);
}

/// Ask a yes/no question on the terminal
async fn confirm(question: String) -> Result<()> {
    let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
        print!("{} [yN] ", question);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await??;
    if is_yes(&answer) {
        Ok(())
    } else {
        Err(CliError::Aborted.into())
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_cluster::{ClusterRecord, Node};

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }

    #[test]
    fn test_client_args_put_command_after_destination() {
        let argv = client_args(
            "ssh",
            Some(Path::new("/keys/id")),
            Path::new("/st/lab.known_hosts"),
            "ubuntu@10.0.0.1",
            22,
            &["uptime".to_string()],
        );
        assert_eq!(
            argv,
            vec![
                "-i",
                "/keys/id",
                "-p",
                "22",
                "-o",
                "UserKnownHostsFile=/st/lab.known_hosts",
                "-o",
                "StrictHostKeyChecking=yes",
                "ubuntu@10.0.0.1",
                "uptime",
            ]
        );

        let argv = client_args("sftp", None, Path::new("k"), "root@h", 2222, &[]);
        assert_eq!(argv[..2], ["-P", "2222"]);
        assert_eq!(argv.last().map(String::as_str), Some("root@h"));
    }

    #[test]
    fn test_start_reuses_name_of_emptied_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), Default::default()).unwrap();
        assert!(ensure_name_free(&store, "lab").is_ok());

        store.save(&ClusterRecord::new("lab", "slurm")).unwrap();
        assert!(ensure_name_free(&store, "lab").is_ok());

        let mut record = ClusterRecord::new("lab", "slurm");
        record.nodes.push(Node::new("i-1", "lab-compute001"));
        store.save(&record).unwrap();
        assert!(ensure_name_free(&store, "lab").is_err());
    }

    #[tokio::test]
    async fn test_list_with_empty_storage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            settings: ControllerSettings::new().storage_path(dir.path()),
        };
        ctx.list().unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_cluster_maps_to_noinput() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            settings: ControllerSettings::new().storage_path(dir.path()),
        };
        let err = ctx.open("ghost", false).await.unwrap_err();
        assert_eq!(crate::exit_code(&err), crate::EX_NOINPUT);
    }

    #[test]
    fn test_list_templates_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context {
            config_path: dir.path().join("missing.yaml"),
            settings: ControllerSettings::new().storage_path(dir.path()),
        };
        assert!(ctx.list_templates(&[]).is_err());
    }
}
