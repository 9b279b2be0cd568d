use crate::{index, ipset, iptables, k8s};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use netpol_agent_core::exec::{CommandRunner, SystemRunner};
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "netpol-agent", about = "A per-node network policy agent")]
pub struct Args {
    #[clap(
        long,
        default_value = "netpol=info,warn",
        env = "NETPOL_AGENT_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The node this agent runs on; informational only, every watch is
    /// cluster-wide because address sets span nodes.
    #[clap(long, env = "HOSTNAME")]
    node_name: Option<String>,

    /// Where the ipset state snapshot is written before structural changes.
    #[clap(long, default_value = "/var/run/netpol-agent/ipset.conf")]
    ipset_snapshot: PathBuf,

    /// Where the iptables state snapshot is written before structural
    /// changes.
    #[clap(long, default_value = "/var/run/netpol-agent/iptables.conf")]
    iptables_snapshot: PathBuf,

    /// Advisory lock file serializing save/restore against other writers.
    #[clap(long, default_value = "/var/run/netpol-agent/restore.lock")]
    restore_lock: PathBuf,

    /// Seconds each iptables invocation waits for the backend's own lock.
    #[clap(long, default_value = "60")]
    iptables_wait_secs: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            node_name,
            ipset_snapshot,
            iptables_snapshot,
            restore_lock,
            iptables_wait_secs,
        } = self;

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let ipsets = ipset::IpsetManager::new(runner.clone());
        let iptables =
            iptables::IptablesManager::new(runner, iptables_wait_secs, restore_lock);

        // Snapshot the pre-existing kernel state so an operator can roll
        // back by hand if the agent misbehaves.
        if let Some(dir) = ipset_snapshot.parent() {
            if let Err(error) = std::fs::create_dir_all(dir) {
                warn!(%error, dir = %dir.display(), "failed to create snapshot directory");
            }
        }
        if let Err(error) = ipsets.save(&ipset_snapshot) {
            warn!(%error, "failed to snapshot ipset state");
        }
        if let Err(error) = iptables.save(&iptables_snapshot) {
            warn!(%error, "failed to snapshot iptables state");
        }

        let index = index::Index::shared(ipsets, iptables);

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("netpol_index"), index.clone());

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(node = node_name.as_deref().unwrap_or("unknown"), "starting");

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(index::index_pods(index.clone(), pods).instrument(info_span!("pods")));

        let policies = runtime.watch_all::<k8s::NetworkPolicy>(watcher::Config::default());
        tokio::spawn(
            index::index_network_policies(index.clone(), policies)
                .instrument(info_span!("networkpolicies")),
        );

        let namespaces = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            index::index_namespaces(index.clone(), namespaces).instrument(info_span!("namespaces")),
        );

        // Block on the shutdown signal; in-flight handlers complete before
        // the watches are dropped.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}
