//! capo-reconciler: validate cluster and machine specs, or run reconciliation
//! passes against the in-memory cloud.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capo_reconciler::cloud::memory::MemoryCloud;
use capo_reconciler::spec::{
    ClusterSpec, EffectiveClusterSpec, EffectiveMachineSpec, MachineSpec, resolve_cluster,
    resolve_machine,
};
use capo_reconciler::validation::{validate_cluster, validate_machine};
use capo_reconciler::{
    ClusterReconciler, ClusterScope, Ledger, MachineReconciler, MachineScope, ObjectRef,
    ReconcilerConfig, load_document,
};

#[derive(Parser)]
#[command(name = "capo-reconciler", version)]
#[command(about = "Cluster network and machine reconciler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve defaults and validate the specs
    Validate {
        /// Cluster spec (YAML or JSON)
        #[arg(long)]
        cluster: PathBuf,

        /// Machine spec (YAML or JSON)
        #[arg(long)]
        machine: Option<PathBuf>,
    },

    /// Run reconciliation passes against an in-memory cloud
    Simulate {
        /// Cluster spec (YAML or JSON)
        #[arg(long)]
        cluster: PathBuf,

        /// Machine spec (YAML or JSON)
        #[arg(long)]
        machine: Option<PathBuf>,

        /// Number of create passes
        #[arg(long, default_value = "2")]
        passes: u32,

        /// Tear everything down after the create passes
        #[arg(long)]
        delete: bool,

        /// Namespace of the simulated objects
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Name of the simulated cluster
        #[arg(long, default_value = "cluster")]
        name: String,

        /// UID of the simulated cluster (random if not set)
        #[arg(long)]
        uid: Option<String>,

        /// Print pass reports as JSON lines
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Reconciler knobs. Unset values come from `--config`, or short simulation
/// defaults.
#[derive(clap::Args)]
struct Tuning {
    /// Reconciler config file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Revisit interval after partial progress, in milliseconds
    #[arg(long)]
    requeue_after_ms: Option<u64>,

    /// Upper bound for one pass, in milliseconds
    #[arg(long)]
    pass_deadline_ms: Option<u64>,

    /// Tick of every bounded poll, in milliseconds
    #[arg(long)]
    poll_tick_ms: Option<u64>,

    /// Timeout of every bounded poll, in milliseconds
    #[arg(long)]
    poll_timeout_ms: Option<u64>,
}

impl Tuning {
    fn resolve(&self) -> Result<ReconcilerConfig> {
        let mut config = match &self.config {
            Some(path) => load_document(path)?,
            None => ReconcilerConfig::fast(),
        };
        if let Some(ms) = self.requeue_after_ms {
            config.requeue_after_ms = ms;
        }
        if let Some(ms) = self.pass_deadline_ms {
            config.pass_deadline_ms = ms;
        }
        for poll in [
            &mut config.vm_running_poll,
            &mut config.volume_state_poll,
            &mut config.lb_deregister_poll,
        ] {
            if let Some(ms) = self.poll_tick_ms {
                poll.tick_ms = ms;
            }
            if let Some(ms) = self.poll_timeout_ms {
                poll.timeout_ms = ms;
            }
        }
        Ok(config)
    }
}

#[derive(Tabled)]
struct LedgerRow {
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "RESOURCE ID")]
    resource_id: String,
    #[tabled(rename = "LINKS")]
    links: String,
}

fn ledger_table(ledger: &Ledger) -> Table {
    let rows: Vec<LedgerRow> = ledger
        .iter()
        .map(|(kind, name, entry)| LedgerRow {
            kind: kind.to_string(),
            name: name.to_string(),
            resource_id: entry.resource_id.clone(),
            links: if entry.link_ids.is_empty() {
                "-".to_string()
            } else {
                entry.link_ids.join(",")
            },
        })
        .collect();
    Table::new(rows)
}

fn load_specs(
    cluster: &Path,
    machine: Option<&Path>,
) -> Result<(EffectiveClusterSpec, Option<EffectiveMachineSpec>)> {
    let cluster_spec: ClusterSpec = load_document(cluster)?;
    let machine_spec = machine
        .map(|path| load_document::<MachineSpec>(path).map(resolve_machine))
        .transpose()?;
    Ok((resolve_cluster(cluster_spec), machine_spec))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "capo_reconciler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { cluster, machine } => {
            let (cluster_spec, machine_spec) = load_specs(&cluster, machine.as_deref())?;
            validate_cluster(&cluster_spec).context("invalid cluster spec")?;
            if let Some(machine_spec) = &machine_spec {
                validate_machine(machine_spec, &cluster_spec).context("invalid machine spec")?;
            }
            println!("spec is valid");
        }

        Commands::Simulate {
            cluster,
            machine,
            passes,
            delete,
            namespace,
            name,
            uid,
            json,
            tuning,
        } => {
            let config = tuning.resolve()?;
            let (cluster_spec, machine_spec) = load_specs(&cluster, machine.as_deref())?;
            let uid = uid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let cloud = Arc::new(MemoryCloud::new());
            let cluster_reconciler = ClusterReconciler::new(cloud.clone(), config.clone());
            let machine_reconciler = MachineReconciler::new(cloud.clone(), config);

            let mut cluster_scope = ClusterScope::new(
                ObjectRef::new(namespace.clone(), name.clone(), uid),
                cluster_spec,
                Ledger::new(),
            );
            let mut machine_scope = machine_spec.map(|spec| {
                MachineScope::new(
                    ObjectRef::new(
                        namespace.clone(),
                        format!("{}-machine", name),
                        uuid::Uuid::new_v4().to_string(),
                    ),
                    spec,
                    Ledger::new(),
                    cluster_scope.clone(),
                )
            });

            for pass in 1..=passes {
                info!(pass, "Starting pass");
                let report = cluster_reconciler
                    .reconcile(&mut cluster_scope)
                    .await
                    .with_context(|| format!("cluster pass {} failed", pass))?;
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!("pass {}: cluster {:?}", pass, report.outcome);
                    if let Some(endpoint) = &report.control_plane_endpoint {
                        println!("  control plane endpoint: {}", endpoint);
                    }
                }

                if let Some(machine_scope) = machine_scope.as_mut() {
                    machine_scope.cluster = cluster_scope.clone();
                    let report = machine_reconciler
                        .reconcile(machine_scope)
                        .await
                        .with_context(|| format!("machine pass {} failed", pass))?;
                    if json {
                        println!("{}", serde_json::to_string(&report)?);
                        continue;
                    }
                    println!("pass {}: machine {:?}", pass, report.outcome);
                    if let Some(provider_id) = &report.provider_id {
                        println!("  provider id: {}", provider_id);
                    }
                    if let Some(dns) = &report.private_dns_name {
                        println!("  private dns name: {}", dns);
                    }
                }
            }

            println!("cluster ledger:\n{}", ledger_table(&cluster_scope.ledger));
            if let Some(machine_scope) = &machine_scope {
                println!("machine ledger:\n{}", ledger_table(&machine_scope.ledger));
            }

            if delete {
                if let Some(machine_scope) = machine_scope.as_mut() {
                    machine_scope.cluster = cluster_scope.clone();
                    let outcome = machine_reconciler
                        .delete(machine_scope)
                        .await
                        .context("machine teardown failed")?;
                    println!("machine teardown: {:?}", outcome);
                }
                let outcome = cluster_reconciler
                    .delete(&mut cluster_scope)
                    .await
                    .context("cluster teardown failed")?;
                println!("cluster teardown: {:?}", outcome);

                let left = cloud.object_count().await;
                if left > 0 {
                    warn!(objects = left, "Objects left in the cloud after teardown");
                }
                println!("objects left: {}", left);
            }
        }
    }

    Ok(())
}
