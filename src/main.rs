//! ClusterForge - kubeadm cluster orchestration over SSH
//!
//! This is the main CLI entry point for ClusterForge.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use clusterforge::apply::{
    self, ApplyContext, DeleteProcessor, Executor, GenProcessor, InstallProcessor,
    UninstallProcessor, UpgradeProcessor,
};
use clusterforge::cluster::{Cluster, Clusterfile, Role, ScalePlan};
use clusterforge::paths::{self, ClusterPaths};
use clusterforge::runtime::RuntimeSettings;
use clusterforge::ssh::SshClient;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Cluster name used when none is given
const DEFAULT_CLUSTER: &str = "my-cluster";

/// ClusterForge - kubeadm cluster orchestration
#[derive(Parser)]
#[command(name = "clusterforge")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Provision, scale, upgrade and tear down kubeadm clusters over SSH", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Skip confirmation of destructive operations
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, scale or upgrade a cluster to match a Clusterfile
    Apply {
        /// Clusterfile path
        #[arg(short = 'f', long)]
        file: PathBuf,
    },

    /// Join masters or nodes to a running cluster
    Join {
        /// Cluster name
        #[arg(short, long, default_value = DEFAULT_CLUSTER)]
        cluster: String,
        /// Masters to join, comma separated
        #[arg(short, long, value_delimiter = ',')]
        masters: Vec<String>,
        /// Nodes to join, comma separated
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,
    },

    /// Remove hosts from a cluster, or the whole cluster
    Delete {
        /// Cluster name
        #[arg(short, long, default_value = DEFAULT_CLUSTER)]
        cluster: String,
        /// Masters to remove, comma separated
        #[arg(short, long, value_delimiter = ',')]
        masters: Vec<String>,
        /// Nodes to remove, comma separated
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,
        /// Tear down every host and local state
        #[arg(short, long, conflicts_with_all = ["masters", "nodes"])]
        all: bool,
    },

    /// Upgrade a running cluster to a new image
    Upgrade {
        /// Cluster name
        #[arg(short, long, default_value = DEFAULT_CLUSTER)]
        cluster: String,
        /// Target cluster image
        #[arg(short, long)]
        image: String,
    },

    /// Install an application image on a running cluster
    Install {
        /// Clusterfile path
        #[arg(short = 'f', long)]
        file: PathBuf,
    },

    /// Remove an application image from a running cluster
    Uninstall {
        /// Clusterfile path
        #[arg(short = 'f', long)]
        file: PathBuf,
    },

    /// Adopt a cluster that was not created by clusterforge
    Gen {
        /// Clusterfile path
        #[arg(short = 'f', long)]
        file: PathBuf,
    },
}

fn load_clusterfile(path: &Path) -> anyhow::Result<Cluster> {
    let file = Clusterfile::load(path)
        .with_context(|| format!("Failed to load Clusterfile {}", path.display()))?;
    Ok(file.cluster)
}

fn load_saved(data_dir: &Path, name: &str) -> anyhow::Result<Cluster> {
    let path = ClusterPaths::new(data_dir, name).clusterfile();
    if !path.exists() {
        bail!("cluster {} not found, no Clusterfile at {}", name, path.display());
    }
    load_clusterfile(&path)
}

fn context_for(cluster: &Cluster, data_dir: &Path, debug: bool) -> ApplyContext {
    let settings = RuntimeSettings {
        debug,
        ..Default::default()
    };
    ApplyContext::new(
        Arc::new(SshClient::from_cluster(cluster)),
        data_dir.to_path_buf(),
        settings,
    )
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} [y/N]: ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = paths::data_dir();

    match cli.command {
        Commands::Apply { file } => {
            let desired = load_clusterfile(&file)?;
            let ctx = context_for(&desired, &data_dir, cli.debug);
            apply::apply(&ctx, &desired)
                .await
                .with_context(|| format!("Failed to apply {}", desired.name()))?;
            println!("Cluster {} applied", desired.name());
        }

        Commands::Join {
            cluster,
            masters,
            nodes,
        } => {
            if masters.is_empty() && nodes.is_empty() {
                bail!("nothing to join, pass --masters or --nodes");
            }
            let current = load_saved(&data_dir, &cluster)?;
            let mut desired = current.clone();
            desired.add_hosts(Role::Master, &masters);
            desired.add_hosts(Role::Node, &nodes);

            let ctx = context_for(&desired, &data_dir, cli.debug);
            let plan = ScalePlan::new(masters, nodes, Vec::new(), Vec::new());
            apply::scale(&ctx, &current, &desired, plan)
                .await
                .with_context(|| format!("Failed to join hosts to {}", cluster))?;
            println!("Hosts joined to {}", cluster);
        }

        Commands::Delete {
            cluster,
            masters,
            nodes,
            all,
        } => {
            let current = load_saved(&data_dir, &cluster)?;
            let ctx = context_for(&current, &data_dir, cli.debug);

            if all {
                if !cli.force && !confirm(&format!("Delete cluster {} and every host in it?", cluster))? {
                    println!("Aborted");
                    return Ok(());
                }
                Executor::new(DeleteProcessor::new(&ctx))
                    .execute(&current)
                    .await
                    .with_context(|| format!("Failed to delete {}", cluster))?;
                println!("Cluster {} deleted", cluster);
                return Ok(());
            }

            if masters.is_empty() && nodes.is_empty() {
                bail!("nothing to delete, pass --masters, --nodes or --all");
            }
            if !cli.force
                && !confirm(&format!(
                    "Remove masters {:?} and nodes {:?} from {}?",
                    masters, nodes, cluster
                ))?
            {
                println!("Aborted");
                return Ok(());
            }
            let mut desired = current.clone();
            desired.remove_hosts(Role::Master, &masters);
            desired.remove_hosts(Role::Node, &nodes);
            let plan = ScalePlan::new(Vec::new(), Vec::new(), masters, nodes);
            apply::scale(&ctx, &current, &desired, plan)
                .await
                .with_context(|| format!("Failed to remove hosts from {}", cluster))?;
            println!("Hosts removed from {}", cluster);
        }

        Commands::Upgrade { cluster, image } => {
            let mut target = load_saved(&data_dir, &cluster)?;
            if target.image() == image {
                println!("Cluster {} already runs {}", cluster, image);
                return Ok(());
            }
            target.spec.image = image.clone();
            let ctx = context_for(&target, &data_dir, cli.debug);
            Executor::new(UpgradeProcessor::new(&ctx))
                .execute(&target)
                .await
                .with_context(|| format!("Failed to upgrade {} to {}", cluster, image))?;
            println!("Cluster {} upgraded to {}", cluster, image);
        }

        Commands::Install { file } => {
            let cluster = load_clusterfile(&file)?;
            let ctx = context_for(&cluster, &data_dir, cli.debug);
            Executor::new(InstallProcessor::new(&ctx))
                .execute(&cluster)
                .await
                .with_context(|| format!("Failed to install {}", cluster.image()))?;
            println!("Installed {} on {}", cluster.image(), cluster.name());
        }

        Commands::Uninstall { file } => {
            let cluster = load_clusterfile(&file)?;
            let ctx = context_for(&cluster, &data_dir, cli.debug);
            Executor::new(UninstallProcessor::new(&ctx))
                .execute(&cluster)
                .await
                .with_context(|| format!("Failed to uninstall {}", cluster.image()))?;
            println!("Uninstalled {} from {}", cluster.image(), cluster.name());
        }

        Commands::Gen { file } => {
            let cluster = load_clusterfile(&file)?;
            let ctx = context_for(&cluster, &data_dir, cli.debug);
            Executor::new(GenProcessor::new(&ctx))
                .execute(&cluster)
                .await
                .with_context(|| format!("Failed to adopt {}", cluster.name()))?;
            println!("Cluster {} adopted", cluster.name());
        }
    }

    Ok(())
}
