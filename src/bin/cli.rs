//! CLI for cluster operations

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::time::Duration;
use streamcoord::common::parse_duration;
use streamcoord::coordinator::model::{Node, Partition, RebalancePlan, ReplicaSetId};
use streamcoord::CoordinatorClient;

#[derive(Parser)]
#[command(name = "streamcoord")]
#[command(about = "streamcoord ingestion cluster CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URLs; not-leader answers are retried on the others
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "http://localhost:7070"
    )]
    coordinator: Vec<String>,

    /// Request timeout (e.g. 500ms, 10s)
    #[arg(long, default_value = "10s")]
    timeout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show coordinator status
    Health,

    /// Show the full topology snapshot
    Topology,

    /// Assign a cube's partitions to replica sets
    Assign { cube: String },

    /// Remove a cube's assignment
    Unassign { cube: String },

    /// Show a cube's assignment
    Assignment { cube: String },

    /// Replace a cube's assignment
    Reassign {
        cube: String,

        /// Ownership as RS=TOPIC:ID[,TOPIC:ID...], repeatable
        #[arg(long = "set", required = true)]
        sets: Vec<String>,
    },

    /// Pause a cube's consumers
    Pause { cube: String },

    /// Resume a cube's consumers
    Resume { cube: String },

    /// Rebalance partitions across replica sets
    Rebalance {
        #[command(subcommand)]
        action: RebalanceAction,
    },

    /// Manage replica sets
    ReplicaSet {
        #[command(subcommand)]
        action: ReplicaSetAction,
    },

    /// Register or unregister worker nodes
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Report a segment range persisted to the remote store
    RemoteStoreComplete {
        cube: String,
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        #[arg(long)]
        node: Node,
    },

    /// Show segment ranges waiting for a build
    PendingSegments,

    /// Push election state to one coordinator
    SetLeadership {
        /// Coordinator receiving the update
        endpoint: String,
        #[arg(long)]
        leader: bool,
        /// Address of the current leader, when not this coordinator
        #[arg(long)]
        hint: Option<String>,
    },
}

#[derive(Subcommand)]
enum RebalanceAction {
    /// Print the recommended plan
    Recommend,
    /// Apply the recommended plan, or a plan read from a JSON file
    Apply {
        #[arg(long)]
        plan: Option<std::path::PathBuf>,
    },
}

#[derive(Subcommand)]
enum ReplicaSetAction {
    List,
    Create {
        #[arg(long)]
        id: Option<ReplicaSetId>,
        #[arg(long = "node")]
        nodes: Vec<Node>,
    },
    Delete {
        id: ReplicaSetId,
    },
    AddNode {
        id: ReplicaSetId,
        node: Node,
    },
    RemoveNode {
        id: ReplicaSetId,
        node: Node,
    },
    /// Record the outcome of a replica set leader election
    ChangeLeader {
        id: ReplicaSetId,
        node: Node,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    Register { node: Node },
    Unregister { node: Node },
}

fn parse_set(raw: &str) -> anyhow::Result<(ReplicaSetId, Vec<Partition>)> {
    let (id, partitions) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected RS=TOPIC:ID[,...], got {}", raw))?;
    let partitions = partitions
        .split(',')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (topic, pid) = p
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("expected TOPIC:ID, got {}", p))?;
            Ok(Partition::new(topic, pid.parse()?))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok((id.parse()?, partitions))
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let timeout: Duration = parse_duration(&cli.timeout)?;
    let client = CoordinatorClient::new(&cli.coordinator, timeout)?;

    match cli.command {
        Commands::Health => print(&client.health().await?)?,
        Commands::Topology => print(&client.topology().await?)?,
        Commands::Assign { cube } => print(&client.assign(&cube).await?)?,
        Commands::Unassign { cube } => print(&client.unassign(&cube).await?)?,
        Commands::Assignment { cube } => print(&client.assignment(&cube).await?)?,
        Commands::Reassign { cube, sets } => {
            let mut replica_sets = BTreeMap::new();
            for raw in &sets {
                let (id, partitions) = parse_set(raw)?;
                replica_sets
                    .entry(id)
                    .or_insert_with(Vec::new)
                    .extend(partitions);
            }
            print(&client.reassign(&cube, &replica_sets).await?)?
        }
        Commands::Pause { cube } => print(&client.pause(&cube).await?)?,
        Commands::Resume { cube } => print(&client.resume(&cube).await?)?,

        Commands::Rebalance { action } => match action {
            RebalanceAction::Recommend => print(&client.recommend().await?)?,
            RebalanceAction::Apply { plan } => {
                let plan: RebalancePlan = match plan {
                    Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
                    None => client.recommend().await?,
                };
                if plan.is_empty() {
                    println!("Nothing to rebalance");
                } else {
                    print(&client.apply(&plan).await?)?
                }
            }
        },

        Commands::ReplicaSet { action } => match action {
            ReplicaSetAction::List => print(&client.replica_sets().await?)?,
            ReplicaSetAction::Create { id, nodes } => {
                print(&client.create_replica_set(id, &nodes).await?)?
            }
            ReplicaSetAction::Delete { id } => print(&client.delete_replica_set(id).await?)?,
            ReplicaSetAction::AddNode { id, node } => print(&client.add_node(id, &node).await?)?,
            ReplicaSetAction::RemoveNode { id, node } => {
                print(&client.remove_node(id, &node).await?)?
            }
            ReplicaSetAction::ChangeLeader { id, node } => {
                print(&client.change_leader(id, &node).await?)?
            }
        },

        Commands::Node { action } => match action {
            NodeAction::Register { node } => print(&client.register_node(&node).await?)?,
            NodeAction::Unregister { node } => print(&client.unregister_node(&node).await?)?,
        },

        Commands::RemoteStoreComplete {
            cube,
            start,
            end,
            node,
        } => print(&client.remote_store_complete(&cube, start, end, &node).await?)?,
        Commands::PendingSegments => print(&client.pending_segments().await?)?,
        Commands::SetLeadership {
            endpoint,
            leader,
            hint,
        } => print(
            &client
                .set_leadership(&endpoint, leader, hint.as_deref())
                .await?,
        )?,
    }

    Ok(())
}
