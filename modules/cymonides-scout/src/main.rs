use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cymonides_common::{partition_name, Config};
use cymonides_graph::{
    migrate, GraphClient, GraphReader, GraphWriter, NodeStore, PgNodeStore, RetryPolicy, TagQuery,
};
use cymonides_scout::{BudgetTracker, CascadeController, CollectorPool, FixtureCollector};

#[derive(Parser)]
#[command(name = "cymonides", about = "Entity graph bridge: upserts, verification cascade, tags")]
struct Cli {
    /// Project partition to operate on (defaults to CYMONIDES_PROJECT)
    #[arg(long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the project's partition table and indexes
    Migrate,
    /// Print a stored node as JSON
    Show { id: String },
    /// List nodes matching a tag expression, e.g. "#officers AND #uk"
    Tags { query: String },
    /// Tag a node
    Tag { id: String, tag: String },
    /// Print the pending cascade queues
    Queues,
    /// Run the verification cascade from a seed query against fixture collectors
    Cascade {
        query: String,
        /// Fixture files, one collector each
        #[arg(long = "fixture", required = true)]
        fixtures: Vec<PathBuf>,
        /// Overrides CASCADE_MAX_DEPTH
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Remove everything an ingestion job wrote
    Rollback { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cymonides=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env()?;
    config.log_redacted();
    let project = cli.project.unwrap_or_else(|| config.project_id.clone());

    let client = GraphClient::connect(&config.database_url).await?;
    let store: Arc<dyn NodeStore> = Arc::new(PgNodeStore::new(client.clone()));
    let ontology = Arc::new(config.load_ontology()?);
    let writer = GraphWriter::new(store.clone(), ontology.clone())
        .with_retry(RetryPolicy::from_config(&config));
    let reader = GraphReader::new(store);

    match cli.command {
        Command::Migrate => {
            let partition = partition_name(&project);
            migrate(&client, &partition).await?;
            info!(partition = partition.as_str(), "Migration complete");
        }
        Command::Show { id } => match reader.get_node(&project, &id).await? {
            Some(node) => println!("{}", serde_json::to_string_pretty(&node)?),
            None => bail!("no node {id} in project {project}"),
        },
        Command::Tags { query } => {
            let query = TagQuery::parse(&query)?;
            for node in reader.query_tags(&project, &query).await? {
                println!("{}\t{}\t{}", node.id, node.node_type, node.label);
            }
        }
        Command::Tag { id, tag } => {
            if writer.add_tag(&project, &id, &tag).await? {
                info!(id = id.as_str(), tag = tag.as_str(), "Tag added");
            } else {
                info!(id = id.as_str(), tag = tag.as_str(), "Already tagged");
            }
        }
        Command::Queues => {
            for entry in reader.verified_queue(&project).await? {
                println!("VERIFIED\t{}\t{}", entry.id, entry.value);
            }
            for entry in reader.unverified_queue(&project).await? {
                println!(
                    "UNVERIFIED\t{}\t{}\t{}",
                    entry.id,
                    entry.value,
                    entry.tag.as_deref().unwrap_or("")
                );
            }
        }
        Command::Cascade {
            query,
            fixtures,
            depth,
        } => {
            let mut pool = CollectorPool::from_config(&config, ontology);
            for path in &fixtures {
                pool = pool.with_collector(Arc::new(FixtureCollector::from_file(path)?));
            }

            let controller = CascadeController::new(writer, reader)
                .with_budget(Arc::new(BudgetTracker::new(config.search_budget)));
            let cancel = controller.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping after the current search");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let summary = controller
                .recursive_search(
                    &query,
                    &project,
                    depth.unwrap_or(config.cascade_max_depth),
                    &pool,
                )
                .await?;
            info!("Cascade complete. {summary}");
        }
        Command::Rollback { job_id } => {
            let stats = writer.rollback_job(&project, &job_id).await?;
            info!("{stats}");
        }
    }

    Ok(())
}
