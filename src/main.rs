use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spotctl::catalog::TypeCatalog;
use spotctl::cloud::{AwsCloud, CloudCapability};
use spotctl::config::{init_config, Config, GroupConfig};
use spotctl::engine::Engine;
use spotctl::group::group_table_from_json;
use spotctl::launch::IdentityPatcher;
use spotctl::retry::{ExponentialBackoffPolicy, RetryPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spotctl")]
#[command(about = "Replaces on-demand auto-scaling group members with cheaper spot instances", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate instances for spot replacement in one region
    Run {
        /// AWS region to operate in
        #[arg(long)]
        region: String,
        /// Instance type catalog JSON produced by the pricing ingester
        #[arg(long)]
        catalog: PathBuf,
        /// Opted-in group table JSON produced by the discovery scanner
        #[arg(long)]
        groups: PathBuf,
        /// Instance ids to evaluate
        #[arg(required = true)]
        instance_ids: Vec<String>,
    },
    /// Create a default configuration file
    Init {
        /// Output path
        #[arg(default_value = ".spotctl.toml")]
        output: PathBuf,
    },
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Init { output } => {
            init_config(&output)?;
            Ok(())
        }
        Commands::Show => {
            let config = Config::load(cli.config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run {
            region,
            catalog,
            groups,
            instance_ids,
        } => run(cli.config.as_deref(), region, catalog, groups, instance_ids).await,
    }
}

async fn run(
    config_path: Option<&std::path::Path>,
    region: String,
    catalog_path: PathBuf,
    groups_path: PathBuf,
    instance_ids: Vec<String>,
) -> Result<()> {
    let config = Config::load(config_path)?;

    let catalog_json = std::fs::read_to_string(&catalog_path)
        .with_context(|| format!("reading catalog {}", catalog_path.display()))?;
    let catalog = Arc::new(TypeCatalog::from_json(&catalog_json)?);

    let groups_json = std::fs::read_to_string(&groups_path)
        .with_context(|| format!("reading group table {}", groups_path.display()))?;
    let mut groups = group_table_from_json(&groups_json)?;
    for group in groups.values_mut() {
        group.config = GroupConfig::from_tags(
            &config,
            group.tags.iter().map(|t| (t.key.as_str(), t.value.as_str())),
        );
    }

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.clone()))
        .load()
        .await;
    let cloud: Arc<dyn CloudCapability> = Arc::new(AwsCloud::new(
        &aws_config,
        region.clone(),
        Duration::from_secs(config.cloud_call_timeout_secs),
    ));

    let engine = Arc::new(Engine::new(
        region,
        catalog,
        groups,
        Arc::clone(&cloud),
        Arc::new(IdentityPatcher),
    ));

    // Scan phase: describe and register every supplied instance.
    let retry = ExponentialBackoffPolicy::for_cloud_api();
    for instance_id in &instance_ids {
        let described = retry
            .execute_with_retry(|| {
                let cloud = Arc::clone(&cloud);
                let instance_id = instance_id.clone();
                async move { cloud.describe_instance(&instance_id).await }
            })
            .await;
        match described {
            Ok(Some(record)) => engine.registry().add(record).await,
            Ok(None) => warn!("Instance {} not found, skipping", instance_id),
            Err(e) => warn!("Couldn't describe {}: {}", instance_id, e),
        }
    }

    // Fan out the independent per-instance decisions.
    let mut handles = Vec::new();
    for record in engine.registry().snapshot().await {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let outcome = engine.process_instance(&record.instance_id).await;
            (record.instance_id, outcome)
        }));
    }

    let mut failures = 0usize;
    for handle in handles {
        let (instance_id, outcome) = handle.await?;
        match outcome {
            Ok(outcome) => println!("{}: {}", instance_id, outcome),
            Err(e) => {
                failures += 1;
                eprintln!("{}: {}", instance_id, e);
            }
        }
    }

    for line in engine.recap() {
        println!("{}", line);
    }

    if failures > 0 {
        anyhow::bail!("{} instance(s) failed processing", failures);
    }
    Ok(())
}
