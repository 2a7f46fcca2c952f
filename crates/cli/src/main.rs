use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use tracing::info;

use chop_connect::Pool;
use chop_controller::{Engine, WatchConfig};
use chop_core::defaults::DEFAULT_CONFIG_PATH;
use chop_core::{ClickHouseCluster, NoopSchemaSync, OperatorDefaults, HTTP_PORT};
use chop_kubehub::{KubeStore, ResourceStore};
use chop_schemer::{PooledSchemaSync, RetryPolicy};
use chop_store::MemStore;

#[derive(Parser, Debug)]
#[command(name = "chopctl", version, about = "ClickHouse cluster operator")]
struct Cli {
    /// Operator defaults document
    #[arg(long = "config", env = "CHOP_CONFIG", global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Yaml,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch ClickHouseCluster objects and reconcile them
    Operator {
        /// Namespace to watch; all namespaces when empty
        #[arg(long = "namespace", env = "WATCH_NAMESPACE")]
        namespace: Option<String>,
        /// Clusters reconciled concurrently
        #[arg(long = "concurrency", default_value_t = 4)]
        concurrency: u16,
        /// Attempts per schema statement
        #[arg(long = "schema-retries", default_value_t = 10)]
        schema_retries: u32,
        /// Linear back-off step between schema attempts, in seconds
        #[arg(long = "schema-retry-step", default_value_t = 5)]
        schema_retry_step: u64,
        /// Database HTTP port
        #[arg(long = "db-http-port", default_value_t = HTTP_PORT)]
        db_http_port: i32,
        /// Deadline for each API server call, in seconds
        #[arg(long = "store-timeout", default_value_t = 10)]
        store_timeout: u64,
        /// Deadline for each database request, in seconds
        #[arg(long = "db-timeout", default_value_t = 10)]
        db_timeout: u64,
    },
    /// Print the CustomResourceDefinition
    Crd,
    /// Run one offline pass for a cluster manifest and print every generated object
    Render {
        /// ClickHouseCluster manifest (YAML)
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Namespace used when the manifest has none
        #[arg(long = "namespace", default_value = "default")]
        namespace: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Yaml)]
        output: Output,
    },
}

fn init_tracing() {
    let env = std::env::var("CHOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn load_defaults(path: &Path) -> Result<Arc<OperatorDefaults>> {
    let defaults = OperatorDefaults::load(path).with_context(|| format!("loading operator defaults from {}", path.display()))?;
    info!(path = %path.display(), extra_files = defaults.xml_config.len(), "operator defaults loaded");
    Ok(Arc::new(defaults))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Operator {
            namespace,
            concurrency,
            schema_retries,
            schema_retry_step,
            db_http_port,
            store_timeout,
            db_timeout,
        } => {
            let defaults = load_defaults(&cli.config)?;
            let client = chop_kubehub::get_kube_client().await?;
            let store = Arc::new(KubeStore::new(client.clone(), Duration::from_secs(store_timeout)));
            let pool = Arc::new(Pool::new(Duration::from_secs(db_timeout)));
            let retry = RetryPolicy { max_attempts: schema_retries.max(1), step: Duration::from_secs(schema_retry_step) };
            let schema = Arc::new(PooledSchemaSync::new(pool, retry).with_http_port(db_http_port));
            let engine = Arc::new(Engine::new(store, schema, defaults));
            let watch = WatchConfig { namespace: namespace.filter(|ns| !ns.is_empty()), concurrency: concurrency.max(1) };
            chop_controller::run(client, engine, watch).await?;
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&ClickHouseCluster::crd())?);
        }
        Commands::Render { file, namespace, output } => {
            let defaults = load_defaults(&cli.config)?;
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let mut cluster: ClickHouseCluster =
                serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;
            let ns = cluster.metadata.namespace.get_or_insert(namespace).clone();
            let name = cluster.metadata.name.clone().context("manifest has no metadata.name")?;

            let store = Arc::new(MemStore::new());
            store.create(&ns, &cluster).await?;
            let engine = Engine::new(Arc::clone(&store), Arc::new(NoopSchemaSync), defaults);
            let outcome = engine.reconcile(&ns, &name).await?;
            info!(?outcome, objects = store.len(), "offline pass done");

            let objects = store.dump();
            match output {
                Output::Yaml => {
                    for obj in &objects {
                        print!("---\n{}", serde_yaml::to_string(obj)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
            }
        }
    }
    Ok(())
}
