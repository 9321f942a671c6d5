//! Livebundle CLI
//!
//! Starts the development server for a project directory.

use anyhow::Context;
use clap::Parser;
use livebundle::transform::{StageFilter, CACHE_NAME};
use livebundle::server::shutdown_signal;
use livebundle::{DevConfig, DevServer, JsonModuleStage, OrchestratorRegistry, PersistentCache, TransformStage, WorkerPool, VERSION};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "livebundle")]
#[command(author, version, about = "Incremental development bundler with live module replacement", long_about = None)]
struct Cli {
    /// Project root
    #[arg(value_name = "ROOT", default_value = ".")]
    root: PathBuf,

    /// Port to serve on (overrides livebundle.toml)
    #[arg(short, long)]
    port: Option<u16>,

    /// Entry file relative to the root (overrides livebundle.toml)
    #[arg(short, long, value_name = "FILE")]
    entry: Option<String>,

    /// Worker threads for pooled transform stages (overrides livebundle.toml)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    setup_logging(cli.verbose);

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("project root {} not found", cli.root.display()))?;
    let mut config = DevConfig::load(&root)?;
    if let Some(port) = cli.port {
        config.server_port = port;
    }
    if let Some(entry) = cli.entry {
        config.entry_file = entry;
    }
    if let Some(pool_size) = cli.pool_size {
        config.pool_size = pool_size;
    }

    info!(version = VERSION, root = %root.display(), entry = %config.entry_file, "starting livebundle");

    let cache = Arc::new(PersistentCache::open(&root.join(&config.cache_dir), CACHE_NAME));
    let mut pooled: HashMap<String, Arc<dyn livebundle::transform::Transform>> = HashMap::new();
    pooled.insert(JsonModuleStage::NAME.to_string(), Arc::new(JsonModuleStage));
    let pool = Arc::new(WorkerPool::new(config.effective_pool_size(), pooled));
    let stages = vec![TransformStage::pooled(JsonModuleStage::NAME, StageFilter::loaders(&["json"]))];

    let port = config.server_port;
    let registry = Arc::new(OrchestratorRegistry::new(&root, config, cache, stages, Some(pool)));
    let server = DevServer::bind(registry, port)
        .await
        .with_context(|| format!("could not listen on port {}", port))?;
    println!(
        "Serving http://localhost:{}/index.bundle?platform=<ios|android>",
        server.local_addr().port()
    );

    server
        .run_then_persist(shutdown_signal())
        .await
        .context("dev server stopped with an error")
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("livebundle={},warn", level)));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
