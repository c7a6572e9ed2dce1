use clap::{Args, Parser, Subcommand};
use plugin_engine::{
    apps::App,
    config::{EngineConfig, EnvConfigManager},
    fetch::ReqwestFetcher,
    logger::{init_console, init_tracing},
    schema::write_schema,
    settings::JsonFileSettingsStore,
    sink::InMemorySink,
    template_commands::validate_templates,
};
use std::{path::PathBuf, process, sync::Arc};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "plugin-engine",
    about = "Runs template-defined HTTP data plugins and publishes their values",
    version
)]
struct Cli {
    /// `.env` file to seed the environment from
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine until Ctrl-C
    Run(RunArgs),

    /// Validate template files
    Validate { path: PathBuf },

    /// Emit JSON-Schema for templates and settings
    Schema {
        #[arg(long, default_value = "./schemas")]
        out: PathBuf,
    },

    /// Run every enabled instance once and print the published values
    Values,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Do not hot-reload templates and settings
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = EnvConfigManager::new(&cli.env_file);
    let config = EngineConfig::load(&env).await;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, !args.no_watch).await,
        Commands::Validate { path } => {
            init_console(&config.log_level);
            let ids = validate_templates(&path)?;
            println!("✅ {} template(s) valid.", ids.len());
            Ok(())
        }
        Commands::Schema { out } => {
            write_schema(&out)?;
            println!("Schemas written to {}", out.display());
            Ok(())
        }
        Commands::Values => values(config).await,
    }
}

async fn run(config: EngineConfig, watch: bool) -> anyhow::Result<()> {
    let telemetry = init_tracing(&config)?;
    info!(?config, "plugin engine starting up");

    let fetcher = Arc::new(ReqwestFetcher::new(config.fetch_timeout)?);
    let app = match App::bootstrap(&config, fetcher, InMemorySink::new(), watch).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to bootstrap plugin engine: {e:#}");
            telemetry.shutdown();
            process::exit(1);
        }
    };

    info!("plugin engine running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    info!("plugin engine shutting down");
    app.shutdown().await;
    telemetry.shutdown();
    Ok(())
}

async fn values(config: EngineConfig) -> anyhow::Result<()> {
    init_console(&config.log_level);

    let fetcher = Arc::new(ReqwestFetcher::new(config.fetch_timeout)?);
    let sink = InMemorySink::new();
    let store = Arc::new(JsonFileSettingsStore::new(&config.settings_file));
    let manager = App::build(&config, fetcher, sink.clone(), store).await?;
    manager.load_templates(&config.templates_dir).await?;

    let settings = manager.settings().snapshot().await;
    for (id, report) in manager.run_all_once(&settings).await {
        info!(instance = %id, targets = report.targets, failed = report.failed, "ran once");
    }
    for (key, value) in sink.snapshot() {
        println!("{key} = {value}");
    }
    Ok(())
}
