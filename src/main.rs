mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use aerotrack::config::PollerConfig;
use aerotrack::log_format::TargetFirstFormat;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "aerotrack")]
#[command(version = env!("VERGEN_GIT_DESCRIBE"))]
#[command(about = "Adaptive live position poller for a tracked aircraft fleet")]
struct Cli {
    /// Keep the polling schedule in process memory instead of Redis
    #[arg(long, global = true)]
    memory_schedule: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll continuously: sync the fleet and run a cycle on every tick
    Run,
    /// Sync the fleet and run a single polling cycle
    Cycle,
    /// Admit tracked registrations into the polling schedule
    SyncFleet,
    /// Apply pending database migrations
    Migrate,
    /// Show build info and polling schedule state
    Status {
        /// Also show due time and metadata of this registration
        #[arg(long)]
        registration: Option<String>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Run => "run",
            Commands::Cycle => "cycle",
            Commands::SyncFleet => "sync-fleet",
            Commands::Migrate => "migrate",
            Commands::Status { .. } => "status",
        }
    }
}

fn init_tracing(with_sentry: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so `cycle` and `status` output stays parseable
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .event_format(TargetFirstFormat::new(std::io::IsTerminal::is_terminal(
            &std::io::stderr(),
        )));

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
    if with_sentry {
        registry.with(sentry_tracing::layer()).init();
    } else {
        registry.init();
    }
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;
    let environment = std::env::var("AEROTRACK_ENV").unwrap_or_else(|_| "development".to_string());

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: Some(env!("VERGEN_GIT_DESCRIBE").into()),
            environment: Some(environment.into()),
            traces_sample_rate: 0.0,
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let sentry_guard = init_sentry();
    init_tracing(sentry_guard.is_some());
    info!(
        version = env!("VERGEN_GIT_DESCRIBE"),
        command = cli.command.name(),
        "Starting aerotrack"
    );

    let config = PollerConfig::load_from_env()?;
    let memory_schedule = cli.memory_schedule;

    let result = match cli.command {
        Commands::Run => commands::handle_run(config, memory_schedule).await,
        Commands::Cycle => commands::handle_cycle(config, memory_schedule).await,
        Commands::SyncFleet => commands::handle_sync_fleet(config, memory_schedule).await,
        Commands::Migrate => commands::handle_migrate(config).await,
        Commands::Status { registration } => commands::handle_status(config, registration).await,
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}
