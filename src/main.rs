use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use telegraf_steward::config::{default_config_path, load_config, StewardConfig};
use telegraf_steward::render::ConfigSynchronizer;
use telegraf_steward::store::PluginRegistry;
use telegraf_steward::sources::{SourceKind, SourceParams};
use telegraf_steward::{LifecycleCoordinator, LifecycleEvent, Outcome};

#[derive(Parser)]
#[command(name = "telegraf-steward")]
#[command(about = "Manage a Telegraf installation shared by several consumers on one host")]
#[command(version)]
struct Cli {
    /// Configuration file (default: /etc/telegraf-steward/steward.yml if exists, otherwise ~/.config/telegraf-steward/steward.yml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Unit this invocation acts for (e.g. telegraf/0); overrides `unit` in the configuration
    #[arg(short, long, global = true)]
    unit: Option<String>,
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the shared agent or take a reference on an existing install
    Install,
    /// A consumer joined; add its tag
    Join {
        /// Consumer name
        name: String,
    },
    /// A consumer departed; drop its tag and its reference
    Depart {
        /// Consumer name
        name: String,
    },
    /// A source or destination published its connection parameters
    SourceAvailable {
        /// Relation kind (influxdb-output, mongodb-input, mysql-input)
        kind: SourceKind,
        /// Logical name of the fragment (defaults to the kind's service name)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// A source or destination went away
    SourceGone {
        /// Relation kind (influxdb-output, mongodb-input, mysql-input)
        kind: SourceKind,
        /// Logical name of the fragment (defaults to the kind's service name)
        #[arg(long)]
        name: Option<String>,
    },
    /// This unit is stopping; release its reference
    Stop,
    /// Run pending teardown, removal and restart transitions
    Reconcile,
    /// Render the agent configuration from the registry
    Render {
        /// Write the configuration file instead of printing it
        #[arg(long)]
        write: bool,
    },
    /// Show lifecycle flags and shared state
    Status {
        /// Print the flags document as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Determine config file with proper precedence:
    // 1. CLI argument if provided
    // 2. System-wide config (/etc/telegraf-steward/steward.yml) if it exists
    // 3. User config (~/.config/telegraf-steward/steward.yml)
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    info!("Using configuration {}", config_path.display());
    if cli.unit.is_some() {
        config.unit = cli.unit;
    }

    let event = match cli.command {
        Commands::Install => LifecycleEvent::Install,
        Commands::Join { name } => LifecycleEvent::ConsumerJoined { name },
        Commands::Depart { name } => LifecycleEvent::ConsumerDeparted { name },
        Commands::SourceAvailable {
            kind,
            name,
            host,
            port,
            user,
            password,
        } => LifecycleEvent::SourceAvailable {
            kind,
            name: name.unwrap_or_else(|| kind.default_name().to_string()),
            params: SourceParams {
                host,
                port,
                user,
                password,
            },
        },
        Commands::SourceGone { kind, name } => LifecycleEvent::SourceGone {
            kind,
            name: name.unwrap_or_else(|| kind.default_name().to_string()),
        },
        Commands::Stop => LifecycleEvent::Stop,
        Commands::Reconcile => LifecycleEvent::Reconcile,
        // Rendering only reads the shared registry and needs no unit
        Commands::Render { write } => return render(&config, write),
        Commands::Status { json } => return status(&build_coordinator(&config)?, json),
    };

    let coordinator = build_coordinator(&config)?;

    let description = event.to_string();
    let outcome = coordinator
        .handle(event)
        .await
        .with_context(|| format!("Failed to handle {}", description))?;
    report(&outcome);

    Ok(())
}

fn build_coordinator(config: &StewardConfig) -> anyhow::Result<LifecycleCoordinator> {
    LifecycleCoordinator::from_config(config).context("Failed to set up the lifecycle coordinator")
}

fn report(outcome: &Outcome) {
    if outcome.transitions.is_empty() {
        println!("No changes");
    } else {
        println!("Applied: {}", outcome.transitions.join(", "));
    }
    println!("Status: {}", outcome.flags.status);
}

fn render(config: &StewardConfig, write: bool) -> anyhow::Result<()> {
    let synchronizer = ConfigSynchronizer::new(
        PluginRegistry::new(&config.registry_file),
        Arc::new(config.templates()),
        config.host_identity(),
        &config.config_file,
    );

    if write {
        let result = synchronizer.synchronize().with_context(|| {
            format!("Failed to render {}", synchronizer.target().display())
        })?;
        if result.changed() {
            println!("Updated {}", synchronizer.target().display());
        } else {
            println!("{} is up to date", synchronizer.target().display());
        }
    } else {
        let rendered = synchronizer
            .render()
            .context("Failed to render configuration")?;
        print!("{}", rendered);
    }

    Ok(())
}

fn status(coordinator: &LifecycleCoordinator, json: bool) -> anyhow::Result<()> {
    let flags = coordinator
        .flag_store()
        .load()
        .context("Failed to load lifecycle flags")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&flags)?);
        return Ok(());
    }

    println!("Status: {}", flags.status);
    println!("Installed: {}", flags.installed);
    println!("Needs restart: {}", flags.needs_restart);
    println!("Check teardown: {}", flags.check_teardown);
    println!("Pending removal: {}", flags.pending_removal);

    match coordinator.counter().try_get()? {
        Some(count) => println!("References: {}", count),
        None => println!("References: none"),
    }

    let registry = coordinator.registry();
    if registry.exists() {
        let document = registry.snapshot()?;
        println!("Outputs: {}", join_names(document.output.keys()));
        println!("Inputs: {}", join_names(document.input.keys()));
        println!("Tags: {}", join_names(document.tags.iter()));
    } else {
        println!("Registry: not initialized");
    }

    Ok(())
}

fn join_names<'a>(names: impl Iterator<Item = &'a String>) -> String {
    let names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(", ")
    }
}
