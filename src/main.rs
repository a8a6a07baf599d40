//! quarry CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use quarry::{
    commands::{
        cmd_explain, cmd_init, cmd_jobs_history, cmd_jobs_list, cmd_jobs_run, cmd_jobs_tick,
        cmd_run, cmd_status, print_history, print_jobs, print_report, print_status, print_tick,
        read_statements,
    },
    config::Config,
    engine::Engine,
    error::Result,
    progress::LogWriterFactory,
    registry,
    scheduler::SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "quarry")]
#[command(version, about = "Federated queries over tables, knowledge bases and models", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize quarry configuration and catalog
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Execute statements from a JSON file ('-' for stdin)
    Run {
        file: PathBuf,

        /// Stop after this many output rows
        #[arg(long)]
        row_limit: Option<usize>,
    },

    /// Show the execution plan of statements without running them
    Explain { file: PathBuf },

    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Show registered relations, knowledge bases and jobs
    Status,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs with their schedule
    List,

    /// Run a job if it is due
    Tick {
        name: String,

        /// Run even if the job is not due
        #[arg(long)]
        force: bool,
    },

    /// Show recent runs of a job
    History {
        name: String,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Poll and run due jobs until interrupted
    Run {
        /// Do a single sweep and exit
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    if matches!(cli.command, Commands::Init { .. }) {
        return handle_init(cli).await;
    }

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "quarry", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let engine = Engine::open(config).await?;
    registry::init(engine.registry().clone())?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Run { file, row_limit } => {
            let statements = read_statements(&file)?;
            let reports = cmd_run(&engine, &statements, row_limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    print_report(report);
                }
            }
        }

        Commands::Explain { file } => {
            let statements = read_statements(&file)?;
            let plans = cmd_explain(&engine, &statements).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&plans)?);
            } else {
                println!("{}", plans.join("\n"));
            }
        }

        Commands::Jobs { action } => handle_jobs(&engine, action, cli.json).await?,

        Commands::Status => {
            let status = cmd_status(&engine).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

async fn handle_jobs(engine: &Arc<Engine>, action: JobsAction, json: bool) -> Result<()> {
    let scheduler = engine.scheduler(Arc::new(SystemClock));

    match action {
        JobsAction::List => {
            let jobs = cmd_jobs_list(engine.catalog()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs);
            }
        }
        JobsAction::Tick { name, force } => {
            let name = name.to_lowercase();
            let outcome = cmd_jobs_tick(&scheduler, &name, force).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_tick(&name, &outcome);
            }
        }
        JobsAction::History { name, limit } => {
            let runs = cmd_jobs_history(engine.catalog(), &name.to_lowercase(), limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else {
                print_history(&runs);
            }
        }
        JobsAction::Run { once } => {
            let poll = Duration::from_secs(engine.config().scheduler.poll_interval_secs.max(1));
            cmd_jobs_run(&scheduler, poll, once, |outcomes| {
                for (name, outcome) in outcomes {
                    if json {
                        let line = serde_json::json!({ "job": name, "tick": outcome });
                        println!("{}", line);
                    } else {
                        print_tick(name, outcome);
                    }
                }
            })
            .await?;
        }
    }

    Ok(())
}

async fn handle_init(cli: Cli) -> Result<()> {
    let Commands::Init { force } = cli.command else {
        unreachable!()
    };

    // A .toml path names the config file; anything else is the base directory
    let (base_dir, config_path) = if let Some(path) = cli.config {
        if path.extension().map_or(false, |e| e == "toml") {
            let base = path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir);
            (base.clone(), base.join("config.toml"))
        } else {
            (path.clone(), path.join("config.toml"))
        }
    } else {
        let base = Config::default_base_dir();
        (base.clone(), base.join("config.toml"))
    };

    if config_path.exists() && !force {
        eprintln!(
            "Config file already exists at: {}\nUse --force to overwrite.",
            config_path.display()
        );
        std::process::exit(1);
    }

    let config = cmd_init(Some(base_dir), force).await?;

    println!("✓ quarry initialized successfully");
    println!("  Config: {}", config.paths.config_file.display());
    println!("  Catalog: {}", config.paths.db_file.display());
    println!("\nNext steps:");
    println!("  1. Add [[source]] entries to the config file");
    println!("  2. Run statements: quarry run statements.json");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'quarry init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
