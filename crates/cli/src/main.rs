use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use verge_core::Generation;
use verge_registry::Registry;
use verge_store::SqliteDriver;

#[derive(Parser, Debug)]
#[command(name = "vergectl", version, about = "Verge CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Database file (default: ~/.verge/verge.db)
    #[arg(long = "db", env = "VERGE_DB_PATH", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the initial empty policy and its first revision
    Init,
    /// Inspect the policy manifest
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Inspect revisions
    Revision {
        #[command(subcommand)]
        command: RevisionCommands,
    },
    /// Inspect the actual state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommands {
    /// Show one policy manifest generation (default: most recent)
    Show {
        #[arg(long = "gen")]
        gen: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum RevisionCommands {
    /// List all revisions
    List,
    /// Show one revision with its apply log (default: most recent)
    Show {
        #[arg(long = "gen")]
        gen: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum StateCommands {
    /// Show the live component instances
    Show,
}

fn init_tracing() {
    let env = std::env::var("VERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.db {
        return Ok(path.clone());
    }
    let home = std::env::var("HOME").context("HOME is not set and --db was not given")?;
    Ok(PathBuf::from(home).join(".verge").join("verge.db"))
}

fn open_registry(cli: &Cli) -> Result<Arc<Registry>> {
    let path = db_path(cli)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("while creating {}", parent.display()))?;
    }
    let path = path.to_string_lossy().into_owned();
    let driver = SqliteDriver::open(&path)?;
    // The CLI only reads engine-owned kinds; application kinds are registered
    // by the engine process that embeds the registry.
    Ok(Arc::new(Registry::new(Arc::new(driver), Vec::new())))
}

fn gen_or_last(gen: Option<u64>) -> Generation {
    gen.map(Generation).unwrap_or(Generation::LAST)
}

fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let registry = open_registry(&cli)?;

    match &cli.command {
        Commands::Init => {
            if registry.init_policy()? {
                let (_, gen) = registry.get_policy(Generation::LAST)?;
                info!(gen = %gen, "policy initialized");
                println!("initialized policy (generation {})", gen);
            } else {
                println!("policy already initialized");
            }
        }
        Commands::Policy { command } => match command {
            PolicyCommands::Show { gen } => {
                let data = registry
                    .get_policy_data(gen_or_last(*gen))?
                    .context("policy not found; run 'vergectl init' first")?;
                match cli.output {
                    Output::Human => {
                        println!(
                            "policy generation {} (updated {} by {})",
                            data.generation,
                            data.updated_at.to_rfc3339(),
                            data.updated_by
                        );
                        println!("{:<15} {:<20} {:<25} GEN", "NAMESPACE", "KIND", "NAME");
                        for (ns, by_kind) in &data.objects {
                            for (kind, by_name) in by_kind {
                                for (name, obj_gen) in by_name {
                                    println!("{:<15} {:<20} {:<25} {}", ns, kind, name, obj_gen);
                                }
                            }
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&data)?),
                }
            }
        },
        Commands::Revision { command } => match command {
            RevisionCommands::List => {
                let revisions = registry.get_all_revisions()?;
                match cli.output {
                    Output::Human => {
                        println!(
                            "{:<6} {:<8} {:<12} {:<7} {:<9} {:<8} {:<9} CREATED",
                            "GEN", "POLICY", "STATUS", "TOTAL", "SUCCESS", "FAILED", "SKIPPED"
                        );
                        for rev in revisions {
                            println!(
                                "{:<6} {:<8} {:<12} {:<7} {:<9} {:<8} {:<9} {}",
                                rev.generation.to_string(),
                                rev.policy_gen.to_string(),
                                rev.status.to_string(),
                                rev.result.total,
                                rev.result.success,
                                rev.result.failed,
                                rev.result.skipped,
                                rev.created_at.to_rfc3339()
                            );
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&revisions)?),
                }
            }
            RevisionCommands::Show { gen } => {
                let revision = registry
                    .get_revision(gen_or_last(*gen))?
                    .context("revision not found")?;
                match cli.output {
                    Output::Human => {
                        println!("revision {}", revision.generation);
                        println!("policy:     {}", revision.policy_gen);
                        println!("status:     {}", revision.status);
                        println!("created:    {}", revision.created_at.to_rfc3339());
                        match revision.applied_at {
                            Some(at) => println!("applied:    {}", at.to_rfc3339()),
                            None => println!("applied:    -"),
                        }
                        println!(
                            "actions:    {} total, {} success, {} failed, {} skipped",
                            revision.result.total,
                            revision.result.success,
                            revision.result.failed,
                            revision.result.skipped
                        );
                        if !revision.apply_log.is_empty() {
                            println!("log:");
                            for entry in &revision.apply_log {
                                println!(
                                    "  {} {:?} {}",
                                    entry.at.to_rfc3339(),
                                    entry.level,
                                    entry.message
                                );
                            }
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&revision)?),
                }
            }
        },
        Commands::State { command } => match command {
            StateCommands::Show => {
                let state = registry.get_actual_state()?;
                match cli.output {
                    Output::Human => {
                        println!(
                            "{:<40} {:<12} {:<10} UPDATED",
                            "COMPONENT", "CODE", "ENDPOINTS"
                        );
                        for instance in state.component_instances.values() {
                            println!(
                                "{:<40} {:<12} {:<10} {}",
                                instance.instance_key(),
                                instance.code_type.as_deref().unwrap_or("-"),
                                instance.endpoints.len(),
                                instance.updated_at.to_rfc3339()
                            );
                        }
                    }
                    Output::Json => {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&state.component_instances)?
                        )
                    }
                }
            }
        },
    }

    Ok(())
}
