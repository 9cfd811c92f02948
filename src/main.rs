//! fwconverge - declarative convergence for iptables-family firewalls
//!
//! # Usage
//!
//! ```bash
//! fwconverge list                        # Live rules of both address families
//! fwconverge list --family IPv6          # Live rules of one family
//! fwconverge chains                      # Live chains across all families
//! fwconverge plan site.json              # Show what apply would do
//! fwconverge apply site.json             # Converge to the manifest
//! fwconverge remove "100 allow ssh"      # Ensure one rule is absent
//! fwconverge policy FORWARD:filter:IP drop  # Set a chain's default policy
//! fwconverge audit -n 50                 # Recent mutating operations
//! fwconverge init-config                 # Write the default configuration
//! fwconverge -vv --config ./cfg.json apply site.json
//! ```
//!
//! # Security
//!
//! - Runs as unprivileged user, elevates only for the firewall tools
//! - Only tools named in the configuration are ever run
//! - Audit trail of all mutating operations

use clap::{Parser, Subcommand};
use fwconverge::audit::AuditLog;
use fwconverge::config;
use fwconverge::core::backend::SystemRunner;
use fwconverge::core::chain::{ChainId, Policy};
use fwconverge::core::error::{Error, IptablesErrorPattern};
use fwconverge::core::manifest::{Ensure, Manifest};
use fwconverge::core::property::Family;
use fwconverge::core::reconcile::{Decision, Reconciler};
use fwconverge::core::serializer::rule_args;
use fwconverge::utils::{args_diff, truncate_string};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{Level, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "fwconverge", version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Converge iptables, ip6tables and ebtables to a declared state", long_about = None)]
struct Cli {
    /// Configuration file (default: config.json in the data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Do not write the audit log
    #[arg(long, global = true)]
    no_audit: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List live rules
    List {
        /// Only this family (IPv4 or IPv6)
        #[arg(long)]
        family: Option<Family>,
    },
    /// List live chains of every family
    Chains,
    /// Show the decisions for a manifest without applying them
    Plan {
        /// Manifest file (JSON)
        manifest: PathBuf,
    },
    /// Converge live state to a manifest
    Apply {
        /// Manifest file (JSON)
        manifest: PathBuf,
    },
    /// Ensure a rule is absent
    Remove {
        /// Rule name, e.g. "100 allow ssh"
        name: String,
        #[arg(long, default_value = "IPv4")]
        family: Family,
    },
    /// Set the default policy of a chain
    Policy {
        /// Chain as CHAIN:table:family, e.g. FORWARD:filter:IP
        chain: ChainId,
        /// accept, drop, return or empty
        policy: Policy,
    },
    /// Show recent audit log entries, newest first
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
    /// Write the default configuration (to --config, or the data directory)
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

/// Prints an error, plus hints for failures coming from the firewall tools
fn report_error(e: &Error) {
    eprintln!("Error: {e}");

    let detail = match e {
        Error::ApplyFailed { stderr, .. } => stderr.clone(),
        Error::DumpFailed { message, .. } | Error::PersistFailed { message, .. } => message.clone(),
        Error::Io(io) => io.to_string(),
        _ => return,
    };
    let translation = IptablesErrorPattern::match_error(&detail);
    eprintln!("  {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  • {suggestion}");
    }
    if e.is_partial_failure() {
        eprintln!("  The live rules changed; re-run to retry saving them.");
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Error> {
    if let Err(e) = fwconverge::utils::ensure_dirs() {
        warn!("Cannot create data directories: {}", e);
    }

    match cli.command {
        Commands::InitConfig { force } => return init_config(cli.config.as_deref(), force).await,
        Commands::Audit { count } => return audit(count).await,
        _ => {}
    }

    let config = config::load_config(cli.config.as_deref()).await?;
    let audit = if config.audit && !cli.no_audit {
        AuditLog::new()
            .inspect_err(|e| warn!("Audit log disabled: {}", e))
            .ok()
    } else {
        None
    };

    let runner = SystemRunner::new(config.allowed_programs());
    let reconciler = Reconciler::new(&config, runner)?.with_audit(audit);

    match cli.command {
        Commands::List { family } => list(&reconciler, family).await,
        Commands::Chains => chains(&reconciler).await,
        Commands::Plan { manifest } => plan(&reconciler, &manifest).await,
        Commands::Apply { manifest } => apply(&reconciler, &manifest).await,
        Commands::Remove { name, family } => {
            for outcome in reconciler.ensure_absent(&name, family).await? {
                println!("{name}: {outcome}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Policy { chain, policy } => {
            for outcome in reconciler.chains().set_policy(&chain, policy).await? {
                println!("{chain}: {outcome}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Audit { .. } | Commands::InitConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn init_config(path: Option<&Path>, force: bool) -> Result<ExitCode, Error> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config::default_config_path()
            .ok_or_else(|| Error::Internal("data directory not found".to_string()))?,
    };
    if !force && tokio::fs::try_exists(&path).await? {
        eprintln!("{} already exists (use --force to overwrite)", path.display());
        return Ok(ExitCode::FAILURE);
    }

    config::save_config(&config::AppConfig::default(), &path).await?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn audit(count: usize) -> Result<ExitCode, Error> {
    let log = AuditLog::new()?;
    let events = match log.read_recent(count).await {
        Ok(events) => events,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No audit log at {}", log.path().display());
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    for event in events {
        let status = if event.success { "ok" } else { "FAILED" };
        let subject = event
            .details
            .get("rule")
            .or_else(|| event.details.get("chain"))
            .or_else(|| event.details.get("family"))
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{} {:<13} {:<6} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.event_type),
            status,
            subject
        );
        if let Some(error) = event.error {
            println!("    {error}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn list(reconciler: &Reconciler<SystemRunner>, family: Option<Family>) -> Result<ExitCode, Error> {
    let families = match family {
        Some(f) => vec![f],
        None => vec![Family::Ipv4, Family::Ipv6],
    };

    for family in families {
        let live = reconciler.live_rules(family).await?;
        println!("{family} ({} rules):", live.len());
        for rule in live.rules() {
            println!(
                "  {:<40} {:<8} {:<12} {}",
                truncate_string(&rule.name, 40),
                rule.table,
                rule.chain,
                rule.target().unwrap_or("-")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn chains(reconciler: &Reconciler<SystemRunner>) -> Result<ExitCode, Error> {
    for chain in reconciler.chains().enumerate().await? {
        println!(
            "  {:<9} {:<8} {:<28} {}",
            chain.family.to_string(),
            chain.table,
            chain.chain,
            chain.policy.as_deref().unwrap_or("-")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn plan(reconciler: &Reconciler<SystemRunner>, path: &Path) -> Result<ExitCode, Error> {
    let manifest = Manifest::load(path).await?;
    let live_chains = reconciler.chains().enumerate().await?;
    let mut failed = false;

    for spec in &manifest.chains {
        let id = match spec.id() {
            Ok(id) => id,
            Err(e) => {
                println!("chain {}: error: {e}", spec.name);
                failed = true;
                continue;
            }
        };
        for family in &id.families {
            let exists = live_chains
                .iter()
                .any(|c| c.family == *family && c.chain == id.chain && c.table == id.table);
            let action = match (spec.ensure, exists) {
                (Ensure::Present, true) => "exists",
                (Ensure::Present, false) => "create",
                (Ensure::Absent, true) => "destroy",
                (Ensure::Absent, false) => "absent",
            };
            println!("chain {} ({family}): {action}", spec.name);
        }
    }

    for spec in &manifest.rules {
        if spec.ensure == Ensure::Absent {
            match reconciler.live_rules(spec.family).await {
                Ok(live) if live.find(&spec.name).is_some() => println!("{}: delete", spec.name),
                Ok(_) => println!("{}: absent", spec.name),
                Err(e) => {
                    println!("{}: error: {e}", spec.name);
                    failed = true;
                }
            }
            continue;
        }

        let planned = match spec.to_rule(reconciler.options()) {
            Ok(rule) => reconciler.plan(&rule).await,
            Err(e) => Err(e),
        };
        let planned = match planned {
            Ok(p) => p,
            Err(e) => {
                println!("{}: error: {e}", spec.name);
                failed = true;
                continue;
            }
        };

        match &planned.decision {
            Decision::Unchanged => println!("{}: unchanged", spec.name),
            Decision::Insert { position } => println!("{}: insert at {position}", spec.name),
            Decision::Move { from, position } => println!(
                "{}: move from {}:{} to {}:{} position {position}",
                spec.name, from.table, from.chain, planned.desired.table, planned.desired.chain
            ),
            Decision::Replace {
                position,
                differences,
            } => {
                println!(
                    "{}: replace at {position} ({})",
                    spec.name,
                    differences.join(", ")
                );
                let table = reconciler.table(spec.family)?;
                if let Some(live) = &planned.live {
                    let diff = args_diff(&rule_args(table, live)?, &rule_args(table, &planned.desired)?);
                    for line in diff.lines() {
                        println!("    {line}");
                    }
                }
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn apply(reconciler: &Reconciler<SystemRunner>, path: &Path) -> Result<ExitCode, Error> {
    let manifest = Manifest::load(path).await?;
    let report = reconciler.reconcile_manifest(&manifest).await;

    for item in &report.items {
        match &item.result {
            Ok(outcomes) => {
                let text: Vec<String> = outcomes.iter().map(ToString::to_string).collect();
                println!("✓ {}: {}", item.item, text.join(", "));
            }
            Err(e) => {
                println!("✗ {}", item.item);
                report_error(e);
            }
        }
    }

    println!(
        "{} items, {} changed, {} failed",
        report.items.len(),
        report.changed(),
        report.failures().count()
    );
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
