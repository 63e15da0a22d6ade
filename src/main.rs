//! Molegate CLI Entry Point
//!
//! Thin command layer over the coordination engine.
//!
//! # Usage
//!
//! ```bash
//! # Show the cooked step order of a formula
//! molegate cook polecat-work
//!
//! # Pour a molecule or a wisp, binding variables
//! molegate pour polecat-work issue=gt-123
//! molegate wisp deacon-patrol
//!
//! # Drive steps
//! molegate ready mol-1
//! molegate update mol-1 load in_progress
//!
//! # Workers
//! molegate work gastown/polecats/Toast polecat-work issue=gt-123
//! molegate recover gastown/polecats/Toast
//! molegate park gastown/polecats/Toast mol-1 push pr-merge:42
//!
//! # Gates, plugins and health
//! molegate close gate-7 "PR #42 merged"
//! molegate tick --watch 1m
//! molegate witness
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use colored::*;
use log::{debug, info};

use molegate::agent::{self, PolecatTarget, ResumePoint};
use molegate::config::{parse_duration, EngineConfig};
use molegate::gate::{self, LogWake};
use molegate::molecule::{self, Ending, StepStatus, Transition, WispEnd};
use molegate::monitoring::{survey, LogRecords, WorkerHealth};
use molegate::{Workspace, APP_NAME, VERSION};

/// Reason recorded by `close` when none is given
const DEFAULT_CLOSE_REASON: &str = "closed manually";

/// Parsed command.
#[derive(Debug, PartialEq)]
enum Command {
    Cook { formula: String },
    Pour { formula: String, vars: BTreeMap<String, String> },
    Wisp { formula: String, vars: BTreeMap<String, String> },
    Ready { molecule: String },
    Update { molecule: String, step: String, status: StepStatus },
    Attach { target: String, molecule: String },
    Work { target: String, formula: String, vars: BTreeMap<String, String> },
    Recover { target: String },
    Park { target: String, molecule: String, step: String, await_type: String },
    Close { gate: String, reason: String },
    Finish { molecule: String, burn: bool },
    Tick { watch: Option<Duration> },
    Witness,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    command: Command,
    config_path: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: molegate [OPTIONS] <COMMAND> [ARGS...]");
    println!();
    println!("Commands:");
    println!("  cook <formula>                           Show the cooked step order");
    println!("  pour <formula> [key=value...]            Pour a persistent molecule");
    println!("  wisp <formula> [key=value...]            Pour an ephemeral wisp");
    println!("  ready <molecule>                         List ready steps");
    println!("  update <molecule> <step> <status>        Change a step status");
    println!("  attach <target> <molecule>               Attach a molecule to a worker");
    println!("  work <target> <formula> [key=value...]   Pour and attach a work molecule");
    println!("  recover <target>                         Show where a worker resumes");
    println!("  park <target> <molecule> <step> <await>  Park a step on a new gate");
    println!("  close <gate> [reason]                    Close a gate and wake waiters");
    println!("  finish <molecule> [--burn]               Archive, squash or burn");
    println!("  tick [--watch DURATION]                  Run due plugins");
    println!("  witness                                  Survey worker health");
    println!();
    println!("Options:");
    println!("  --config PATH       Engine configuration file");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Targets have the form <scope>/polecats/<name>.");
}

fn parse_vars(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .filter(|(k, _)| !k.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("Expected key=value, got '{}'", arg))
        })
        .collect()
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some((name, rest)) = args.split_first() else {
        return Err("No command given".to_string());
    };
    let arg = |i: usize, what: &str| {
        rest.get(i)
            .cloned()
            .ok_or_else(|| format!("'{}' requires {}", name, what))
    };

    let command = match name.as_str() {
        "cook" => Command::Cook { formula: arg(0, "a formula")? },
        "pour" => Command::Pour {
            formula: arg(0, "a formula")?,
            vars: parse_vars(rest.get(1..).unwrap_or_default())?,
        },
        "wisp" => Command::Wisp {
            formula: arg(0, "a formula")?,
            vars: parse_vars(rest.get(1..).unwrap_or_default())?,
        },
        "ready" => Command::Ready { molecule: arg(0, "a molecule")? },
        "update" => Command::Update {
            molecule: arg(0, "a molecule")?,
            step: arg(1, "a step")?,
            status: arg(2, "a status")?.parse()?,
        },
        "attach" => Command::Attach {
            target: arg(0, "a target")?,
            molecule: arg(1, "a molecule")?,
        },
        "work" => Command::Work {
            target: arg(0, "a target")?,
            formula: arg(1, "a formula")?,
            vars: parse_vars(rest.get(2..).unwrap_or_default())?,
        },
        "recover" => Command::Recover { target: arg(0, "a target")? },
        "park" => Command::Park {
            target: arg(0, "a target")?,
            molecule: arg(1, "a molecule")?,
            step: arg(2, "a step")?,
            await_type: arg(3, "an await type")?,
        },
        "close" => {
            let gate = arg(0, "a gate")?;
            let mut reason = rest.get(1..).unwrap_or_default().join(" ");
            if reason.trim().is_empty() {
                reason = DEFAULT_CLOSE_REASON.to_string();
            }
            Command::Close { gate, reason }
        }
        "finish" => Command::Finish {
            molecule: arg(0, "a molecule")?,
            burn: rest.iter().skip(1).any(|a| a == "--burn"),
        },
        "tick" => {
            let watch = match rest.iter().position(|a| a == "--watch") {
                Some(i) => Some(parse_duration(&arg(i + 1, "a --watch duration")?)?),
                None => None,
            };
            Command::Tick { watch }
        }
        "witness" => Command::Witness,
        other => return Err(format!("Unknown command: {}", other)),
    };
    Ok(command)
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config_path = None;
    let mut verbose = false;
    let mut rest = Vec::new();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                verbose = true;
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a path argument".to_string());
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            _ => rest.push(arg.clone()),
        }
        i += 1;
    }

    Ok(Config {
        command: parse_command(&rest)?,
        config_path,
        verbose,
    })
}

fn bead_id(workspace: &Workspace, target: &str) -> Result<String, Box<dyn std::error::Error>> {
    let target = PolecatTarget::parse(target)?;
    Ok(target.bead_id(workspace.config().prefix_for(&target.scope)))
}

fn print_status(status: StepStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        StepStatus::Pending => text.dimmed(),
        StepStatus::InProgress => text.yellow(),
        StepStatus::Closed => text.green(),
        StepStatus::Skipped => text.blue(),
    }
}

fn execute(workspace: &Workspace, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let client = workspace.client();

    match command {
        Command::Cook { formula } => {
            let proto = workspace.proto(&formula)?;
            println!("{} ({} steps, exit {})", proto.key().to_string().bold(), proto.steps().len(), proto.exit());
            for step in proto.steps() {
                if step.needs.is_empty() {
                    println!("  {}  {}", step.id.cyan(), step.title);
                } else {
                    println!("  {}  {} (needs {})", step.id.cyan(), step.title, step.needs.join(", "));
                }
            }
        }
        Command::Pour { formula, vars } => {
            let mol = workspace.pour(&formula, &vars)?;
            println!("{} {}", "✓".green(), mol.id);
        }
        Command::Wisp { formula, vars } => {
            let mol = workspace.wisp(&formula, &vars)?;
            println!("{} {}", "✓".green(), mol.id);
        }
        Command::Ready { molecule } => {
            let state = client.read()?;
            let mol = state.molecule(&molecule)?;
            for step in &mol.steps {
                println!("  {:<12} {:<12} {}", step.id, print_status(step.status), step.title);
            }
            let ready = molecule::ready(mol);
            if ready.is_empty() {
                println!("{}", "No ready steps".dimmed());
            } else {
                let ids: Vec<&str> = ready.iter().map(|s| s.id.as_str()).collect();
                println!("Ready: {}", ids.join(", ").green());
            }
        }
        Command::Update { molecule, step, status } => {
            match molecule::update(client, &molecule, &step, status)? {
                Transition::Applied => println!("{} {}/{} -> {}", "✓".green(), molecule, step, print_status(status)),
                Transition::Unchanged => println!("{}/{} already {}", molecule, step, print_status(status)),
            }
        }
        Command::Attach { target, molecule } => {
            let outcome = agent::attach(client, workspace.config(), &target, &molecule)?;
            println!("{} {} carries {}", "✓".green(), target, outcome.molecule());
        }
        Command::Work { target, formula, vars } => {
            let outcome = agent::attach_work_molecule(
                client,
                workspace.config(),
                workspace.cookbook(),
                workspace.library(),
                &target,
                &formula,
                &vars,
            )?;
            println!("{} {} carries {}", "✓".green(), target, outcome.molecule());
        }
        Command::Recover { target } => {
            let point = agent::recover_target(client, workspace.config(), &target)?;
            match point {
                ResumePoint::Idle => println!("{} is idle", target),
                ResumePoint::Resume { molecule, step } => {
                    println!("Resume {} at {}", molecule, step.yellow())
                }
                ResumePoint::Parked { molecule, step, gates } => println!(
                    "{}/{} parked on {}",
                    molecule,
                    step,
                    gates.join(", ").yellow()
                ),
                ResumePoint::Next { molecule, ready } => {
                    println!("Continue {} with {}", molecule, ready.join(", ").green())
                }
                ResumePoint::Finished { molecule } => println!("{} finished", molecule.green()),
                ResumePoint::Blocked { molecule } => println!("{} is blocked", molecule.red()),
            }
        }
        Command::Park { target, molecule, step, await_type } => {
            let await_type = await_type.parse::<gate::AwaitType>()?;
            let bead = bead_id(workspace, &target)?;
            let gate = agent::park(client, &bead, &molecule, &step, await_type, Utc::now())?;
            println!("{} parked on {}", step, gate.id.yellow());
        }
        Command::Close { gate, reason } => {
            let outcome = gate::service::close(client, &LogWake, &gate, &reason, Utc::now())?;
            println!("{} {} {:?}", "✓".green(), gate, outcome);
        }
        Command::Finish { molecule, burn } => {
            let wisp_end = if burn {
                WispEnd::Burn
            } else {
                WispEnd::Squash { summary: None, labels: Vec::new() }
            };
            match molecule::finish(client, &LogRecords, &molecule, wisp_end)? {
                Ending::Archived(id) => println!("{} archived {}", "✓".green(), id),
                Ending::Squashed(digest) => println!("{} squashed into {}", "✓".green(), digest.id),
                Ending::Burned(id) => println!("{} burned {}", "✓".green(), id),
            }
        }
        Command::Tick { watch } => {
            let runner = workspace.plugin_runner()?;
            let runtime = tokio::runtime::Runtime::new()?;
            match watch {
                Some(every) => {
                    info!("Ticking every {:?}", every);
                    runtime.block_on(runner.run(every));
                }
                None => {
                    let report = runtime.block_on(runner.tick())?;
                    debug!("{:?}", report);
                    println!(
                        "Ran {}, failed {}, cooling {}, swept {}",
                        report.ran.len(),
                        report.failed.len().to_string().red(),
                        report.cooling.len(),
                        report.swept.len()
                    );
                }
            }
        }
        Command::Witness => {
            let state = client.read()?;
            let report = survey(&state, Utc::now(), workspace.config().stale_after);
            for check in &report.checks {
                let health = match check.health {
                    WorkerHealth::Stalled => check.health.to_string().red(),
                    WorkerHealth::Parked => check.health.to_string().yellow(),
                    WorkerHealth::Working | WorkerHealth::Done => check.health.to_string().green(),
                    WorkerHealth::Idle => check.health.to_string().dimmed(),
                };
                println!("  {:<32} {:<8} {}", check.bead, health, check.detail);
            }
            println!(
                "Checked {}: {} working, {} parked, {} stalled, {} idle, {} done",
                report.checked, report.working, report.parked, report.stalled, report.idle, report.done
            );
        }
    }
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    let engine_config = match &config.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };
    let workspace = Workspace::open(engine_config)?;

    execute(&workspace, config.command)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red(), e);
            ExitCode::FAILURE
        }
    }
}
