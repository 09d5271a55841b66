//! modulard CLI - module build daemon and its clients.
//!
//! Usage:
//!   modulard daemon                      # Run the daemon in the foreground
//!   modulard compile -- clang++ -c a.cpp # Build a unit's modules, print -fmodule-file flags
//!   modulard compile --run -- ...        # ...then run the command with them
//!   modulard status                      # Graph, cache and connection summary
//!   modulard prune                       # Sweep expired cache entries now
//!   modulard invalidate-session <ID>     # Forget a build session
//!   modulard shutdown                    # Stop the daemon

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use modulard::config::{ConfigOverrides, SchedulingPolicy};
use modulard::coordinator::Registration;
use modulard::daemon::{ensure_daemon, is_daemon_running, send_request, start_daemon, Client, CompileReply};
use modulard::daemon::{Request, Response};
use modulard::toolchain::command::module_file_flags;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modulard")]
#[command(about = "modulard - build daemon for C++ named modules", long_about = None)]
struct Cli {
    /// Project root directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Upper bound on concurrent module builds
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// fan-in or tu-at-a-time
        #[arg(long)]
        policy: Option<SchedulingPolicy>,

        /// Seconds without connections before the daemon exits
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Write logs to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Build the modules a translation unit imports
    Compile {
        /// Build-session marker; units sharing it validate sources once
        #[arg(long, env = "MODULARD_SESSION")]
        session: Option<String>,

        /// Source of a module interface, NAME=PATH (repeatable)
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, PathBuf)>,

        /// Run the command with the -fmodule-file flags instead of printing them
        #[arg(long)]
        run: bool,

        /// The unit's compiler command
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Show graph, cache and connection status
    Status,

    /// Sweep expired cache entries now
    Prune,

    /// Forget a build session so its units revalidate their sources
    InvalidateSession {
        id: String,
    },

    /// Stop the daemon after running builds finish
    Shutdown,

    /// Check whether the daemon answers
    Ping,
}

fn parse_mapping(s: &str) -> std::result::Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("expected NAME=PATH, got '{s}'")),
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modulard=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let root = cli.root.canonicalize().unwrap_or(cli.root);

    match cli.command {
        Commands::Daemon {
            max_concurrency,
            policy,
            idle_timeout,
            log_file,
        } => {
            init_logging(log_file.as_ref())?;
            let overrides = ConfigOverrides {
                idle_timeout_secs: idle_timeout,
                max_concurrency,
                policy,
            };
            start_daemon(&root, &overrides)?;
        }

        Commands::Compile {
            session,
            mappings,
            run: execute,
            command,
        } => {
            let working_directory = std::env::current_dir()?;
            let file_mapping: BTreeMap<String, PathBuf> = mappings.into_iter().collect();
            ensure_daemon(&root)?;
            let reply = Client::connect(&root)?.compile(Registration {
                working_directory,
                command: command.clone(),
                file_mapping,
                session,
            })?;
            match reply {
                CompileReply::Built { artifacts } => {
                    let flags = module_file_flags(artifacts.iter().map(|(n, p)| (n.as_str(), p.as_path())));
                    if execute {
                        run_compiler(&command, &flags)?;
                    } else {
                        for flag in flags {
                            println!("{flag}");
                        }
                    }
                }
                CompileReply::Failed { module, message } => {
                    bail!("module {module} failed to build:\n{message}");
                }
            }
        }

        Commands::Status => {
            let data = expect_ok(send_request(&root, Request::Status)?)?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }

        Commands::Prune => {
            let data = expect_ok(send_request(&root, Request::Prune)?)?;
            println!(
                "Evicted {} entries, freed {} bytes",
                data["evicted"], data["freed_bytes"]
            );
        }

        Commands::InvalidateSession { id } => {
            let data = expect_ok(send_request(&root, Request::InvalidateSession { session: id.clone() })?)?;
            if data["invalidated"].as_bool().unwrap_or(false) {
                println!("Session {id} invalidated");
            } else {
                println!("Session {id} was not known to the daemon");
            }
        }

        Commands::Shutdown => {
            if !is_daemon_running(&root) {
                println!("Daemon is not running");
                return Ok(());
            }
            match send_request(&root, Request::Shutdown)? {
                Response::Goodbye => println!("Daemon shutting down"),
                other => bail!("unexpected response: {other:?}"),
            }
        }

        Commands::Ping => match send_request(&root, Request::Ping) {
            Ok(Response::Pong) => println!("Daemon is running"),
            Ok(other) => bail!("unexpected response: {other:?}"),
            Err(_) => {
                println!("Daemon is not running");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

fn expect_ok(response: Response) -> Result<serde_json::Value> {
    match response {
        Response::Ok { data } => Ok(data),
        Response::Error { message } => bail!(message),
        other => bail!("unexpected response: {other:?}"),
    }
}

/// Run the unit's own command with the module artifacts made visible.
fn run_compiler(command: &[String], flags: &[String]) -> Result<()> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty compiler command");
    };
    let status = Command::new(program)
        .args(flags)
        .args(args)
        .status()
        .with_context(|| format!("cannot run {program}"))?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}
