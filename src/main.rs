//! winecell - Entry point
//!
//! Invoked as `winecell`, parses subcommands. Invoked through a proxy symlink
//! (`wine`, `wineserver`, ...), launches the matching Proton binary.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use miette::{IntoDiagnostic, Report, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use winecell::sandbox::{
    DEFAULT_LOG_LEVEL, LOG_LEVEL_VAR, MountPoint, PROXY_EXECUTABLE_NAME, SandboxMode,
    SessionConfig,
};
use winecell::session::{EnvironmentSnapshot, SYNC_VARIABLES, SessionOrchestrator};
use winecell::system::{self, HostRequirements, ShutdownSignals};

/// winecell - Run Wine tools against Proton prefixes inside the Steam Runtime.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Skip host checks (Flatpak sub-sandbox support)
    #[arg(long, default_value = "false", global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by subcommands that build a session configuration.
#[derive(clap::Args, Debug, Clone)]
struct SessionArgs {
    /// Sandbox mode: bwrap, legacy or off
    #[arg(long)]
    mode: Option<SandboxMode>,

    /// Wine prefix
    #[arg(long)]
    prefix: Option<PathBuf>,

    /// Proton installation directory
    #[arg(long)]
    proton: Option<PathBuf>,

    /// Steam Linux Runtime installation directory
    #[arg(long)]
    runtime: Option<PathBuf>,

    /// App ID the session belongs to
    #[arg(long)]
    app_id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command in a new session
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Reuse one container for every Wine binary of the session
        #[arg(long)]
        shared_container: bool,

        /// Keep a wineserver running for the duration of the session
        #[arg(long)]
        background_wineserver: bool,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<OsString>,
    },

    /// Launch a Proton binary as if invoked through its proxy
    Proxy {
        /// Binary name in the Proton build, e.g. wine
        binary: String,

        /// Arguments for the binary
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },

    /// Keep a wineserver running for a prefix until interrupted
    Keepalive {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Find a wineserver running for a prefix and show its settings
    Locate {
        #[command(flatten)]
        session: SessionArgs,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the directories the container would mount
    Mounts {
        #[command(flatten)]
        session: SessionArgs,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Check host support for the sandbox modes
    Check {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct LocateReport {
    prefix: Option<PathBuf>,
    pid: Option<u32>,
    variables: BTreeMap<&'static str, Option<String>>,
}

#[derive(Serialize)]
struct CheckReport {
    #[serde(flatten)]
    host: HostRequirements,
    requested_mode: SandboxMode,
    effective_mode: SandboxMode,
}

fn main() -> Result<()> {
    let mut argv = std::env::args_os();
    let argv0 = argv.next().unwrap_or_default();
    let invoked_as = Path::new(&argv0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(PROXY_EXECUTABLE_NAME)
        .to_string();

    let env = EnvironmentSnapshot::capture();

    if invoked_as != PROXY_EXECUTABLE_NAME {
        init_tracing(0, &env);
        let args: Vec<OsString> = argv.collect();
        let result = run_proxy(&env, &invoked_as, &args);
        std::process::exit(exit_code(result));
    }

    let cli = Cli::parse();
    let level = init_tracing(cli.verbose, &env);
    debug!("winecell v{}", env!("CARGO_PKG_VERSION"));

    let host = if cli.skip_checks {
        warn!("Skipping host checks (--skip-checks)");
        HostRequirements {
            flatpak_version: None,
            bwrap_supported: true,
        }
    } else {
        system::check_all()?
    };

    match cli.command {
        Commands::Run {
            session,
            shared_container,
            background_wineserver,
            command,
        } => {
            let config = session_config(&env, &session, &level)?
                .with_shared_container(shared_container)
                .with_background_helper(background_wineserver);
            let Some((program, args)) = command.split_first() else {
                return Err(miette::miette!("no command given"));
            };

            let signals = ShutdownSignals::install()?;
            let orchestrator = SessionOrchestrator::new(config).with_host_requirements(host);
            let result = orchestrator.run(&env, Path::new(program), args, Some(&signals));
            std::process::exit(exit_code(result));
        }
        Commands::Proxy { binary, args } => {
            let result = run_proxy(&env, &binary, &args);
            std::process::exit(exit_code(result));
        }
        Commands::Keepalive { session } => {
            let config = session_config(&env, &session, &level)?.with_background_helper(true);
            let signals = ShutdownSignals::install()?;
            let orchestrator = SessionOrchestrator::new(config).with_host_requirements(host);

            let session = orchestrator.start_session(&env)?;
            info!(session_id = session.id(), "Keepalive running, interrupt to stop");
            while !signals.shutdown_requested() {
                thread::sleep(Duration::from_millis(100));
            }
            drop(session);
            Ok(())
        }
        Commands::Locate { session, json } => {
            let config = session_config(&env, &session, &level)?;
            let orchestrator = SessionOrchestrator::new(config.clone());
            let helper = orchestrator.locate_helper();

            let report = LocateReport {
                prefix: config.prefix,
                pid: helper.as_ref().map(|h| h.pid),
                variables: SYNC_VARIABLES
                    .iter()
                    .map(|var| {
                        let value = helper
                            .as_ref()
                            .and_then(|h| h.environment.get(var.name))
                            .map(str::to_string);
                        (var.name, value)
                    })
                    .collect(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
            } else {
                match report.pid {
                    Some(pid) => {
                        println!("wineserver pid {pid}");
                        for (name, value) in &report.variables {
                            println!("{name}={}", value.as_deref().unwrap_or("<unset>"));
                        }
                    }
                    None => println!("no wineserver running for this prefix"),
                }
            }
            Ok(())
        }
        Commands::Mounts { session, json } => {
            let config = session_config(&env, &session, &level)?;
            let mounts: Vec<MountPoint> = SessionOrchestrator::new(config).resolve_mounts()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&mounts).into_diagnostic()?);
            } else {
                for mount in &mounts {
                    println!("--filesystem {}", mount.path.display());
                }
            }
            Ok(())
        }
        Commands::Check { json } => {
            let requested = SessionConfig::from_env(&env)?.mode;
            let report = CheckReport {
                effective_mode: host.effective_mode(requested),
                requested_mode: requested,
                host,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
            } else {
                match report.host.flatpak_version {
                    Some((major, minor, patch)) => {
                        println!("Flatpak: {major}.{minor}.{patch}");
                    }
                    None => println!("Flatpak: not running inside Flatpak"),
                }
                println!("bwrap supported: {}", report.host.bwrap_supported);
                println!(
                    "mode: {} (requested {})",
                    report.effective_mode, report.requested_mode
                );
            }
            Ok(())
        }
    }
}

/// Initializes logging and returns the level exported to child processes.
fn init_tracing(verbose: u8, env: &EnvironmentSnapshot) -> String {
    let level = match verbose {
        0 => env
            .get_non_empty(LOG_LEVEL_VAR)
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string(),
        1 => String::from("info"),
        2 => String::from("debug"),
        _ => String::from("trace"),
    };

    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    level
}

fn session_config(
    env: &EnvironmentSnapshot,
    args: &SessionArgs,
    level: &str,
) -> winecell::Result<SessionConfig> {
    let mut config = SessionConfig::from_env(env)?.with_log_level(level);
    if let Some(mode) = args.mode {
        config = config.with_mode(mode);
    }
    if let Some(prefix) = &args.prefix {
        config = config.with_prefix(prefix);
    }
    if let Some(proton) = &args.proton {
        config = config.with_proton_path(proton);
    }
    if let Some(runtime) = &args.runtime {
        config = config.with_runtime_path(runtime);
    }
    if let Some(app_id) = &args.app_id {
        config = config.with_target_id(app_id);
    }
    Ok(config)
}

fn run_proxy(env: &EnvironmentSnapshot, binary: &str, args: &[OsString]) -> winecell::Result<i32> {
    let config = SessionConfig::from_env(env)?;
    let signals = ShutdownSignals::install()?;
    SessionOrchestrator::new(config).proxy(binary, args, env, Some(&signals))
}

fn exit_code(result: winecell::Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            let code = e.exit_code();
            error!("Launch failed");
            eprintln!("{:?}", Report::new(e));
            code
        }
    }
}
