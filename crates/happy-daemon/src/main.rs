//! happy-daemon - Background control plane for remotely controlled agent sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use happy_core::config::resolve_settings;
use happy_core::control::SpawnSessionRequest;
use happy_core::daemon_client::{DaemonClient, StopOutcome, check_if_daemon_running, stop_daemon};
use happy_core::home::get_happy_home;
use happy_daemon::daemon::{DaemonConfig, clean_orphans, start_daemon};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// happy-daemon - Background control plane for agent sessions
#[derive(Parser, Debug)]
#[command(name = "happy-daemon")]
#[command(about = "Spawns, tracks and stops agent sessions on this machine")]
#[command(version)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Start {
        /// Skip the startup scan for orphaned agents
        #[arg(long)]
        no_orphan_scan: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show whether a daemon is running
    Status,
    /// List tracked sessions
    List,
    /// Spawn an agent session in a directory
    Spawn {
        directory: PathBuf,
        /// Session to resume
        #[arg(long)]
        session_id: Option<String>,
        /// Create the directory if it does not exist
        #[arg(long)]
        create_dir: bool,
    },
    /// Stop a session by id or PID-<pid>
    StopSession { session_id: String },
    /// Terminate agents left behind by a dead daemon
    CleanOrphans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        happy_core::logging::init_with_level(tracing::Level::DEBUG);
    } else {
        happy_core::logging::init();
    }

    let home = get_happy_home()?;
    let resolved = resolve_settings(&home).context("Failed to resolve settings")?;
    let settings = resolved.settings.daemon.clone();

    match args.command {
        Command::Start { no_orphan_scan } => {
            run_foreground(DaemonConfig {
                home,
                machine_id: resolved.machine_id,
                settings,
                clean_orphans_on_start: !no_orphan_scan,
            })
            .await
        }
        Command::Stop => {
            match stop_daemon(&home, settings.shutdown_grace()).await? {
                StopOutcome::NotRunning => println!("Daemon is not running"),
                StopOutcome::Graceful { pid } => println!("Daemon stopped (pid {pid})"),
                StopOutcome::Forced { pid, report } => {
                    if report.killed.is_empty() {
                        println!("Daemon terminated (pid {pid})");
                    } else {
                        println!("Daemon killed (pid {pid})");
                    }
                }
            }
            Ok(())
        }
        Command::Status => {
            match check_if_daemon_running(&home) {
                Some(state) => {
                    println!(
                        "Daemon running: pid {}, control port {}",
                        state.pid, state.control_port
                    );
                    if let Some(started_at) = state.started_at {
                        println!("Started at: {started_at}");
                    }
                }
                None => println!("Daemon is not running"),
            }
            Ok(())
        }
        Command::List => {
            let client = connect(&home, &settings)?;
            let sessions = client.list().await?;
            if sessions.is_empty() {
                println!("No tracked sessions");
            }
            for s in sessions {
                println!(
                    "{:>7}  {:<8}  {:<36}  {}",
                    s.pid,
                    s.started_by,
                    s.happy_session_id.as_deref().unwrap_or("-"),
                    s.directory.display()
                );
            }
            Ok(())
        }
        Command::Spawn {
            directory,
            session_id,
            create_dir,
        } => {
            let client = connect(&home, &settings)?;
            let directory = std::path::absolute(&directory)
                .with_context(|| format!("Invalid directory {}", directory.display()))?;
            let resp = client
                .spawn_session(&SpawnSessionRequest {
                    directory: directory.to_string_lossy().to_string(),
                    session_id,
                    approved_new_directory_creation: create_dir,
                })
                .await?;
            match (resp.success, resp.pid) {
                (true, Some(pid)) => println!("Spawned session (pid {pid})"),
                _ => {
                    let error = resp.error.unwrap_or_else(|| "unknown error".to_string());
                    if resp.request_to_approve_directory_creation == Some(true) {
                        anyhow::bail!("{error} (pass --create-dir to create it)");
                    }
                    anyhow::bail!("Spawn failed: {error}");
                }
            }
            Ok(())
        }
        Command::StopSession { session_id } => {
            let client = connect(&home, &settings)?;
            if client.stop_session(&session_id).await? {
                println!("Stopped {session_id}");
                Ok(())
            } else {
                anyhow::bail!("No tracked session {session_id}")
            }
        }
        Command::CleanOrphans => {
            let own = check_if_daemon_running(&home).map(|s| s.pid);
            let (orphans, report) = clean_orphans(own, settings.orphan_grace()).await;
            println!(
                "Found {} orphaned agent(s); {} exited, {} killed",
                orphans.len(),
                report.exited.len(),
                report.killed.len()
            );
            Ok(())
        }
    }
}

fn connect(home: &Path, settings: &happy_core::config::DaemonSettings) -> Result<DaemonClient> {
    DaemonClient::connect(home, settings.request_timeout())?
        .context("Daemon is not running (start it with `happy-daemon start`)")
}

async fn run_foreground(config: DaemonConfig) -> Result<()> {
    let handle = match start_daemon(config).await {
        Ok(handle) => handle,
        Err(e) if e.is_already_running() => {
            // A second start is a clean no-op.
            println!("{e}");
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to start daemon"),
    };
    println!("Daemon listening on 127.0.0.1:{}", handle.control_port());

    spawn_signal_listener(handle.cancel_token());
    handle.wait().await;

    info!("happy-daemon shutdown complete");
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to install SIGTERM handler");
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C");
        }

        cancel.cancel();
    });
}
