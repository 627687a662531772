//! claudemux: run Claude Code in one PTY per project and report which
//! sessions are waiting on a human.
//!
//! Usage:
//!   claudemux                 # Start every tracked project and stream events
//!   claudemux add <path>      # Track a project directory
//!   claudemux remove <path>   # Stop tracking a project directory
//!   claudemux list            # Show tracked projects

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use claudemux::config::Config;
use claudemux::persistence::JsonSessionStore;
use claudemux::pty::PtyLauncher;
use claudemux::registry::SessionRegistry;
use claudemux::session::CallerContext;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // Handle command-line flags
    match args.get(1).map(String::as_str) {
        None | Some("watch") => {}
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(command @ ("add" | "remove")) => {
            let Some(path) = args.get(2) else {
                eprintln!("Usage: claudemux {command} <path>");
                std::process::exit(1);
            };
            init_logging();
            let registry = open_registry(&Config::load()?)?;
            return if command == "add" {
                add_project(&registry, Path::new(path))
            } else {
                remove_project(&registry, Path::new(path))
            };
        }
        Some("list") => {
            init_logging();
            let registry = open_registry(&Config::load()?)?;
            list_projects(&registry);
            return Ok(());
        }
        Some(other) => {
            eprintln!("Unknown argument: {}", other);
            std::process::exit(1);
        }
    }

    init_logging();
    watch(&Config::load()?).await
}

fn print_usage() {
    println!("claudemux: Run Claude Code per project and flag sessions needing attention");
    println!();
    println!("Usage:");
    println!("  claudemux                Start all tracked projects and stream events");
    println!("  claudemux add <path>     Track a project directory");
    println!("  claudemux remove <path>  Stop tracking a project directory");
    println!("  claudemux list           Show tracked projects");
    println!();
    println!("Logging is controlled with RUST_LOG (default: info).");
}

/// Logs go to stderr so stdout stays a clean event stream.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Build a registry over the PTY launcher and the default session store,
/// with persisted sessions restored.
fn open_registry(config: &Config) -> Result<SessionRegistry> {
    let launcher = Arc::new(PtyLauncher::from_config(&config.launch));
    let store = Arc::new(JsonSessionStore::open_default()?);

    let registry = SessionRegistry::builder(launcher.clone(), launcher)
        .persistence(store)
        .global_args(&config.launch.global_args)
        .quiet_period(config.detection.quiet_period())
        .build();
    registry.restore().context("Failed to load saved sessions")?;
    Ok(registry)
}

fn add_project(registry: &SessionRegistry, path: &Path) -> Result<()> {
    let id = registry.add_session(path, &CallerContext::Interactive)?;
    if let Some(snapshot) = registry.snapshot(&id) {
        println!("Added {} ({})", snapshot.repo_name, snapshot.repo_path.display());
    }
    Ok(())
}

fn remove_project(registry: &SessionRegistry, path: &Path) -> Result<()> {
    let canonical = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let Some(snapshot) = registry
        .list_sessions()
        .into_iter()
        .find(|s| s.repo_path == canonical)
    else {
        anyhow::bail!("{} is not tracked", canonical.display());
    };

    registry.remove_session(&snapshot.id, &CallerContext::Interactive);
    println!("Removed {}", snapshot.repo_name);
    Ok(())
}

fn list_projects(registry: &SessionRegistry) {
    let sessions = registry.list_sessions();
    if sessions.is_empty() {
        println!("No tracked projects");
        return;
    }
    for session in sessions {
        match &session.args {
            Some(args) => println!("  {} {} [{}]", session.repo_name, session.repo_path.display(), args),
            None => println!("  {} {}", session.repo_name, session.repo_path.display()),
        }
    }
}

/// Start every tracked project and print each event as a JSON line until
/// Ctrl-C.
async fn watch(config: &Config) -> Result<()> {
    let registry = open_registry(config)?;
    let mut events = registry.subscribe();

    let sessions = registry.list_sessions();
    if sessions.is_empty() {
        println!("No tracked projects. Add one with: claudemux add <path>");
        return Ok(());
    }
    for session in &sessions {
        registry.start_session(&session.id, &CallerContext::Interactive);
    }
    info!(count = sessions.len(), "Watching sessions");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    registry.shutdown();
    Ok(())
}
