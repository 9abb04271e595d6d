//! Command-line interface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use crate::backend::TmuxBackend;
use crate::budget::BudgetBook;
use crate::config::{agentmux_home, Settings};
use crate::orchestrator::Orchestrator;
use crate::task::file_store::JsonFileTaskStore;

#[derive(Parser)]
#[command(name = "agentmux", version, about = "Control plane for AI agent sessions")]
pub struct Cli {
    /// Override the agentmux home directory.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the kernel against a project directory.
    Start {
        /// Project directory agents will work in.
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
    /// Check the local environment: tmux, home directory, config health.
    Doctor,
}

pub async fn run(cli: Cli) -> Result<()> {
    let home = cli.home.unwrap_or_else(agentmux_home);
    match cli.command {
        Commands::Start { project } => start(&home, &project).await,
        Commands::Doctor => doctor(&home),
    }
}

async fn start(home: &std::path::Path, project: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(home)?;
    let project = project.canonicalize()?;
    let backend = Arc::new(TmuxBackend::new()?);
    let store = Arc::new(JsonFileTaskStore::new(
        project.join(crate::config::PROJECT_DIR_NAME).join("tasks.json"),
    ));
    store.start_watching().await;

    let kernel = Orchestrator::new(backend, Arc::clone(&store) as _, home, &project);
    kernel.start().await?;
    println!(
        "{} kernel running for {} (Ctrl-C to stop)",
        "agentmux".green().bold(),
        project.display()
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    kernel.stop().await;
    store.stop_watching().await;
    Ok(())
}

fn doctor(home: &std::path::Path) -> Result<()> {
    let mut healthy = true;

    match TmuxBackend::new() {
        Ok(_) => println!("{} tmux available", "✓".green()),
        Err(e) => {
            healthy = false;
            println!("{} tmux: {}", "✗".red(), e);
        }
    }

    match std::fs::create_dir_all(home)
        .and_then(|_| std::fs::write(home.join(".doctor-probe"), b"ok"))
        .and_then(|_| std::fs::remove_file(home.join(".doctor-probe")))
    {
        Ok(_) => println!("{} home writable at {}", "✓".green(), home.display()),
        Err(e) => {
            healthy = false;
            println!("{} home {}: {}", "✗".red(), home.display(), e);
        }
    }

    // Loaders fall back to defaults on malformed files, so these lines
    // report health rather than gate startup.
    let _ = Settings::load(home);
    println!("{} settings loaded (defaults on any parse warning above)", "✓".green());
    let book = BudgetBook::load(home);
    println!(
        "{} budgets loaded ({} agent, {} project scope(s))",
        "✓".green(),
        book.agents.len(),
        book.projects.len()
    );

    if healthy {
        println!("{}", "environment looks good".green());
        Ok(())
    } else {
        anyhow::bail!("environment problems found")
    }
}
