use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deckhand::client;
use deckhand::config::{AgentConfig, resolve_repo_ref};
use deckhand::serve;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(version, about = "Containerized coding-agent orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an agent environment and hand it work
    Run {
        /// Stay attached: a prompt loop that streams agent output
        #[arg(short, long)]
        interactive: bool,

        /// Initial task for the agent
        #[arg(short, long)]
        prompt: Option<String>,

        /// Repository to clone (defaults to REPO_URL, then the local origin)
        #[arg(long)]
        repo: Option<String>,

        /// Branch to clone (defaults to CLONE_BRANCH, then the local branch)
        #[arg(long)]
        branch: Option<String>,

        /// Branch the agent commits and pushes to
        #[arg(long)]
        push_branch: Option<String>,

        /// Run on a remote machine instead of local Docker
        #[arg(long)]
        remote: bool,

        /// Name for the environment (defaults to a generated one)
        #[arg(long)]
        name: Option<String>,
    },
    /// Tail the most recently started environment
    Status,
    /// Stop a named environment, or all of them
    Stop {
        /// Environment name; omit to stop everything live
        name: Option<String>,

        /// Skip the confirmation prompt when stopping multiple environments
        #[arg(long)]
        force: bool,
    },
    /// In-environment entry point (run inside the container)
    #[command(hide = true)]
    Serve,
}

fn generated_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("agent-{}", &suffix[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            interactive,
            prompt,
            repo,
            branch,
            push_branch,
            remote,
            name,
        } => {
            let container_name = name.unwrap_or_else(generated_name);
            let repo_ref = resolve_repo_ref(repo, branch, push_branch, &container_name)?;
            let config = AgentConfig::from_env(container_name, remote)?;
            if interactive {
                client::run_interactive(config, repo_ref, prompt).await?;
            } else {
                client::run_detached(config, repo_ref, prompt).await?;
            }
        }
        Commands::Status => client::cmd_status().await?,
        Commands::Stop { name, force } => client::cmd_stop(name, force).await?,
        Commands::Serve => serve::run().await?,
    }

    Ok(())
}
