//! moat - run AI agents in credential-isolated sandboxes

mod commands;
mod store;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "moat")]
#[command(author, version, about = "Sandboxed agent runs with host-held credentials", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a run without starting it
    Create {
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<std::path::PathBuf>,
        /// Run name
        #[arg(long)]
        name: Option<String>,
        /// Grants, e.g. github, aws:<role-arn>, ssh:github.com
        #[arg(long = "grant")]
        grants: Vec<String>,
        /// KEY=VALUE environment entries
        #[arg(long = "env")]
        env: Vec<String>,
        /// Keep the container after exit
        #[arg(long)]
        keep: bool,
        /// Force an image rebuild
        #[arg(long)]
        rebuild: bool,
        /// Command to run
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },

    /// Create, start, and wait for a run
    Run {
        #[arg(long)]
        workspace: Option<std::path::PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "grant")]
        grants: Vec<String>,
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long)]
        keep: bool,
        #[arg(long)]
        rebuild: bool,
        /// Attach stdio instead of streaming logs
        #[arg(short, long)]
        interactive: bool,
        #[arg(trailing_var_arg = true)]
        cmd: Vec<String>,
    },

    /// Start a created run
    Start {
        /// Run id or name
        run: String,
        /// Do not forward container output
        #[arg(long)]
        quiet: bool,
    },

    /// Stop a running run
    Stop {
        run: String,
    },

    /// List runs
    Ls,

    /// Show captured or recent logs
    Logs {
        run: String,
        /// Number of lines from the end
        #[arg(short = 'n', long, default_value_t = 100)]
        tail: usize,
        /// Keep streaming until the run exits
        #[arg(short, long)]
        follow: bool,
    },

    /// Block until a run exits
    Wait {
        run: String,
    },

    /// Attach stdio to a running run
    Attach {
        run: String,
    },

    /// Destroy a stopped run and its storage
    Rm {
        run: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let manager = commands::build_manager().await?;

    let result = match cli.command {
        Commands::Create {
            workspace,
            name,
            grants,
            env,
            keep,
            rebuild,
            cmd,
        } => {
            commands::create(
                &manager,
                commands::CreateArgs {
                    workspace,
                    name,
                    grants,
                    env,
                    keep,
                    rebuild,
                    interactive: false,
                    cmd,
                },
            )
            .await
            .map(|run| println!("{} {}", run.id, run.name))
        }
        Commands::Run {
            workspace,
            name,
            grants,
            env,
            keep,
            rebuild,
            interactive,
            cmd,
        } => {
            commands::run(
                &manager,
                commands::CreateArgs {
                    workspace,
                    name,
                    grants,
                    env,
                    keep,
                    rebuild,
                    interactive,
                    cmd,
                },
            )
            .await
        }
        Commands::Start { run, quiet } => commands::start(&manager, &run, !quiet).await,
        Commands::Stop { run } => commands::stop(&manager, &run).await,
        Commands::Ls => commands::list(&manager).await,
        Commands::Logs { run, tail, follow } => {
            commands::logs(&manager, &run, tail, follow).await
        }
        Commands::Wait { run } => commands::wait(&manager, &run).await,
        Commands::Attach { run } => commands::attach(&manager, &run).await,
        Commands::Rm { run } => commands::destroy(&manager, &run).await,
    };

    manager.close().await;
    result
}
