//! Command handlers: thin shells over the run manager

use crate::store::FileCredentialStore;
use anyhow::Context;
use moat_config::{AgentConfig, GlobalConfig};
use moat_core::{
    CreateOptions, Manager, ManagerOptions, ProviderRegistry, RoutingTable, Run, StartOptions,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct CreateArgs {
    pub workspace: Option<PathBuf>,
    pub name: Option<String>,
    pub grants: Vec<String>,
    pub env: Vec<String>,
    pub keep: bool,
    pub rebuild: bool,
    pub interactive: bool,
    pub cmd: Vec<String>,
}

/// Wire up the manager from global config and the file-backed credential
/// store. The per-run auth proxy ships as a separate daemon; without it,
/// credential-granted runs are rejected at create.
pub async fn build_manager() -> anyhow::Result<Arc<Manager>> {
    let global = GlobalConfig::load()?;
    let store = Arc::new(FileCredentialStore::open(&global)?);

    let manager = Manager::new(ManagerOptions {
        global,
        store,
        providers: ProviderRegistry::with_builtins(),
        proxy_launcher: None,
        routes: Arc::new(RoutingTable::new()),
        runtime: None,
    })
    .await
    .context("failed to initialize the run manager (is the container runtime up?)")?;
    Ok(manager)
}

fn parse_env(entries: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut env = HashMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("invalid --env '{}', expected KEY=VALUE", entry))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

fn build_options(args: CreateArgs) -> anyhow::Result<CreateOptions> {
    let workspace = match args.workspace {
        Some(workspace) => workspace,
        None => std::env::current_dir()?,
    };
    let config = AgentConfig::load_from_workspace(&workspace)?;

    let mut options = CreateOptions::new(workspace);
    options.name = args.name;
    options.grants = args.grants;
    options.env = parse_env(&args.env)?;
    options.keep_container = args.keep;
    options.rebuild = args.rebuild;
    options.interactive = args.interactive;
    if !args.cmd.is_empty() {
        options.cmd = Some(args.cmd);
    }
    options.config = config;
    Ok(options)
}

pub async fn create(manager: &Manager, args: CreateArgs) -> anyhow::Result<Arc<Run>> {
    let options = build_options(args)?;
    Ok(manager.create(options).await?)
}

pub async fn run(manager: &Manager, args: CreateArgs) -> anyhow::Result<()> {
    let interactive = args.interactive;
    let run = create(manager, args).await?;

    if interactive {
        let code = manager
            .start_attached(
                &run.id,
                Box::new(tokio::io::stdin()),
                Box::new(tokio::io::stdout()),
            )
            .await?;
        if code != 0 {
            std::process::exit(code as i32);
        }
        return Ok(());
    }

    manager
        .start(&run.id, StartOptions { stream_logs: true })
        .await?;
    manager.wait(&run.id, &CancellationToken::new()).await?;
    Ok(())
}

async fn resolve(manager: &Manager, reference: &str) -> anyhow::Result<Arc<Run>> {
    manager
        .find(reference)
        .await
        .with_context(|| format!("no run matching '{}'", reference))
}

pub async fn start(manager: &Manager, reference: &str, stream_logs: bool) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    manager.start(&run.id, StartOptions { stream_logs }).await?;
    println!("started {}", run.name);
    Ok(())
}

pub async fn stop(manager: &Manager, reference: &str) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    manager.stop(&run.id).await?;
    println!("stopped {}", run.name);
    Ok(())
}

pub async fn list(manager: &Manager) -> anyhow::Result<()> {
    let runs = manager.list().await;
    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }

    println!(
        "{:<18} {:<20} {:<9} {:<20} GRANTS",
        "ID", "NAME", "STATE", "CREATED"
    );
    for run in runs {
        let status = run.status_snapshot();
        let grants: Vec<String> = run.grants.iter().map(|g| g.to_string()).collect();
        println!(
            "{:<18} {:<20} {:<9} {:<20} {}",
            run.id,
            run.name,
            status.state.to_string(),
            status.created_at.format("%Y-%m-%d %H:%M:%S"),
            grants.join(",")
        );
    }
    Ok(())
}

pub async fn logs(
    manager: &Manager,
    reference: &str,
    tail: usize,
    follow: bool,
) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    if follow {
        let mut stdout = tokio::io::stdout();
        manager.follow_logs(&run.id, &mut stdout).await?;
        return Ok(());
    }
    for entry in manager.recent_logs(&run.id, tail).await? {
        print!("{}", entry.message);
    }
    Ok(())
}

pub async fn wait(manager: &Manager, reference: &str) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    manager.wait(&run.id, &CancellationToken::new()).await?;
    Ok(())
}

pub async fn attach(manager: &Manager, reference: &str) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    manager
        .attach(
            &run.id,
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
        )
        .await?;
    Ok(())
}

pub async fn destroy(manager: &Manager, reference: &str) -> anyhow::Result<()> {
    let run = resolve(manager, reference).await?;
    manager.destroy(&run.id).await?;
    println!("removed {}", run.name);
    Ok(())
}
