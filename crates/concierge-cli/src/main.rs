mod approvals;
mod chat;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use concierge_agent::{AgentReply, AgentRuntime};
use concierge_config::ConciergeConfig;

#[derive(Parser)]
#[command(name = "concierge", about = "Personal assistant over capability servers")]
struct Cli {
    /// Config file (defaults to ~/.concierge/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Machine-readable output and JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer one message and exit
    Ask {
        /// Consumer id (defaults to `default_consumer`)
        #[arg(short, long)]
        consumer: Option<String>,

        message: String,
    },
    /// Start an interactive session
    Chat {
        #[arg(short, long)]
        consumer: Option<String>,
    },
    /// List configured instances and their launch commands
    Instances,
    /// Check configuration and credentials
    Health,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load the config and the directory its relative paths resolve against.
fn load(path: Option<&Path>) -> Result<(ConciergeConfig, PathBuf)> {
    match path {
        Some(path) => {
            let config = concierge_config::load_config_at(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            let base_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Ok((config, base_dir))
        }
        None => {
            let config = concierge_config::load_config().context("Failed to load config")?;
            Ok((config, concierge_config::config_dir()?))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let (config, base_dir) = load(cli.config.as_deref())?;
    tracing::debug!(
        base_dir = %base_dir.display(),
        consumers = config.consumers.len(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Ask { consumer, message } => {
            let consumer = consumer.unwrap_or_else(|| config.default_consumer.clone());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_ask(config, base_dir, consumer, message, cli.json))?;
        }
        Commands::Chat { consumer } => {
            let consumer = consumer.unwrap_or_else(|| config.default_consumer.clone());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(chat::run_chat(config, base_dir, consumer))?;
        }
        Commands::Instances => print_instances(&config, &base_dir, cli.json)?,
        Commands::Health => print_health(&config, cli.json)?,
    }

    Ok(())
}

async fn run_ask(
    config: ConciergeConfig,
    base_dir: PathBuf,
    consumer: String,
    message: String,
    json: bool,
) -> Result<()> {
    let runtime = Arc::new(AgentRuntime::from_config(config, base_dir)?);
    let mut feed = approvals::subscribe(&runtime).await;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut run = {
        let runtime = runtime.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runtime.ask(&consumer, &message, &cancel).await })
    };

    let result = loop {
        tokio::select! {
            joined = &mut run => break joined?,
            Some(request) = feed.recv() => {
                let approved = approvals::prompt(&request).await?;
                runtime.resolve_approval(&request.request_id, approved, &cancel).await?;
            }
        }
    };

    runtime.shutdown().await;
    let reply = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reply_json(&reply))?);
    } else {
        println!("{}", reply.text);
        if reply.termination.is_aborted() {
            eprintln!("[stopped early: {}]", reply.termination.as_str());
        }
    }
    Ok(())
}

fn reply_json(reply: &AgentReply) -> serde_json::Value {
    json!({
        "text": reply.text,
        "termination": reply.termination.as_str(),
        "iterations": reply.iterations,
        "tool_calls": reply.tool_calls,
        "usage": reply.usage,
    })
}

fn print_instances(config: &ConciergeConfig, base_dir: &Path, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for (id, instance) in &config.instances {
        let used_by: Vec<&str> = config
            .consumers
            .iter()
            .filter(|(_, c)| c.services.iter().any(|s| s == id))
            .map(|(name, _)| name.as_str())
            .collect();
        let command = match concierge_mcp::factory::launch_spec(id, instance, base_dir) {
            Ok(spec) => spec.command_line(),
            Err(e) => format!("<{e}>"),
        };
        rows.push(json!({
            "id": id,
            "key": instance.key(id).to_string(),
            "command": command,
            "consumers": used_by,
        }));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No instances configured.");
    }
    for row in &rows {
        println!("{}  ({})", row["id"].as_str().unwrap_or(""), row["key"].as_str().unwrap_or(""));
        println!("  command:   {}", row["command"].as_str().unwrap_or(""));
        println!("  consumers: {}", row["consumers"]);
    }
    Ok(())
}

fn print_health(config: &ConciergeConfig, json: bool) -> Result<()> {
    let api_key_set = std::env::var(&config.model.api_key_env).is_ok_and(|v| !v.is_empty());
    let database = config.database_path()?;
    let unresolved: Vec<String> = config
        .consumers
        .keys()
        .filter_map(|id| config.consumer_instances(id).err().map(|e| e.to_string()))
        .collect();

    if json {
        let report = json!({
            "model": config.model.model,
            "api_key_set": api_key_set,
            "database": database.display().to_string(),
            "consumers": config.consumers.len(),
            "instances": config.instances.len(),
            "default_consumer": config.default_consumer,
            "problems": unresolved,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("concierge health");
    println!("  model: {}", config.model.model);
    println!(
        "  {}: {}",
        config.model.api_key_env,
        if api_key_set { "set" } else { "missing" }
    );
    println!("  database: {}", database.display());
    println!("  default consumer: {}", config.default_consumer);
    println!("  consumers configured: {}", config.consumers.len());
    println!("  instances configured: {}", config.instances.len());
    for problem in &unresolved {
        println!("  problem: {problem}");
    }
    Ok(())
}
