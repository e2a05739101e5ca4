//! Arena 命令行入口
//!
//! - `arena run --flow debate --topic "..."`：按 Flow 轮流询问各 Agent，可选 --conclude 生成结论
//! - `arena flows`：列出可用 Flow
//! - `arena history [--clear]`：查看 / 清空历史
//!
//! 运行中按 Ctrl+C 会调用 stop()，正在进行的轮次结束后其结果被丢弃。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use arena::channel::{ChannelAdapter, ChannelLost, ScriptedAdapter};
use arena::config::{load_config, AppConfig};
use arena::core::{OrchestratorBuilder, RunStatus, StartRequest, Timing, TurnOrchestrator};
use arena::flow::FlowCatalog;
use arena::history::JsonHistoryStore;

#[derive(Parser)]
#[command(name = "arena")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run turn-based discussions between chat agents", long_about = None)]
struct Cli {
    /// Extra config file (layered over config/default.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow on a topic
    Run {
        /// Flow id (see `arena flows`)
        #[arg(short, long)]
        flow: String,

        /// Topic given to every agent
        #[arg(short, long)]
        topic: String,

        /// Agents to include (default: [app].default_agents)
        #[arg(short, long, value_delimiter = ',')]
        agents: Vec<String>,

        /// Ask an agent for a conclusion after the run completes
        /// (default agent: [app].conclusion_agent, else the first one in the run)
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        conclude: Option<String>,

        /// Use scripted agents instead of a browser
        #[arg(long)]
        dry_run: bool,
    },

    /// List available flows
    Flows,

    /// Show saved runs
    History {
        /// Delete all saved runs
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    arena::observability::init(cli.verbose, cli.json);

    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Commands::Run {
            flow,
            topic,
            agents,
            conclude,
            dry_run,
        } => cmd_run(&cfg, flow, topic, agents, conclude, dry_run).await,
        Commands::Flows => cmd_flows(&cfg),
        Commands::History { clear } => cmd_history(&cfg, clear).await,
    }
}

async fn cmd_run(
    cfg: &AppConfig,
    flow: String,
    topic: String,
    agents: Vec<String>,
    conclude: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let agents = if agents.is_empty() {
        cfg.app.default_agents.clone()
    } else {
        agents
    };

    let (loss_tx, loss_rx) = tokio::sync::mpsc::unbounded_channel::<ChannelLost>();
    let (adapter, timing): (Arc<dyn ChannelAdapter>, Timing) = if dry_run {
        let scripted = ScriptedAdapter::new(agents.clone()).with_loss_notifier(loss_tx);
        (Arc::new(scripted), Timing::zero())
    } else {
        (browser_adapter(cfg, loss_tx)?, Timing::default())
    };

    let orchestrator = Arc::new(
        OrchestratorBuilder::new(adapter)
            .with_config(cfg)
            .context("Failed to load flows")?
            .with_timing(timing)
            .with_loss_events(loss_rx)
            .build(),
    );

    let token = CancellationToken::new();
    spawn_event_logger(&orchestrator, token.clone());
    spawn_interrupt_handler(&orchestrator, token.clone());

    let request = StartRequest::new(agents.clone(), flow, topic);
    let outcome = orchestrator.start(request).await;
    token.cancel();

    let status = match outcome {
        Ok(status) => status,
        Err(e) if e.is_rejection() => anyhow::bail!("{}; see `arena flows` for flow ids and agents", e),
        Err(e) => return Err(e).context("Flow failed"),
    };
    let state = orchestrator.get_state().await;
    for record in &state.transcript {
        println!(
            "\n=== Turn {} · {} ({}) ===\n{}",
            record.turn_index + 1,
            record.agent_id.to_uppercase(),
            record.role,
            record.text
        );
    }

    if status != RunStatus::Complete {
        println!("\nFlow ended with status: {}", status);
        return Ok(());
    }

    if let Some(requested) = conclude {
        let agent = if !requested.is_empty() {
            requested
        } else if let Some(configured) = &cfg.app.conclusion_agent {
            configured.clone()
        } else {
            state
                .agent_order
                .first()
                .map(|a| a.agent_id.clone())
                .context("Run had no agents")?
        };
        let conclusion = orchestrator
            .conclude(&agent)
            .await
            .context("Failed to generate conclusion")?;
        println!("\n=== Conclusion · {} ===\n{}", agent.to_uppercase(), conclusion);
    }

    Ok(())
}

#[cfg(feature = "browser")]
fn browser_adapter(
    cfg: &AppConfig,
    loss_tx: tokio::sync::mpsc::UnboundedSender<ChannelLost>,
) -> Result<Arc<dyn ChannelAdapter>> {
    let browser = Arc::new(
        arena::channel::BrowserAdapter::new(&cfg.browser).with_loss_notifier(loss_tx),
    );
    let mut router = arena::channel::AdapterRouter::new();
    for agent in browser.agents() {
        router = router.route(agent, browser.clone());
    }
    tracing::debug!(agents = ?router.agents(), "browser providers");
    Ok(Arc::new(router))
}

#[cfg(not(feature = "browser"))]
fn browser_adapter(
    _cfg: &AppConfig,
    _loss_tx: tokio::sync::mpsc::UnboundedSender<ChannelLost>,
) -> Result<Arc<dyn ChannelAdapter>> {
    anyhow::bail!("built without the \"browser\" feature; rebuild with --features browser or pass --dry-run")
}

/// 把状态事件写入日志，直到 token 取消
fn spawn_event_logger(orchestrator: &Arc<TurnOrchestrator>, token: CancellationToken) {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => tracing::info!(
                        status = %event.status,
                        turn = event.current_turn,
                        total = event.total_turns,
                        agent = event.agent_id.as_deref().unwrap_or("-"),
                        error = event.error.as_deref().unwrap_or(""),
                        "status update"
                    ),
                    Err(RecvError::Lagged(n)) => tracing::warn!("status listener lagged by {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

fn spawn_interrupt_handler(orchestrator: &Arc<TurnOrchestrator>, token: CancellationToken) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    tracing::info!("Received Ctrl+C, stopping flow...");
                    orchestrator.stop().await;
                }
            }
        }
    });
}

fn cmd_flows(cfg: &AppConfig) -> Result<()> {
    let mut catalog = FlowCatalog::builtin();
    if let Some(dir) = &cfg.flows.dir {
        catalog.load_dir(dir).context("Failed to load flows")?;
    }
    for flow in catalog.iter() {
        println!(
            "{:<12} {} ({} rounds; {})",
            flow.id,
            flow.name,
            flow.max_rounds,
            flow.agent_ids().join(", ")
        );
        if !flow.description.is_empty() {
            println!("{:<12} {}", "", flow.description);
        }
    }
    Ok(())
}

async fn cmd_history(cfg: &AppConfig, clear: bool) -> Result<()> {
    let store = JsonHistoryStore::new(&cfg.history.path, cfg.history.limit);
    if clear {
        store.clear().await?;
        println!("History cleared ({})", store.path().display());
        return Ok(());
    }

    let entries = store.load().await?;
    if entries.is_empty() {
        println!("No saved runs");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:<12} {:>3} turns  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.flow_id,
            entry.turn_count,
            entry.topic
        );
    }
    Ok(())
}
