//! RedTalon CLI — run one engagement from the command line.
//!
//! ```text
//! redtalon --config engagement.toml "assess host 10.10.10.5"
//! ```
//!
//! Loads the engagement configuration, wires the stores, Guardian, tool
//! bridge, and LLM router together, runs the Team Lead to completion, and
//! prints the engagement report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use redtalon_agent::{LlmRouter, ProviderConfig, RuntimeConfig, TerminalServer, ToolBridge};
use redtalon_core::{EngagementConfig, Guardian, GuardianConfig};
use redtalon_store::{Database, FindingStore, LockManager, Mailbox, TaskQueue};
use redtalon_team::{TeamLead, TeamLeadConfig};

#[derive(Debug, Parser)]
#[command(name = "redtalon", about = "Autonomous penetration-testing orchestrator")]
struct Cli {
    /// Path to the engagement configuration file.
    #[arg(short, long, default_value = "engagement.toml")]
    config: PathBuf,

    /// Natural-language objective, e.g. "assess host 10.10.10.5".
    objective: String,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = EngagementConfig::from_file(&cli.config)
        .with_context(|| format!("loading engagement config from {}", cli.config.display()))?;
    tracing::info!(engagement = %config.engagement.name, "configuration loaded");

    // Durable stores live under the engagement output directory.
    let output_dir = PathBuf::from(&config.engagement.output_dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;
    let db = Database::open_and_migrate(output_dir.join("engagement.db"))
        .await
        .context("opening engagement database")?;

    let queue = TaskQueue::new(db.clone());
    let mailbox = Mailbox::new(db.clone());
    let locks = LockManager::new(db.clone());
    let findings = FindingStore::new(db);

    // Safety policy from the engagement scope.
    let guardian = Guardian::new(GuardianConfig {
        scope_include: config.scope.include.clone(),
        scope_exclude: config.scope.exclude.clone(),
        rate_limit: config.safety.rate_limit,
        blocked_commands: config.safety.blocked_commands.clone(),
    })
    .context("building guardian")?;

    let mut bridge = ToolBridge::new()
        .with_guardian(Arc::new(guardian))
        .with_tool_timeout(Duration::from_secs(config.agent.tool_timeout_secs));
    bridge.register_server(Arc::new(TerminalServer::new()));

    // Provider failover chain.
    let providers: Vec<ProviderConfig> = config
        .providers_by_priority()
        .into_iter()
        .map(|entry| ProviderConfig {
            api_key: entry.resolve_api_key(),
            name: entry.name,
            endpoint: entry.endpoint,
            model: entry.model,
            priority: entry.priority,
            rpm_limit: entry.rpm_limit,
            max_tokens: entry.max_tokens,
            temperature: entry.temperature,
            timeout_secs: entry.timeout_secs,
            retry_count: entry.retry_count,
        })
        .collect();
    let router = Arc::new(LlmRouter::new(providers).context("building LLM router")?);

    let team_config = TeamLeadConfig {
        runtime: RuntimeConfig {
            max_iterations: config.agent.max_iterations,
            task_timeout: Duration::from_secs(config.agent.task_timeout_secs),
            output_max_chars: config.agent.output_max_chars,
            verbose: true,
        },
        ..TeamLeadConfig::default()
    };

    let lead = TeamLead::new(
        team_config,
        router,
        Arc::new(bridge),
        queue,
        mailbox,
        locks,
        findings,
    );

    let report = lead.orchestrate(&cli.objective).await?;

    println!("\n=== Engagement Report: {} ===", config.engagement.name);
    println!("Objective: {}", report.objective);
    println!("Elapsed:   {:.1}s", report.elapsed_secs);
    println!("Findings:  {}", report.findings_count);
    print!("Tasks:     ");
    let mut counts: Vec<_> = report.status_counts.iter().collect();
    counts.sort();
    println!(
        "{}",
        counts
            .iter()
            .map(|(status, n)| format!("{status}={n}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !report.unsatisfied.is_empty() {
        println!("Blocked:   {}", report.unsatisfied.join(", "));
    }
    println!("\n{}", report.executive_summary);

    Ok(())
}
