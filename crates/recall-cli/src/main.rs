//! Recall CLI
//!
//! The `recall` command is a thin front end over `recall-core`: it writes and
//! queries agent memories, inspects and updates coordination state, and
//! migrates legacy state files.
//!
//! ## Commands
//!
//! - `write` / `read` / `query` / `search` / `related` / `delete`: memories
//! - `sync` / `consolidate` / `status`: store maintenance
//! - `agent` / `event` / `system`: coordination state
//! - `migrate`: import legacy flat files
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use recall_core::coordination::CoordinationStateManager;
use recall_core::memory::TieredMemoryStore;
use recall_core::migrate::parse_timestamp;
use recall_core::{connect_remote, telemetry, RecallConfig};
use recall_state::{
    AgentState, AgentStatus, CoordinationEvent, EventFilter, EventType, MemoryType, RemoteStore,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Parser)]
#[command(name = "recall")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Memory and cross-session state for autonomous agents", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "RECALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify and store a memory
    Write {
        content: String,

        /// Tag to attach (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Keep the write local until the next sync
        #[arg(long)]
        no_sync: bool,
    },

    /// Fetch a memory by id
    Read { id: String },

    /// Query cached memories by tags and type
    Query {
        /// Required tag (repeatable, all must match)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Memory type (GOAL, TASK, ...)
        #[arg(long = "type")]
        memory_type: Option<MemoryType>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Search the backing store by keywords
    Search {
        #[arg(required = true)]
        keywords: Vec<String>,

        #[arg(long = "type")]
        memory_type: Option<MemoryType>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show memories linked to a memory
    Related { id: String },

    /// Delete a memory
    Delete { id: String },

    /// Push pending writes and deletes to the backing store
    Sync,

    /// Remove old low-importance memories
    Consolidate {
        /// Override the configured age cutoff
        #[arg(long)]
        older_than_days: Option<u64>,

        /// Override the configured importance threshold
        #[arg(long)]
        min_importance: Option<f64>,
    },

    /// Show connectivity and cache statistics
    Status,

    /// Agent operational records
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Coordination event log
    Event {
        #[command(subcommand)]
        action: EventAction,
    },

    /// System-wide state
    System {
        #[command(subcommand)]
        action: SystemAction,
    },

    /// Import legacy agent registries, state snapshots and event logs
    Migrate {
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Validate and report without writing
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// Create or update an agent record
    Save {
        #[arg(long)]
        id: String,
        #[arg(long = "type")]
        agent_type: String,
        #[arg(long)]
        session: String,
        #[arg(long, default_value = "ACTIVE")]
        status: AgentStatus,
        /// Context entry as key=value; values parse as JSON when possible
        #[arg(long = "context")]
        context: Vec<String>,
    },
    /// Show the latest record of an agent in a session
    Get {
        #[arg(long)]
        id: String,
        #[arg(long)]
        session: String,
    },
    /// Move an agent to a new status
    Transition {
        #[arg(long)]
        id: String,
        #[arg(long)]
        session: String,
        status: AgentStatus,
    },
    /// Append a task result summary
    TaskResult {
        #[arg(long)]
        id: String,
        #[arg(long)]
        session: String,
        summary: String,
    },
    /// Add to a performance metric
    Metric {
        #[arg(long)]
        id: String,
        #[arg(long)]
        session: String,
        name: String,
        #[arg(default_value = "1", allow_negative_numbers = true)]
        delta: f64,
    },
    /// List agent records
    List {
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Record a coordination event
    Record {
        #[arg(long = "type")]
        event_type: EventType,
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "unknown")]
        source_type: String,
        #[arg(long)]
        target: Option<String>,
        /// Context entry as key=value; values parse as JSON when possible
        #[arg(long = "context")]
        context: Vec<String>,
        /// Record the event as unsuccessful
        #[arg(long)]
        failed: bool,
    },
    /// List events, newest first
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Per-type counts and success rate
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Source agent id
    #[arg(long)]
    agent: Option<String>,
    #[arg(long = "type")]
    event_type: Option<EventType>,
    /// Only events at or after this time (RFC 3339 or epoch seconds)
    #[arg(long)]
    since: Option<String>,
    #[arg(short, long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum SystemAction {
    /// Show the system state
    Show,
    /// Set the emergency stop
    Stop,
    /// Clear the emergency stop
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json, telemetry::level_for_verbosity(cli.verbose));

    let config = RecallConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Write {
            content,
            tags,
            no_sync,
        } => cmd_write(&config, &content, tags, no_sync).await,
        Commands::Read { id } => {
            let store = open_memory(&config).await;
            let record = store.read(&id).await?;
            print_json(&record)
        }
        Commands::Query {
            tags,
            memory_type,
            limit,
        } => {
            let store = open_memory(&config).await;
            print_json(&store.query(&tags, memory_type, limit))
        }
        Commands::Search {
            keywords,
            memory_type,
            limit,
        } => {
            let store = open_memory(&config).await;
            print_json(&store.search_remote(&keywords, memory_type, limit).await?)
        }
        Commands::Related { id } => {
            let store = open_memory(&config).await;
            print_json(&store.related(&id).await?)
        }
        Commands::Delete { id } => {
            let store = open_memory(&config).await;
            store.delete(&id).await?;
            let report = store.sync().await;
            print_json(&json!({ "deleted": id, "sync": report }))
        }
        Commands::Sync => {
            let store = open_memory(&config).await;
            print_json(&store.sync().await)
        }
        Commands::Consolidate {
            older_than_days,
            min_importance,
        } => cmd_consolidate(config, older_than_days, min_importance).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Agent { action } => {
            let manager = open_coordination(&config).await;
            cmd_agent(&manager, action).await
        }
        Commands::Event { action } => {
            let manager = open_coordination(&config).await;
            cmd_event(&manager, action).await
        }
        Commands::System { action } => {
            let manager = open_coordination(&config).await;
            match action {
                SystemAction::Show => print_json(&manager.get_system_state().await),
                SystemAction::Stop => print_json(&manager.set_emergency_stop(true).await),
                SystemAction::Resume => print_json(&manager.set_emergency_stop(false).await),
            }
        }
        Commands::Migrate { sources, dry_run } => {
            let manager = open_coordination(&config).await;
            let report = recall_core::migrate(&manager, &sources, dry_run).await;
            print_json(&report)?;
            if !report.is_clean() {
                bail!(
                    "{} of {} records failed to migrate",
                    report.records_failed,
                    report.records_failed + report.records_migrated
                );
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

async fn open_memory(config: &RecallConfig) -> TieredMemoryStore {
    memory_over(connect_remote(&config.remote).await, config).await
}

async fn open_coordination(config: &RecallConfig) -> CoordinationStateManager {
    coordination_over(connect_remote(&config.remote).await, config).await
}

async fn memory_over(remote: Arc<dyn RemoteStore>, config: &RecallConfig) -> TieredMemoryStore {
    TieredMemoryStore::open(remote, config.memory_store_config()).await
}

async fn coordination_over(
    remote: Arc<dyn RemoteStore>,
    config: &RecallConfig,
) -> CoordinationStateManager {
    CoordinationStateManager::open(remote, config.coordination_config()).await
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Split `key=value`; the value is JSON when it parses, a string otherwise.
fn parse_context(entries: &[String]) -> Result<Vec<(String, Value)>> {
    entries
        .iter()
        .map(|entry| {
            let (key, raw) = entry
                .split_once('=')
                .with_context(|| format!("context entry {entry:?} is not key=value"))?;
            let key = key.trim();
            if key.is_empty() {
                bail!("context entry {entry:?} has an empty key");
            }
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Memory commands
// ---------------------------------------------------------------------------

async fn cmd_write(config: &RecallConfig, content: &str, tags: Vec<String>, no_sync: bool) -> Result<()> {
    let store = open_memory(config).await;
    let tags: BTreeSet<String> = tags.into_iter().collect();

    if no_sync {
        let record = store.write(content, tags)?;
        return print_json(&record);
    }

    let (record, report) = store.write_and_sync(content, tags).await?;
    if report.failed_count > 0 {
        eprintln!(
            "warning: {} record(s) not persisted ({})",
            report.failed_count,
            report
                .failures
                .first()
                .map(|f| f.reason.as_str())
                .unwrap_or("unknown reason")
        );
    }
    print_json(&json!({ "record": record, "sync": report }))
}

async fn cmd_consolidate(
    mut config: RecallConfig,
    older_than_days: Option<u64>,
    min_importance: Option<f64>,
) -> Result<()> {
    if let Some(days) = older_than_days {
        config.consolidation.older_than_days = days;
    }
    if let Some(threshold) = min_importance {
        config.consolidation.min_importance = threshold;
    }
    config.validate()?;

    let store = open_memory(&config).await;
    let report = store.consolidate(&config.consolidation_policy()).await?;
    let sync = store.sync().await;
    print_json(&json!({ "consolidation": report, "sync": sync }))
}

async fn cmd_status(config: &RecallConfig) -> Result<()> {
    let remote = connect_remote(&config.remote).await;
    let store = memory_over(remote.clone(), config).await;
    let manager = coordination_over(remote.clone(), config).await;
    print_json(&json!({
        "version": env!("CARGO_PKG_VERSION"),
        "connected": remote.is_connected(),
        "memory": store.stats(),
        "coordination": {
            "status": manager.check_remote().await,
            "mirror": manager.mirror_stats(),
        },
    }))
}

// ---------------------------------------------------------------------------
// Coordination commands
// ---------------------------------------------------------------------------

async fn cmd_agent(manager: &CoordinationStateManager, action: AgentAction) -> Result<()> {
    match action {
        AgentAction::Save {
            id,
            agent_type,
            session,
            status,
            context,
        } => {
            let mut state = AgentState::new(id, agent_type, session).with_status(status);
            for (key, value) in parse_context(&context)? {
                state = state.with_context(key, value);
            }
            print_json(&manager.save_agent_state(state).await?)
        }
        AgentAction::Get { id, session } => {
            print_json(&manager.get_agent_state(&id, &session).await?)
        }
        AgentAction::Transition {
            id,
            session,
            status,
        } => print_json(&manager.transition_agent(&id, &session, status).await?),
        AgentAction::TaskResult {
            id,
            session,
            summary,
        } => print_json(&manager.append_task_result(&id, &session, summary).await?),
        AgentAction::Metric {
            id,
            session,
            name,
            delta,
        } => print_json(&manager.increment_metric(&id, &session, &name, delta).await?),
        AgentAction::List { id } => print_json(&manager.list_agent_states(id.as_deref()).await?),
    }
}

async fn cmd_event(manager: &CoordinationStateManager, action: EventAction) -> Result<()> {
    match action {
        EventAction::Record {
            event_type,
            source,
            source_type,
            target,
            context,
            failed,
        } => {
            let mut event =
                CoordinationEvent::new(event_type, source, source_type).with_success(!failed);
            if let Some(target) = target {
                event = event.with_target(target);
            }
            for (key, value) in parse_context(&context)? {
                event = event.with_context(key, value);
            }
            let outcome = manager.record_coordination_event(event).await?;
            if outcome.is_rejected() {
                eprintln!("warning: SPAWN refused, emergency stop is set");
            }
            print_json(&outcome)
        }
        EventAction::List { filter } => print_json(&manager.list_events(&filter.build()?).await?),
        EventAction::Summary { filter } => {
            print_json(&manager.coordination_summary(&filter.build()?).await?)
        }
    }
}

impl FilterArgs {
    fn build(self) -> Result<EventFilter> {
        let mut filter = EventFilter::all();
        if let Some(agent) = self.agent {
            filter = filter.for_agent(agent);
        }
        if let Some(event_type) = self.event_type {
            filter = filter.of_type(event_type);
        }
        if let Some(since) = self.since {
            let raw = since
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(since.clone()));
            let at = parse_timestamp(&raw)
                .map_err(|reason| anyhow::anyhow!("invalid --since {since:?}: {reason}"))?;
            filter = filter.since(at);
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_typed_arguments() {
        let cli = Cli::parse_from(["recall", "-vv", "query", "--type", "goal", "--tag", "perf"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Query {
                tags, memory_type, ..
            } => {
                assert_eq!(tags, vec!["perf"]);
                assert_eq!(memory_type, Some(MemoryType::Goal));
            }
            _ => panic!("expected query"),
        }

        let cli = Cli::parse_from([
            "recall", "agent", "transition", "--id", "a1", "--session", "s1", "working",
        ]);
        assert!(matches!(
            cli.command,
            Commands::Agent {
                action: AgentAction::Transition {
                    status: AgentStatus::Working,
                    ..
                }
            }
        ));
    }

    #[test]
    fn context_values_prefer_json() {
        let parsed = parse_context(&[
            "attempts=3".to_string(),
            "note=hello world".to_string(),
            "flags={\"fast\":true}".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed[0], ("attempts".to_string(), json!(3)));
        assert_eq!(parsed[1], ("note".to_string(), json!("hello world")));
        assert_eq!(parsed[2].1["fast"], json!(true));

        assert!(parse_context(&["novalue".to_string()]).is_err());
        assert!(parse_context(&["=1".to_string()]).is_err());
    }

    #[test]
    fn filter_accepts_epoch_and_rfc3339() {
        let filter = FilterArgs {
            agent: Some("a1".into()),
            event_type: Some(EventType::Spawn),
            since: Some("1717200000".into()),
            limit: Some(5),
        }
        .build()
        .unwrap();
        assert_eq!(filter.limit, Some(5));
        assert!(filter.since.is_some());

        let bad = FilterArgs {
            agent: None,
            event_type: None,
            since: Some("last tuesday".into()),
            limit: None,
        };
        assert!(bad.build().is_err());
    }
}
