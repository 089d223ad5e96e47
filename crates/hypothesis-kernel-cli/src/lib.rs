//! `hk` command surface for operating hypothesis runs from a shell or a host process.
//!
//! Hosts embed the CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for a parsed [`Command`] against a DB path.
//! - [`run_command`] for a parsed [`Command`] against an existing [`Orchestrator`].
//!
//! Every command prints one pretty JSON document on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hypothesis_kernel_core::{
    route, EvidenceState, HumanDecision, ItemId, Phase, RoutingTable, RunId, RunStatus,
};
use hypothesis_kernel_orchestrator::{
    default_owner, load_config, DecisionRequest, LogTerminalEffect, NoopChangeNotifier,
    NoopWorkerDispatcher, Orchestrator, SystemClock,
};
use hypothesis_kernel_store_sqlite::{CommitRequest, CommitStatus, NewRun};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(name = "hk")]
#[command(about = "Hypothesis Kernel run orchestration CLI")]
pub struct Cli {
    #[arg(long, default_value = "./hypothesis_kernel.sqlite3")]
    db: PathBuf,

    /// Kernel config JSON (TTLs, lease, retry limits). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Checkpoint {
        #[command(subcommand)]
        command: Box<CheckpointCommand>,
    },
    Queue {
        #[command(subcommand)]
        command: Box<QueueCommand>,
    },
    Routing {
        #[command(subcommand)]
        command: Box<RoutingCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    Create(RunCreateArgs),
    Commit(RunCommitArgs),
    Status(RunIdArgs),
    Abandon(RunAbandonArgs),
    History(RunIdArgs),
    Verify(RunIdArgs),
    Show(RunIdArgs),
    List(RunListArgs),
}

#[derive(Debug, Args)]
pub struct RunCreateArgs {
    #[arg(long)]
    pub run_id: Option<String>,
    #[arg(long)]
    pub routing_version: Option<u32>,
}

#[derive(Debug, Args)]
pub struct RunCommitArgs {
    #[arg(long)]
    pub run_id: String,
    #[arg(long)]
    pub change_id: String,
    #[arg(long, default_value = "{}", conflicts_with = "patch_file")]
    pub patch_json: String,
    #[arg(long)]
    pub patch_file: Option<PathBuf>,
    /// Repeat for several entries. Each value must be a JSON document.
    #[arg(long = "history-json")]
    pub history: Vec<String>,
    #[arg(long)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Args)]
pub struct RunIdArgs {
    #[arg(long)]
    pub run_id: String,
}

#[derive(Debug, Args)]
pub struct RunAbandonArgs {
    #[arg(long)]
    pub run_id: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Debug, Args)]
pub struct RunListArgs {
    #[arg(long)]
    pub status: Option<RunStatusArg>,
}

#[derive(Debug, Subcommand)]
pub enum CheckpointCommand {
    Decide(CheckpointDecideArgs),
    List(CheckpointListArgs),
    Sweep(CheckpointSweepArgs),
}

#[derive(Debug, Args)]
pub struct CheckpointDecideArgs {
    #[arg(long)]
    pub run_id: String,
    #[arg(long)]
    pub name: String,
    #[arg(long)]
    pub decision: DecisionArg,
    #[arg(long)]
    pub decided_by: String,
    #[arg(long)]
    pub note: Option<String>,
}

#[derive(Debug, Args)]
pub struct CheckpointListArgs {
    /// Limit to one run. Without it, every pending checkpoint is listed.
    #[arg(long)]
    pub run_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct CheckpointSweepArgs {
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    Drain(QueueDrainArgs),
    Reclaim,
    DeadLetters,
    Requeue(QueueRequeueArgs),
    Counts,
}

#[derive(Debug, Args)]
pub struct QueueDrainArgs {
    #[arg(long)]
    pub owner: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub max_items: usize,
}

#[derive(Debug, Args)]
pub struct QueueRequeueArgs {
    #[arg(long)]
    pub item_id: String,
}

#[derive(Debug, Subcommand)]
pub enum RoutingCommand {
    Show(RoutingShowArgs),
    Preview(RoutingPreviewArgs),
    Install(RoutingInstallArgs),
}

#[derive(Debug, Args)]
pub struct RoutingShowArgs {
    #[arg(long)]
    pub routing_version: Option<u32>,
}

#[derive(Debug, Args)]
pub struct RoutingPreviewArgs {
    #[arg(long)]
    pub phase: PhaseArg,
    #[arg(long, default_value = "{}")]
    pub state_json: String,
    #[arg(long, default_value_t = 1)]
    pub routing_version: u32,
}

#[derive(Debug, Args)]
pub struct RoutingInstallArgs {
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhaseArg {
    Discovery,
    Desirability,
    Feasibility,
    Viability,
    Decision,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RunStatusArg {
    Active,
    AwaitingHuman,
    Completed,
    Failed,
}

#[derive(Debug, Serialize)]
struct RoutingPreview {
    contract_version: &'static str,
    routing_version: u32,
    phase: Phase,
    #[serde(flatten)]
    outcome: hypothesis_kernel_core::RouteOutcome,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when config loading, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_command_with_db(&cli.db, cli.config.as_deref(), cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when the config is invalid, store open/migrate fails or the
/// requested command fails.
pub fn run_command_with_db(db_path: &Path, config: Option<&Path>, command: Command) -> Result<()> {
    let config = load_config(config)?;
    let clock = SystemClock;
    let orchestrator = Orchestrator::new(
        db_path,
        config,
        &clock,
        &NoopChangeNotifier,
        &NoopWorkerDispatcher,
    );
    orchestrator.migrate()?;
    run_command(command, &orchestrator)
}

/// Executes a parsed command against an existing orchestrator.
///
/// # Errors
/// Returns an error when argument parsing, persistence, or the protocol rejects the
/// command (unknown run, version conflict, invalid delta).
pub fn run_command(command: Command, orchestrator: &Orchestrator<'_>) -> Result<()> {
    match command {
        Command::Run { command } => run_run(*command, orchestrator),
        Command::Checkpoint { command } => run_checkpoint(*command, orchestrator),
        Command::Queue { command } => run_queue(*command, orchestrator),
        Command::Routing { command } => run_routing(*command, orchestrator),
    }
}

fn run_run(command: RunCommand, orchestrator: &Orchestrator<'_>) -> Result<()> {
    match command {
        RunCommand::Create(args) => {
            let request = NewRun {
                run_id: args.run_id.as_deref().map(parse_run_id).transpose()?,
                routing_version: args.routing_version,
            };
            let run = orchestrator.create_run(&request)?;
            print_json(&run)
        }
        RunCommand::Commit(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let patch = match &args.patch_file {
                Some(path) => {
                    let body = std::fs::read_to_string(path)
                        .with_context(|| format!("failed to read patch file {}", path.display()))?;
                    parse_json_arg("patch_file", &body)?
                }
                None => parse_json_arg("patch_json", &args.patch_json)?,
            };
            let history_entries = args
                .history
                .iter()
                .map(|raw| parse_json_arg("history_json", raw))
                .collect::<Result<Vec<_>>>()?;
            let outcome = orchestrator.commit(&CommitRequest {
                run_id,
                change_id: args.change_id,
                patch: Some(patch),
                history_entries,
                expected_version: args.expected_version,
            })?;
            print_json(&outcome)?;
            match outcome.status {
                CommitStatus::Committed | CommitStatus::Duplicate => Ok(()),
                CommitStatus::NotFound => Err(anyhow!("run not found: {run_id}")),
                CommitStatus::VersionConflict => Err(anyhow!(
                    "version conflict on run {run_id}: expected {:?}, current {:?}",
                    args.expected_version,
                    outcome.version
                )),
            }
        }
        RunCommand::Status(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let Some(status) = orchestrator.get_status(run_id)? else {
                return Err(anyhow!("run not found: {run_id}"));
            };
            print_json(&status)
        }
        RunCommand::Abandon(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let outcome = orchestrator.abandon(run_id, &args.reason)?;
            print_json(&outcome)?;
            if outcome.status == CommitStatus::NotFound {
                return Err(anyhow!("run not found: {run_id}"));
            }
            Ok(())
        }
        RunCommand::History(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let history = orchestrator.open_store()?.list_history(run_id)?;
            print_json(&history)
        }
        RunCommand::Verify(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let Some(check) = orchestrator.verify_run(run_id)? else {
                return Err(anyhow!("run not found: {run_id}"));
            };
            print_json(&check)?;
            if !check.consistent {
                return Err(anyhow!(
                    "fold check failed for run {run_id}: {}",
                    check.issues.join("; ")
                ));
            }
            Ok(())
        }
        RunCommand::Show(args) => {
            let run_id = parse_run_id(&args.run_id)?;
            let store = orchestrator.open_store()?;
            let Some(run) = store.get_run(run_id)? else {
                return Err(anyhow!("run not found: {run_id}"));
            };
            let checkpoints = store.list_checkpoints(run_id)?;
            let queue = store.queue_items_for_run(run_id)?;
            print_json(&json!({
                "run": run,
                "checkpoints": checkpoints,
                "completion_queue": queue,
            }))
        }
        RunCommand::List(args) => {
            let runs = orchestrator
                .open_store()?
                .list_runs(args.status.map(map_run_status))?;
            print_json(&runs)
        }
    }
}

fn run_checkpoint(command: CheckpointCommand, orchestrator: &Orchestrator<'_>) -> Result<()> {
    match command {
        CheckpointCommand::Decide(args) => {
            let outcome = orchestrator.decide_checkpoint(&DecisionRequest {
                run_id: parse_run_id(&args.run_id)?,
                checkpoint_name: args.name,
                decision: match args.decision {
                    DecisionArg::Approve => HumanDecision::Approve,
                    DecisionArg::Reject => HumanDecision::Reject,
                },
                decided_by: args.decided_by,
                note: args.note,
            })?;
            print_json(&outcome)
        }
        CheckpointCommand::List(args) => {
            let store = orchestrator.open_store()?;
            let checkpoints = match args.run_id {
                Some(raw) => store.list_checkpoints(parse_run_id(&raw)?)?,
                None => store.list_pending_checkpoints()?,
            };
            print_json(&checkpoints)
        }
        CheckpointCommand::Sweep(args) => {
            let report = orchestrator.sweep_expired_checkpoints(args.limit)?;
            print_json(&report)
        }
    }
}

fn run_queue(command: QueueCommand, orchestrator: &Orchestrator<'_>) -> Result<()> {
    match command {
        QueueCommand::Drain(args) => {
            let owner = args.owner.unwrap_or_else(|| default_owner("hk"));
            let reports = if args.max_items <= 1 {
                vec![orchestrator.drain_once(&owner, &LogTerminalEffect)?]
            } else {
                orchestrator.drain_all(&owner, &LogTerminalEffect, args.max_items)?
            };
            print_json(&reports)
        }
        QueueCommand::Reclaim => {
            let mut store = orchestrator.open_store()?;
            let report = store.reclaim_expired(hypothesis_kernel_core::now_utc())?;
            print_json(&report)
        }
        QueueCommand::DeadLetters => {
            let items = orchestrator.open_store()?.list_dead_letters()?;
            print_json(&items)
        }
        QueueCommand::Requeue(args) => {
            let item_id = ItemId::parse(&args.item_id)
                .map_err(|err| anyhow!("invalid --item-id value: {err}"))?;
            let mut store = orchestrator.open_store()?;
            if !store.requeue_dead_letter(item_id, hypothesis_kernel_core::now_utc())? {
                return Err(anyhow!("no dead-lettered item {item_id}"));
            }
            print_json(&json!({"item_id": item_id, "requeued": true}))
        }
        QueueCommand::Counts => {
            let counts = orchestrator.open_store()?.queue_counts()?;
            print_json(&counts)
        }
    }
}

fn run_routing(command: RoutingCommand, orchestrator: &Orchestrator<'_>) -> Result<()> {
    let store = orchestrator.open_store()?;
    match command {
        RoutingCommand::Show(args) => match args.routing_version {
            Some(version) => {
                let Some(table) = store.get_routing_table(version)? else {
                    return Err(anyhow!("routing table v{version} is not installed"));
                };
                print_json(&table)
            }
            None => {
                let tables = store.get_routing_tables()?;
                print_json(&tables.into_values().collect::<Vec<_>>())
            }
        },
        RoutingCommand::Preview(args) => {
            let Some(table) = store.get_routing_table(args.routing_version)? else {
                return Err(anyhow!(
                    "routing table v{} is not installed",
                    args.routing_version
                ));
            };
            let document = parse_json_arg("state_json", &args.state_json)?;
            let state = EvidenceState::from_document(&document)
                .map_err(|err| anyhow!("invalid --state-json: {err}"))?;
            let phase = map_phase(args.phase);
            let outcome = route(phase, &state, &table).map_err(|err| anyhow!(err.to_string()))?;
            print_json(&RoutingPreview {
                contract_version: "routing_preview.v1",
                routing_version: table.routing_version,
                phase,
                outcome,
            })
        }
        RoutingCommand::Install(args) => {
            let body = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed to read routing table {}", args.file.display()))?;
            let value = parse_json_arg("file", &body)?;
            let table =
                RoutingTable::from_json(&value).map_err(|err| anyhow!(err.to_string()))?;
            store.upsert_routing_table(&table)?;
            print_json(&json!({
                "routing_version": table.routing_version,
                "installed": true,
            }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{name} must be valid JSON: {raw}"))
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw).map_err(|err| anyhow!("invalid run id {raw}: {err}"))
}

fn map_phase(value: PhaseArg) -> Phase {
    match value {
        PhaseArg::Discovery => Phase::Discovery,
        PhaseArg::Desirability => Phase::Desirability,
        PhaseArg::Feasibility => Phase::Feasibility,
        PhaseArg::Viability => Phase::Viability,
        PhaseArg::Decision => Phase::Decision,
    }
}

fn map_run_status(value: RunStatusArg) -> RunStatus {
    match value {
        RunStatusArg::Active => RunStatus::Active,
        RunStatusArg::AwaitingHuman => RunStatus::AwaitingHuman,
        RunStatusArg::Completed => RunStatus::Completed,
        RunStatusArg::Failed => RunStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use hypothesis_kernel_core::CheckpointStatus;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "hk-cli-{label}-{}.sqlite3",
            hypothesis_kernel_core::RunId::new()
        ))
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn hk<'a>(db: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["hk", "--db", db];
        args.extend_from_slice(rest);
        args
    }

    #[test]
    fn parse_json_arg_rejects_invalid_json() {
        assert!(parse_json_arg("patch_json", "{").is_err());
        let value = must(parse_json_arg("patch_json", r#"{"discovery":{}}"#));
        assert!(value["discovery"].is_object());
    }

    #[test]
    fn parse_run_id_rejects_garbage() {
        assert!(parse_run_id("not-a-ulid").is_err());
    }

    #[test]
    fn cli_end_to_end_create_commit_decide_and_drain() {
        let db_path = temp_db("e2e");
        let db = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        let run_id = "01J0SQQP7M70P6Y3R4T8D8G8M2";

        must(execute_cli(&hk(&db, &["run", "create", "--run-id", run_id])));
        must(execute_cli(&hk(
            &db,
            &[
                "run",
                "commit",
                "--run-id",
                run_id,
                "--change-id",
                "interviews",
                "--patch-json",
                r#"{"discovery":{"interviews_completed":6,"problem_confirmed_ratio":0.5}}"#,
                "--history-json",
                r#"{"event":"interviews_imported"}"#,
                "--expected-version",
                "0",
            ],
        )));

        let stale = execute_cli(&hk(
            &db,
            &[
                "run",
                "commit",
                "--run-id",
                run_id,
                "--change-id",
                "stale",
                "--expected-version",
                "0",
            ],
        ));
        assert!(stale.is_err());

        must(execute_cli(&hk(
            &db,
            &[
                "checkpoint",
                "decide",
                "--run-id",
                run_id,
                "--name",
                "discovery_review",
                "--decision",
                "approve",
                "--decided-by",
                "founder",
            ],
        )));
        must(execute_cli(&hk(&db, &["run", "verify", "--run-id", run_id])));
        must(execute_cli(&hk(&db, &["checkpoint", "list", "--run-id", run_id])));
        must(execute_cli(&hk(&db, &["queue", "drain", "--owner", "cli-test"])));

        let parsed_run_id = must(parse_run_id(run_id));
        let store = must(hypothesis_kernel_store_sqlite::SqliteRunStore::open(&db_path));
        let run = match must(store.get_run(parsed_run_id)) {
            Some(value) => value,
            None => panic!("run should exist"),
        };
        assert_eq!(run.version, 2);
        assert_eq!(run.current_phase, Phase::Desirability);
        let checkpoint = match must(store.latest_checkpoint(parsed_run_id, "discovery_review")) {
            Some(value) => value,
            None => panic!("checkpoint should exist"),
        };
        assert_eq!(checkpoint.status, CheckpointStatus::Decided);
        assert!(must(store.queue_items_for_run(parsed_run_id)).is_empty());

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn abandon_then_drain_leaves_queue_untouched() {
        let db_path = temp_db("abandon");
        let db = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        let run_id = "01J0SQQP7M70P6Y3R4T8D8G8M3";

        must(execute_cli(&hk(&db, &["run", "create", "--run-id", run_id])));
        must(execute_cli(&hk(
            &db,
            &["run", "abandon", "--run-id", run_id, "--reason", "pivoted company"],
        )));
        must(execute_cli(&hk(&db, &["queue", "drain", "--max-items", "5"])));
        must(execute_cli(&hk(&db, &["run", "list", "--status", "failed"])));

        let store = must(hypothesis_kernel_store_sqlite::SqliteRunStore::open(&db_path));
        let counts = must(store.queue_counts());
        assert_eq!(counts.pending + counts.processing + counts.completed, 0);
        let failed = must(store.list_runs(Some(RunStatus::Failed)));
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some("pivoted company"));

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn routing_install_rejects_invalid_tables_and_preview_routes() {
        let db_path = temp_db("routing");
        let db = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        let table_path = std::env::temp_dir().join(format!(
            "hk-routing-{}.json",
            hypothesis_kernel_core::RunId::new()
        ));
        must(fs::write(&table_path, r#"{"routing_version": 2}"#).map_err(Into::into));
        let table_arg = match table_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp path must be valid UTF-8"),
        };

        assert!(execute_cli(&hk(&db, &["routing", "install", "--file", &table_arg])).is_err());
        assert!(execute_cli(&hk(&db, &["routing", "show", "--routing-version", "2"])).is_err());
        must(execute_cli(&hk(&db, &["routing", "show", "--routing-version", "1"])));
        must(execute_cli(&hk(
            &db,
            &[
                "routing",
                "preview",
                "--phase",
                "desirability",
                "--state-json",
                r#"{"desirability":{"problem_resonance":0.2}}"#,
            ],
        )));

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&table_path);
    }
}
