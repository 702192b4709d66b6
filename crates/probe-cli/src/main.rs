mod config;
mod logging;

use clap::{ArgAction, Parser, Subcommand};
use config::{ProbeConfig, SessionScript};
use futures::StreamExt;
use probe_agent::{
    ActionExecutor, BrowsingWorker, CodingWorker, SupervisorWorker, WorkspaceExecutor,
};
use probe_eventlog::{
    Event, EventKind, EventLog, FsEventBackend, MemoryEventBackend, SessionState,
    SharedEventBackend,
};
use probe_graph::{
    CheckpointEnvelope, EventStream, FsCheckpointer, GraphBuilder, MemoryCheckpointer,
    SessionManager, SharedCheckpointer, StepResult, StepStatus,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const EVENTS_DIR: &str = "events";
const THREADS_DIR: &str = "threads";

#[derive(Parser, Debug)]
#[command(name = "probe-cli")]
#[command(about = "In-process host for probe sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    InspectCheckpoint(InspectCheckpointArgs),
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON file with scripted decisions/observations and messages.
    #[arg(long)]
    script: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Persist events and checkpoints here; in-memory when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Resume this session instead of creating one. Requires --data-dir.
    #[arg(long)]
    session: Option<String>,
    /// Root for files the coder writes; scripted observations when omitted.
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Overrides the script's messages.
    #[arg(long = "message")]
    messages: Vec<String>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(clap::Args, Debug)]
struct InspectCheckpointArgs {
    #[arg(long)]
    checkpoint: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long)]
    session: String,
    /// Fold only the first N events.
    #[arg(long)]
    to: Option<u64>,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::InspectCheckpoint(args) => inspect_checkpoint_command(args),
        Commands::Replay(args) => replay_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let config = ProbeConfig::load(args.config.as_deref())?;
    let script = SessionScript::load(&args.script)?;
    let messages = if args.messages.is_empty() {
        script.messages.clone()
    } else {
        args.messages.clone()
    };
    if messages.is_empty() {
        return Err("no messages: add them to the script or pass --message".to_string());
    }
    if args.session.is_some() && args.data_dir.is_none() {
        return Err("--session requires --data-dir".to_string());
    }

    let (backend, checkpointer) = open_storage(args.data_dir.as_deref())?;
    let manager = build_manager(
        &config,
        &script,
        args.workspace.as_deref(),
        backend,
        checkpointer,
    )?;

    let session_id = match args.session {
        Some(session_id) => {
            manager
                .resume_session(&session_id)
                .await
                .map_err(|error| error.to_string())?;
            session_id
        }
        None => manager
            .create_session()
            .await
            .map_err(|error| error.to_string())?,
    };
    println!("session_id: {session_id}");
    tracing::debug!(
        session_id = %session_id,
        messages = messages.len(),
        persistent = args.data_dir.is_some(),
        "running scripted session"
    );

    let printer = if args.no_stream_events {
        None
    } else {
        let from = manager
            .state(&session_id)
            .await
            .map_err(|error| error.to_string())?
            .log_len;
        let stream = manager
            .stream_events(&session_id, from)
            .map_err(|error| error.to_string())?;
        Some(tokio::spawn(print_events(stream, args.event_json)))
    };

    let mut steps = Vec::with_capacity(messages.len());
    for message in &messages {
        let step = manager
            .post_message(&session_id, message)
            .await
            .map_err(|error| error.to_string())?;
        let failed = step.status == StepStatus::Failed;
        steps.push(step);
        if failed {
            break;
        }
    }

    manager
        .close_session(&session_id)
        .map_err(|error| error.to_string())?;
    if let Some(task) = printer {
        task.await.map_err(|error| error.to_string())?;
    }

    for (index, step) in steps.iter().enumerate() {
        print_step_summary(index + 1, step);
    }
    let status = steps
        .last()
        .map(|step| step.status)
        .unwrap_or(StepStatus::Completed);
    Ok(exit_code_for_status(status))
}

fn inspect_checkpoint_command(args: InspectCheckpointArgs) -> Result<ExitCode, String> {
    let envelope =
        CheckpointEnvelope::load_from_path(&args.checkpoint).map_err(|e| e.to_string())?;
    if args.json {
        let json = serde_json::to_string_pretty(&envelope).map_err(|e| e.to_string())?;
        println!("{json}");
        return Ok(ExitCode::SUCCESS);
    }

    let state = &envelope.state;
    println!("checkpoint: {}", args.checkpoint.display());
    println!("schema_version: {}", envelope.schema_version);
    println!("thread_id: {}", envelope.thread_id);
    println!("version: {}", envelope.version);
    println!("timestamp: {}", envelope.timestamp);
    println!("node: {}", state.node.as_str());
    println!("messages: {}", state.messages.len());
    println!(
        "last_worker: {}",
        state.last_worker.as_deref().unwrap_or("<none>")
    );
    println!(
        "last_result: {}",
        state.last_result_label().unwrap_or("<none>")
    );
    println!(
        "artifact: {}",
        state.generated_artifact_path.as_deref().unwrap_or("<none>")
    );
    println!("steps: {}", state.step_count);
    println!("invocations: {}", state.invocations);
    println!("committed_position: {}", state.committed_position);
    Ok(ExitCode::SUCCESS)
}

async fn replay_command(args: ReplayArgs) -> Result<ExitCode, String> {
    let backend: SharedEventBackend = Arc::new(
        FsEventBackend::new(args.data_dir.join(EVENTS_DIR)).map_err(|e| e.to_string())?,
    );
    let log = EventLog::open(backend, args.session.clone())
        .await
        .map_err(|e| e.to_string())?;
    let position = args.to.unwrap_or_else(|| log.len()).min(log.len());
    let state = log.fold_to(position);

    if args.json {
        let json = serde_json::to_string_pretty(&state).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        print_session_state(&args.session, position, log.len(), &state);
    }
    Ok(ExitCode::SUCCESS)
}

fn open_storage(
    data_dir: Option<&Path>,
) -> Result<(SharedEventBackend, SharedCheckpointer), String> {
    match data_dir {
        Some(root) => {
            let backend = FsEventBackend::new(root.join(EVENTS_DIR)).map_err(|e| e.to_string())?;
            let checkpointer =
                FsCheckpointer::new(root.join(THREADS_DIR)).map_err(|e| e.to_string())?;
            Ok((Arc::new(backend), Arc::new(checkpointer)))
        }
        None => Ok((
            Arc::new(MemoryEventBackend::new()),
            Arc::new(MemoryCheckpointer::new()),
        )),
    }
}

fn build_manager(
    config: &ProbeConfig,
    script: &SessionScript,
    workspace: Option<&Path>,
    backend: SharedEventBackend,
    checkpointer: SharedCheckpointer,
) -> Result<SessionManager, String> {
    let browser = BrowsingWorker::new(
        Arc::new(script.browser.executor()),
        Arc::new(script.browser.reasoner()),
        config.worker.clone(),
    );
    let coder_executor: Arc<dyn ActionExecutor> = match workspace {
        Some(root) => Arc::new(WorkspaceExecutor::new(root)),
        None => Arc::new(script.coder.executor()),
    };
    let coder = CodingWorker::new(
        coder_executor,
        Arc::new(script.coder.reasoner()),
        config.worker.clone(),
    );

    let graph = GraphBuilder::new(checkpointer)
        .with_config(config.graph.clone())
        .with_routing(config.routing.clone())
        .worker(Arc::new(browser))
        .and_then(|builder| builder.worker(Arc::new(coder)))
        .and_then(|builder| builder.worker(Arc::new(SupervisorWorker::new(&config.worker))))
        .and_then(|builder| builder.compile())
        .map_err(|error| error.to_string())?;
    Ok(SessionManager::with_config(
        graph,
        backend,
        config.session.clone(),
    ))
}

async fn print_events(mut stream: EventStream, event_json: bool) {
    while let Some(event) = stream.next().await {
        if event_json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(_) => print_event_text(&event),
            }
        } else {
            print_event_text(&event);
        }
    }
}

fn print_event_text(event: &Event) {
    println!(
        "[event pos={}] {} {} {}",
        event.position,
        event.timestamp,
        event.source.label(),
        event.kind().map(EventKind::as_str).unwrap_or("unrecognized")
    );
}

fn print_step_summary(index: usize, step: &StepResult) {
    println!(
        "step {index}: {} worker={} events={} status={}",
        match step.status {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        },
        step.thread.last_worker.as_deref().unwrap_or("<none>"),
        step.events.len(),
        step.session_state.status.as_str()
    );
    if let Some(error_type) = step.error_type() {
        println!("step {index}: error_type={error_type}");
    }
    if let Some(path) = step.thread.generated_artifact_path.as_deref() {
        println!("step {index}: artifact={path}");
    }
}

fn print_session_state(session_id: &str, position: u64, len: u64, state: &SessionState) {
    println!("session_id: {session_id}");
    println!("position: {position}/{len}");
    println!("status: {}", state.status.as_str());
    println!("events: {}", state.event_count);
    println!(
        "current_url: {}",
        state.current_url.as_deref().unwrap_or("<none>")
    );
    println!(
        "last_action: {}",
        state.last_action.as_deref().unwrap_or("<none>")
    );
    println!("failures: {}", state.failures.len());
    if let Some(failure) = state.last_failure() {
        println!(
            "last_failure: {} at {}: {}",
            failure.error_type, failure.position, failure.error_message
        );
    }
    println!(
        "assertions: {} passed, {} failed",
        state.assertions_passed, state.assertions_failed
    );
}

fn exit_code_for_status(status: StepStatus) -> ExitCode {
    match status {
        StepStatus::Completed => ExitCode::SUCCESS,
        StepStatus::Failed => ExitCode::from(2),
    }
}
