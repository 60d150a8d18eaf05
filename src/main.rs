//! # sidecar
//!
//! Command-line host for the add-on engine. Wires settings, telemetry, the
//! result store and the HTTP invoker around a chat transcript kept in a JSON
//! file.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

use sidecar_core::{AddonId, PersistError, Persister, SidecarEvent, Transcript, Turn, TurnSource};
use sidecar_engine::{CycleReport, DispatchOutcome, Dispatcher, DispatcherConfig, HostPayload};
use sidecar_llm::HttpInvoker;
use sidecar_settings::{load_settings, load_settings_from_path, sidecar_dir, validate, SidecarSettings};
use sidecar_store::{Database, ResultRepo};
use sidecar_telemetry::{init_telemetry, TelemetryConfig};

/// Chat add-on runner.
#[derive(Parser, Debug)]
#[command(name = "sidecar", about = "Run chat add-ons against a transcript")]
struct Cli {
    /// Settings file (defaults to `~/.sidecar/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Results database (overrides settings).
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Debug-level logs from the dispatch engine.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed every turn of a chat through the engine, in order.
    Replay {
        #[arg(long)]
        chat: PathBuf,
    },
    /// Print stored results for one add-on, newest first.
    History {
        #[arg(long)]
        addon: String,
    },
    /// Run manual add-ons on the latest AI turn of a chat.
    RunManual {
        #[arg(long)]
        chat: PathBuf,
        /// Add-on ids to run; all enabled manual add-ons when omitted.
        #[arg(long)]
        addon: Vec<String>,
    },
}

/// Transcript host backed by a JSON file holding an array of turns.
/// Saving rewrites the file from the in-memory log.
struct FileTranscript {
    path: PathBuf,
    transcript: Transcript,
}

impl FileTranscript {
    fn load(path: &Path) -> Result<Self> {
        let turns = read_turns(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            transcript: Transcript::new(turns),
        })
    }

    /// Start empty but save to `path`; used when replaying turn by turn.
    fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            transcript: Transcript::default(),
        }
    }

    fn push(&self, turn: Turn) -> usize {
        self.transcript.push(turn)
    }
}

impl TurnSource for FileTranscript {
    fn turns(&self) -> Vec<Turn> {
        self.transcript.turns()
    }
}

#[async_trait]
impl Persister for FileTranscript {
    async fn persist(&self) -> Result<(), PersistError> {
        let json = serde_json::to_vec_pretty(&self.transcript.turns()).map_err(|e| PersistError(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| PersistError(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PersistError(format!("{}: {e}", self.path.display())))
    }
}

fn read_turns(path: &Path) -> Result<Vec<Turn>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read chat: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid chat file: {}", path.display()))
}

/// Relative database paths live under `~/.sidecar`.
fn resolve_db_path(configured: &str, base: &Path) -> PathBuf {
    let path = PathBuf::from(configured);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn open_repo(cli: &Cli, settings: &SidecarSettings) -> Result<ResultRepo> {
    let path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| resolve_db_path(&settings.storage.database_path, &sidecar_dir()));
    let db = Database::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))?;
    info!(path = %path.display(), "database opened");
    Ok(ResultRepo::new(db))
}

fn build_dispatcher(host: Arc<FileTranscript>, repo: ResultRepo, settings: &SidecarSettings) -> Result<Dispatcher> {
    let invoker = HttpInvoker::new(&settings.llm).context("Failed to build model invoker")?;
    Ok(Dispatcher::new(
        host.clone(),
        Arc::new(invoker),
        host,
        repo,
        settings.addons.clone(),
        DispatcherConfig::from(&settings.dispatch),
    ))
}

/// Print presentation signals as JSON lines until the channel closes.
fn spawn_event_printer(mut rx: broadcast::Receiver<SidecarEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "failed to encode event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn summarize(report: &CycleReport) -> String {
    format!(
        "turn {}: {} succeeded, {} failed",
        report.turn,
        report.succeeded.len(),
        report.failed.len()
    )
}

async fn replay(cli: &Cli, settings: &SidecarSettings, chat: &Path) -> Result<()> {
    let turns = read_turns(chat)?;
    let host = Arc::new(FileTranscript::empty(chat));
    let dispatcher = build_dispatcher(host.clone(), open_repo(cli, settings)?, settings)?;
    let printer = spawn_event_printer(dispatcher.subscribe());

    for turn in turns {
        let index = host.push(turn);
        let payload = HostPayload::Index(i64::try_from(index).context("chat too long")?);
        match dispatcher.handle_host_event(&payload).await? {
            DispatchOutcome::Dispatched(report) => eprintln!("{}", summarize(&report)),
            DispatchOutcome::TriggersQueued { turn, matched } if !matched.is_empty() => {
                eprintln!("turn {turn}: {} trigger add-on(s) queued", matched.len());
            }
            _ => {}
        }
    }

    dispatcher.flush_persistence().await;
    drop(dispatcher);
    let _ = printer.await;
    Ok(())
}

async fn run_manual(cli: &Cli, settings: &SidecarSettings, chat: &Path, addons: &[String]) -> Result<()> {
    let host = Arc::new(FileTranscript::load(chat)?);
    let dispatcher = build_dispatcher(host, open_repo(cli, settings)?, settings)?;
    dispatcher.on_chat_loaded()?;
    let printer = spawn_event_printer(dispatcher.subscribe());

    let ids = (!addons.is_empty()).then(|| addons.iter().map(|a| AddonId::from(a.as_str())).collect());
    let report = dispatcher.run_manual(ids).await?;
    eprintln!("{}", summarize(&report));

    dispatcher.flush_persistence().await;
    drop(dispatcher);
    let _ = printer.await;
    Ok(())
}

fn history(cli: &Cli, settings: &SidecarSettings, addon: &str) -> Result<()> {
    let repo = open_repo(cli, settings)?;
    for result in repo.list_for_addon(&AddonId::from(addon))? {
        println!("{}", serde_json::to_string(&result)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("Failed to load settings")?;
    validate(&settings).context("Invalid settings")?;

    let telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        settings.logging.json,
    ));
    if cli.verbose {
        telemetry.set_module_level("sidecar_engine", Level::DEBUG);
    }
    info!(addons = settings.addons.len(), "sidecar starting");

    match &cli.command {
        Command::Replay { chat } => replay(&cli, &settings, chat).await,
        Command::History { addon } => history(&cli, &settings, addon),
        Command::RunManual { chat, addon } => run_manual(&cli, &settings, chat, addon).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_db_path_resolves_under_base() {
        let base = Path::new("/home/u/.sidecar");
        assert_eq!(resolve_db_path("results.db", base), base.join("results.db"));
        assert_eq!(resolve_db_path("/var/db/r.db", base), PathBuf::from("/var/db/r.db"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["sidecar", "run-manual", "--chat", "c.json", "--addon", "a", "--addon", "b"]);
        match cli.command {
            Command::RunManual { chat, addon } => {
                assert_eq!(chat, PathBuf::from("c.json"));
                assert_eq!(addon, vec!["a", "b"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        let cli = Cli::parse_from(["sidecar", "history", "--addon", "mood", "--db-path", "/tmp/x.db"]);
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/x.db")));
    }

    #[tokio::test]
    async fn file_transcript_saves_turns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(&path, serde_json::to_string(&vec![Turn::user("hi")]).unwrap()).unwrap();

        let host = FileTranscript::load(&path).unwrap();
        host.push(Turn::assistant("hello"));
        host.persist().await.unwrap();

        let saved = read_turns(&path).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].text(), "hello");
        assert!(!dir.path().join("chat.json.tmp").exists());
    }

    #[test]
    fn unreadable_chat_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(FileTranscript::load(&path).is_err());
    }
}
