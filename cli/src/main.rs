mod pty;

use std::io::Read;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use memory_bank_core::MemoryBankError;
use memory_bank_core::episode::Episode;
use memory_bank_core::episode::build_graph;
use memory_bank_core::hooks;
use memory_bank_core::index::rebuild_index;
use memory_bank_core::ingest;
use memory_bank_core::migrations;
use memory_bank_core::models::SourceType;
use memory_bank_core::pack::PackFormat;
use memory_bank_core::pack::PackMode;
use memory_bank_core::pack::PackRequest;
use memory_bank_core::pack::build_pack;
use memory_bank_core::registry::Registry;
use memory_bank_core::retriever::RetrievalRequest;
use memory_bank_core::retriever::global_search;
use memory_bank_core::retriever::retrieve;
use memory_bank_core::storage::MEMORY_BANK_DIR;
use memory_bank_core::storage::Store;
use memory_bank_ollama::OllamaClient;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mb", version, about = "Capture, search, and restore agent session context")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize Memory Bank storage in the current project.
    Init,
    /// Launch a command inside the PTY wrapper with session capture.
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// List recorded sessions.
    Sessions,
    /// Delete a session by id.
    Delete { session_id: String },
    /// Semantic search across captured sessions.
    Search {
        query: String,
        /// Number of results to return.
        #[arg(long, default_value_t = 5)]
        top: usize,
        /// Restrict to a chunk source type (session, plan, todo, task).
        #[arg(long = "type")]
        source_type: Option<String>,
        /// Restrict to sessions with this episode label.
        #[arg(long)]
        episode: Option<String>,
        /// Search every registered project, not just this one.
        #[arg(long)]
        global: bool,
        /// Rank purely by cosine similarity, without temporal decay.
        #[arg(long)]
        no_decay: bool,
        /// Second-pass LLM reranking of the candidates.
        #[arg(long)]
        rerank: bool,
    },
    /// Import historical agent sessions and artifacts for this project.
    Import {
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the agent Stop hook.
    Hooks {
        #[command(subcommand)]
        command: HooksCommand,
    },
    /// Generate a token-budgeted context pack.
    Pack {
        /// Token budget for the pack.
        #[arg(long, default_value_t = 6000)]
        budget: i64,
        /// Pack mode: auto, debug, build, or explore.
        #[arg(long, default_value = "auto")]
        mode: String,
        /// Output format: xml, json, or md.
        #[arg(long, default_value = "xml")]
        format: String,
        /// Fill recent context only from sessions with this episode label.
        #[arg(long)]
        episode: Option<String>,
        /// Write the pack to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show the session graph with episodes and error states.
    Graph,
    /// Clear the vector index and rebuild it from all chunks.
    Reindex,
    /// Upgrade the store to the current schema version.
    Migrate,
    /// List projects registered for cross-project search.
    Projects,
    /// Stop-hook entry point; reads the agent payload from stdin.
    #[command(hide = true)]
    Hook,
}

#[derive(Subcommand)]
enum HooksCommand {
    /// Install the Stop hook into the agent settings.
    Install,
    /// Remove the Stop hook from the agent settings.
    Uninstall,
    /// Show whether the Stop hook is installed.
    Status,
}

fn store_root() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(MEMORY_BANK_DIR)
}

fn open_store() -> memory_bank_core::Result<Store> {
    Store::open(&store_root())
}

/// Open the store, initializing it on first use.
fn open_or_init_store() -> memory_bank_core::Result<Store> {
    let (created, store) = Store::init(&store_root())?;
    if created {
        eprintln!("Initialized Memory Bank in {MEMORY_BANK_DIR}/");
    }
    Ok(store)
}

fn oracle_for(store: &Store) -> memory_bank_core::Result<OllamaClient> {
    let config = store.read_config()?;
    Ok(OllamaClient::from_settings(&config.ollama)?)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            child.cancel();
        }
    });
    cancel
}

fn parse_episode(value: Option<&str>) -> memory_bank_core::Result<Option<Episode>> {
    match value {
        None => Ok(None),
        Some(raw) => Episode::parse(raw)
            .map(Some)
            .ok_or_else(|| MemoryBankError::InvalidMode(format!("episode {raw}"))),
    }
}

fn format_ts(ts: f64) -> String {
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(command: Command) -> memory_bank_core::Result<i32> {
    match command {
        Command::Init => {
            let (created, store) = Store::init(&store_root())?;
            if created {
                println!("Initialized Memory Bank in {MEMORY_BANK_DIR}/");
                println!(
                    "Warning: captured sessions may contain sensitive data.\n\
                     {MEMORY_BANK_DIR}/ has been added to .gitignore."
                );
            } else {
                println!("Memory Bank already initialized in {MEMORY_BANK_DIR}/");
            }
            if let Some(registry) = Registry::for_current_user()
                && let Some(project_root) = store.root().parent()
            {
                registry.register(project_root)?;
            }
            Ok(0)
        }

        Command::Run { command } => {
            let store = open_or_init_store()?;
            let exit_code =
                tokio::task::spawn_blocking(move || pty::run_session(&command, &store))
                    .await
                    .map_err(|err| MemoryBankError::Io(std::io::Error::other(err.to_string())))??;
            Ok(exit_code)
        }

        Command::Sessions => {
            let store = open_store()?;
            let sessions = store.list_sessions()?;
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(0);
            }
            println!("{:<25}{:<10}{:<22}{:<22}EXIT", "SESSION", "SOURCE", "COMMAND", "STARTED");
            for meta in sessions {
                let command = meta.command.join(" ");
                let command = if command.chars().count() > 20 {
                    format!("{}…", command.chars().take(19).collect::<String>())
                } else {
                    command
                };
                let exit = meta
                    .exit_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<25}{:<10}{:<22}{:<22}{exit}",
                    meta.id,
                    meta.source.to_string(),
                    command,
                    format_ts(meta.started_at),
                );
            }
            Ok(0)
        }

        Command::Delete { session_id } => {
            let store = open_store()?;
            let _guard = store.lock_exclusive()?;
            if !store.delete_session(&session_id)? {
                return Err(MemoryBankError::SessionNotFound(session_id));
            }
            // Stale vectors would point at the deleted session; drop the
            // index and let the next search rebuild it.
            memory_bank_core::index::VectorIndex::open(&store.index_dir())?.clear()?;
            println!("Deleted session {session_id}. Index cleared.");
            Ok(0)
        }

        Command::Search {
            query,
            top,
            source_type,
            episode,
            global,
            no_decay,
            rerank,
        } => {
            let store = open_store()?;
            let oracle = oracle_for(&store)?;
            let cancel = cancel_on_ctrl_c();

            let mut request = RetrievalRequest::new(query, top);
            request.rerank = rerank;
            if no_decay {
                request.decay = Some(false);
            }
            if let Some(raw) = source_type.as_deref() {
                request.source_type = Some(SourceType::parse(raw).ok_or_else(|| {
                    MemoryBankError::InvalidMode(format!("source type {raw}"))
                })?);
            }
            request.episode = parse_episode(episode.as_deref())?;

            if global {
                let registry = Registry::for_current_user().ok_or_else(|| {
                    MemoryBankError::Io(std::io::Error::other("no home directory"))
                })?;
                let results = global_search(&registry, &oracle, &request, &cancel).await?;
                if results.is_empty() {
                    println!("No results.");
                    return Ok(0);
                }
                for (root, result) in results {
                    println!("[{:.2}] {} {}", result.score, root, result.key);
                    println!("  {}", snippet(&result.text));
                }
            } else {
                let results = retrieve(&store, &oracle, &request, &cancel).await?;
                if results.is_empty() {
                    println!("No results.");
                    return Ok(0);
                }
                for result in results {
                    println!(
                        "[{:.2}] Session {} (chunk {})",
                        result.score, result.key.session_id, result.key.chunk_index
                    );
                    println!("  {}", snippet(&result.text));
                }
            }
            Ok(0)
        }

        Command::Import { dry_run } => {
            let store = open_or_init_store()?;
            let agent_home = dirs::home_dir()
                .map(|home| home.join(".claude"))
                .ok_or_else(|| MemoryBankError::Io(std::io::Error::other("no home directory")))?;

            let outcome = ingest::import_agent_history(&store, &agent_home, dry_run)?;
            if dry_run {
                println!(
                    "Dry run: {} session(s) would be imported, {} skipped.",
                    outcome.imported, outcome.skipped
                );
            } else {
                println!(
                    "Imported {} session(s), {} skipped; artifacts: {} todos, {} plans, {} task sets.",
                    outcome.imported, outcome.skipped, outcome.todos, outcome.plans, outcome.tasks
                );
                if let Some(registry) = Registry::for_current_user()
                    && let Some(project_root) = store.root().parent()
                {
                    let count = store.list_sessions()?.len() as u64;
                    registry.update_stats(project_root, count)?;
                }
            }
            Ok(0)
        }

        Command::Hooks { command } => {
            let settings_path = hooks::default_settings_path().ok_or_else(|| {
                MemoryBankError::Io(std::io::Error::other("no home directory"))
            })?;
            match command {
                HooksCommand::Install => {
                    let exe = std::env::current_exe()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "mb".to_string());
                    let installed = hooks::install(&settings_path, &format!("{exe} hook"))?;
                    println!(
                        "{}",
                        if installed {
                            "Memory Bank hook installed."
                        } else {
                            "Memory Bank hook already installed."
                        }
                    );
                }
                HooksCommand::Uninstall => {
                    let removed = hooks::uninstall(&settings_path)?;
                    println!(
                        "{}",
                        if removed {
                            "Memory Bank hook uninstalled."
                        } else {
                            "Memory Bank hook not found."
                        }
                    );
                }
                HooksCommand::Status => {
                    let status = hooks::status(&settings_path)?;
                    match status.command {
                        Some(command) => println!("Installed: {command}"),
                        None => println!("Not installed."),
                    }
                }
            }
            Ok(0)
        }

        Command::Pack {
            budget,
            mode,
            format,
            episode,
            out,
        } => {
            if budget <= 0 {
                return Err(MemoryBankError::InvalidBudget(budget));
            }
            let store = open_store()?;
            let oracle = oracle_for(&store)?;

            let request = PackRequest {
                budget: budget as u32,
                mode: PackMode::parse(&mode)?,
                format: PackFormat::parse(&format)?,
                episode: parse_episode(episode.as_deref())?,
            };
            let document = build_pack(&store, &oracle, &request).await?;

            match out {
                Some(path) => {
                    std::fs::write(&path, &document)?;
                    eprintln!("Context pack written to {}", path.display());
                }
                None => print!("{document}"),
            }
            Ok(0)
        }

        Command::Graph => {
            let store = open_store()?;
            for node in build_graph(&store)? {
                let error = if node.has_error {
                    node.error_summary
                        .map(|s| format!(" error: {s}"))
                        .unwrap_or_else(|| " error".to_string())
                } else {
                    String::new()
                };
                println!(
                    "{} [{}]{} related: {}",
                    node.meta.id,
                    node.episode,
                    error,
                    if node.related_sessions.is_empty() {
                        "-".to_string()
                    } else {
                        node.related_sessions.join(", ")
                    }
                );
            }
            Ok(0)
        }

        Command::Reindex => {
            let store = open_store()?;
            let oracle = oracle_for(&store)?;
            let cancel = cancel_on_ctrl_c();

            ingest::chunk_all_sessions(&store, false)?;
            let _guard = store.lock_exclusive()?;
            rebuild_index(&store, &oracle, &cancel).await?;
            let index = memory_bank_core::index::VectorIndex::open(&store.index_dir())?;
            println!("Reindexed {} chunk(s).", index.len()?);
            Ok(0)
        }

        Command::Migrate => {
            let store = open_store()?;
            let (old, new) = migrations::migrate(&store)?;
            if old == new {
                println!("Store already at schema v{new}.");
            } else {
                println!("Migrated store from v{old} to v{new}.");
            }
            Ok(0)
        }

        Command::Projects => {
            let registry = Registry::for_current_user().ok_or_else(|| {
                MemoryBankError::Io(std::io::Error::other("no home directory"))
            })?;
            let projects = registry.list()?;
            if projects.is_empty() {
                println!("No projects registered.");
                return Ok(0);
            }
            for entry in projects {
                let last = entry
                    .last_import_at
                    .map(format_ts)
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} ({} sessions, last import {last})",
                    entry.root, entry.session_count
                );
            }
            Ok(0)
        }

        Command::Hook => {
            // The hook contract: consume stdin, do our best, always exit 0.
            let mut raw = String::new();
            if std::io::stdin().read_to_string(&mut raw).is_err() {
                return Ok(0);
            }
            let Some(payload) = hooks::HookPayload::parse(&raw) else {
                debug!("unparseable hook payload");
                return Ok(0);
            };
            if payload.cwd.is_empty() {
                return Ok(0);
            }

            let root = PathBuf::from(&payload.cwd).join(MEMORY_BANK_DIR);
            let result = Store::init(&root).and_then(|(_, store)| {
                ingest::ingest_hook(
                    &store,
                    std::path::Path::new(&payload.transcript_path),
                    &payload.cwd,
                    &payload.session_id,
                )
            });
            if let Err(err) = result {
                debug!("hook processing failed: {err}");
            }
            Ok(0)
        }
    }
}

fn snippet(text: &str) -> String {
    let flat: String = text
        .chars()
        .take(200)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    if text.chars().count() > 200 {
        format!("{}…", flat.trim_end())
    } else {
        flat.trim_end().to_string()
    }
}
