//! On-disk store layout and session lifecycle.
//!
//! One store per project, conventionally `.memory-bank/` under the project
//! root. Session event and chunk logs are JSONL with one record per line;
//! small state documents are pretty-printed JSON rewritten atomically.
//! Mutations are serialized through an advisory lock on `<root>/.lock`.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::config::MemoryBankConfig;
use crate::error::MemoryBankError;
use crate::error::Result;
use crate::models::Chunk;
use crate::models::ProjectState;
use crate::models::SessionEvent;
use crate::models::SessionMeta;
use crate::models::SessionSource;
use crate::models::SourceType;

pub const MEMORY_BANK_DIR: &str = ".memory-bank";
const CONFIG_FILE: &str = "config.json";
const LOCK_FILE: &str = ".lock";
const HOOKS_STATE_FILE: &str = "hooks_state.json";
const IMPORT_STATE_FILE: &str = "import_state.json";
const META_FILE: &str = "meta.json";
const EVENTS_FILE: &str = "events.jsonl";
const CHUNKS_FILE: &str = "chunks.jsonl";
const STATE_FILE: &str = "state.json";

const LOCK_RETRIES: usize = 10;
const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Current wall-clock time as epoch seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Hook session bookkeeping: which of our sessions an agent session maps to
/// and how much of its transcript we have already processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSessionState {
    pub mb_session_id: String,
    pub transcript_path: String,
    pub transcript_size: u64,
    pub last_processed: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HooksState {
    #[serde(default)]
    pub sessions: std::collections::BTreeMap<String, HookSessionState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportState {
    /// Agent session uuid -> our session id.
    #[serde(default)]
    pub imported: std::collections::BTreeMap<String, String>,
    /// Imported artifact keys, `<source_type>:<agent_session_id>:<artifact_id>`.
    #[serde(default)]
    pub artifacts: std::collections::BTreeSet<String>,
    /// Plan slugs discovered in transcripts, cached across imports.
    #[serde(default)]
    pub plan_slugs: std::collections::BTreeSet<String>,
}

/// Dedup key for an imported artifact.
pub fn artifact_key(source_type: SourceType, agent_session_id: &str, artifact_id: &str) -> String {
    format!("{source_type}:{agent_session_id}:{artifact_id}")
}

/// Handle to one project store. The root is explicit everywhere; nothing is
/// process-global, so a long-running process may hold many stores open.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

/// Guard over the store's advisory lock file. Readers take it shared,
/// writers exclusive; the lock releases when the guard drops.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

impl Store {
    /// Initialize a store at `root`, creating the directory skeleton and the
    /// default config. Returns `(created, store)`; `created` is false when
    /// the store already existed.
    pub fn init(root: &Path) -> Result<(bool, Store)> {
        let store = Store {
            root: root.to_path_buf(),
        };
        if store.config_path().exists() {
            return Ok((false, store));
        }

        std::fs::create_dir_all(store.sessions_dir())?;
        std::fs::create_dir_all(store.index_dir())?;
        std::fs::create_dir_all(store.state_dir())?;
        std::fs::create_dir_all(store.artifacts_dir())?;

        store.write_config(&MemoryBankConfig::default())?;
        ensure_gitignore(&store.root)?;

        Ok((true, store))
    }

    /// Open an existing store; fails when it was never initialized.
    pub fn open(root: &Path) -> Result<Store> {
        let store = Store {
            root: root.to_path_buf(),
        };
        if !store.config_path().exists() {
            return Err(MemoryBankError::NotInitialized(root.to_path_buf()));
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    fn chunks_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(CHUNKS_FILE)
    }

    fn events_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(EVENTS_FILE)
    }

    pub fn artifact_chunks_path(&self) -> PathBuf {
        self.artifacts_dir().join(CHUNKS_FILE)
    }

    // -- Locking ------------------------------------------------------------

    fn lock_file(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.root.join(LOCK_FILE))?)
    }

    /// Exclusive lock for mutations of session logs or the index.
    pub fn lock_exclusive(&self) -> Result<StoreLock> {
        let file = self.lock_file()?;
        for _ in 0..LOCK_RETRIES {
            match file.try_lock() {
                Ok(()) => return Ok(StoreLock { _file: file }),
                Err(std::fs::TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY_SLEEP),
                Err(std::fs::TryLockError::Error(err)) => return Err(err.into()),
            }
        }
        Err(MemoryBankError::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "could not acquire exclusive store lock after multiple attempts",
        )))
    }

    /// Shared lock for readers (search, pack).
    pub fn lock_shared(&self) -> Result<StoreLock> {
        let file = self.lock_file()?;
        for _ in 0..LOCK_RETRIES {
            match file.try_lock_shared() {
                Ok(()) => return Ok(StoreLock { _file: file }),
                Err(std::fs::TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY_SLEEP),
                Err(std::fs::TryLockError::Error(err)) => return Err(err.into()),
            }
        }
        Err(MemoryBankError::Io(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "could not acquire shared store lock after multiple attempts",
        )))
    }

    // -- Config -------------------------------------------------------------

    pub fn read_config(&self) -> Result<MemoryBankConfig> {
        let path = self.config_path();
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|err| MemoryBankError::corrupt(&path, err))
    }

    pub fn write_config(&self, config: &MemoryBankConfig) -> Result<()> {
        write_json_atomic(&self.config_path(), config)
    }

    // -- Hook / import state ------------------------------------------------

    pub fn load_hooks_state(&self) -> HooksState {
        read_json_or_default(&self.root.join(HOOKS_STATE_FILE))
    }

    pub fn save_hooks_state(&self, state: &HooksState) -> Result<()> {
        write_json_atomic(&self.root.join(HOOKS_STATE_FILE), state)
    }

    pub fn load_import_state(&self) -> ImportState {
        read_json_or_default(&self.root.join(IMPORT_STATE_FILE))
    }

    pub fn save_import_state(&self, state: &ImportState) -> Result<()> {
        write_json_atomic(&self.root.join(IMPORT_STATE_FILE), state)
    }

    // -- Sessions -----------------------------------------------------------

    /// Create a session with a fresh id and an open meta record.
    pub fn create_session(&self, params: CreateSession) -> Result<SessionMeta> {
        let started_at = params.started_at.filter(|ts| *ts > 0.0).unwrap_or_else(now_ts);
        let id = generate_session_id(started_at);
        let session_dir = self.session_dir(&id);
        std::fs::create_dir_all(&session_dir)?;

        let meta = SessionMeta {
            id: id.clone(),
            source: params.source,
            command: params.command,
            cwd: params.cwd,
            started_at,
            ended_at: None,
            exit_code: None,
            agent_session_id: params.agent_session_id,
        };
        write_json_atomic(&session_dir.join(META_FILE), &meta)?;

        if params.create_events {
            File::create(self.events_path(&id))?;
        }

        Ok(meta)
    }

    /// Close a session's meta record. `ended_at` defaults to now; after this
    /// the meta is read-only.
    pub fn finalize_session(
        &self,
        session_id: &str,
        exit_code: Option<i32>,
        ended_at: Option<f64>,
    ) -> Result<SessionMeta> {
        let meta_path = self.session_dir(session_id).join(META_FILE);
        if !meta_path.exists() {
            return Err(MemoryBankError::SessionNotFound(session_id.to_string()));
        }
        let raw = std::fs::read_to_string(&meta_path)?;
        let mut meta: SessionMeta =
            serde_json::from_str(&raw).map_err(|err| MemoryBankError::corrupt(&meta_path, err))?;

        let ended = ended_at.filter(|ts| *ts > 0.0).unwrap_or_else(now_ts);
        meta.ended_at = Some(ended.max(meta.started_at));
        if exit_code.is_some() {
            meta.exit_code = exit_code;
        }
        write_json_atomic(&meta_path, &meta)?;
        Ok(meta)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(dir)?;
        Ok(true)
    }

    /// All session metas, newest first. Corrupt entries are skipped with a
    /// warning rather than failing the listing.
    pub fn list_sessions(&self) -> Result<Vec<SessionMeta>> {
        let sessions_dir = self.sessions_dir();
        if !sessions_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            if !meta_path.exists() {
                continue;
            }
            match std::fs::read_to_string(&meta_path)
                .map_err(MemoryBankError::from)
                .and_then(|raw| {
                    serde_json::from_str::<SessionMeta>(&raw)
                        .map_err(|err| MemoryBankError::corrupt(&meta_path, err))
                }) {
                Ok(meta) => sessions.push(meta),
                Err(err) => {
                    warn!("skipping corrupt session {}: {err}", entry.path().display());
                }
            }
        }

        sessions.sort_by(|a, b| {
            b.started_at
                .partial_cmp(&a.started_at)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(sessions)
    }

    pub fn read_meta(&self, session_id: &str) -> Option<SessionMeta> {
        let meta_path = self.session_dir(session_id).join(META_FILE);
        let raw = std::fs::read_to_string(&meta_path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    // -- Events -------------------------------------------------------------

    /// Append one event as a single pre-serialized line.
    pub fn append_event(&self, session_id: &str, event: &SessionEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|err| MemoryBankError::corrupt(self.events_path(session_id), err))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.events_path(session_id))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    pub fn read_events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        read_jsonl(&self.events_path(session_id))
    }

    pub fn has_events(&self, session_id: &str) -> bool {
        self.events_path(session_id).exists()
    }

    // -- Chunks -------------------------------------------------------------

    /// Rewrite a session's chunk log in full. Chunking is deterministic, so
    /// re-running it produces a byte-identical file.
    pub fn write_chunks(&self, session_id: &str, chunks: &[Chunk]) -> Result<()> {
        let path = self.chunks_path(session_id);
        write_jsonl(&path, chunks)
    }

    pub fn read_chunks(&self, session_id: &str) -> Result<Vec<Chunk>> {
        read_jsonl(&self.chunks_path(session_id))
    }

    pub fn has_chunks(&self, session_id: &str) -> bool {
        self.chunks_path(session_id)
            .metadata()
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Stream every chunk in the store (sessions in sorted id order, then
    /// artifacts) without materializing them all.
    pub fn for_each_chunk(&self, mut f: impl FnMut(Chunk)) -> Result<()> {
        let sessions_dir = self.sessions_dir();
        if sessions_dir.exists() {
            let mut dirs: Vec<PathBuf> = std::fs::read_dir(&sessions_dir)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect();
            dirs.sort();
            for dir in dirs {
                stream_jsonl(&dir.join(CHUNKS_FILE), &mut f)?;
            }
        }
        stream_jsonl(&self.artifact_chunks_path(), &mut f)?;
        Ok(())
    }

    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        self.for_each_chunk(|chunk| chunks.push(chunk))?;
        Ok(chunks)
    }

    /// Newest modification time across all chunk logs, or `None` when no
    /// chunks exist yet. Drives index and state staleness.
    pub fn latest_chunk_mtime(&self) -> Option<SystemTime> {
        let mut latest: Option<SystemTime> = None;
        let mut consider = |path: &Path| {
            if let Ok(meta) = path.metadata()
                && let Ok(mtime) = meta.modified()
            {
                latest = Some(latest.map_or(mtime, |prev: SystemTime| prev.max(mtime)));
            }
        };

        if let Ok(entries) = std::fs::read_dir(self.sessions_dir()) {
            for entry in entries.flatten() {
                consider(&entry.path().join(CHUNKS_FILE));
            }
        }
        consider(&self.artifact_chunks_path());
        latest
    }

    // -- Artifacts ----------------------------------------------------------

    pub fn append_artifact_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        std::fs::create_dir_all(self.artifacts_dir())?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.artifact_chunks_path())?;
        for chunk in chunks {
            let mut line = serde_json::to_string(chunk)
                .map_err(|err| MemoryBankError::corrupt(self.artifact_chunks_path(), err))?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_artifact_chunks(&self) -> Result<Vec<Chunk>> {
        read_jsonl(&self.artifact_chunks_path())
    }

    pub fn write_plan(
        &self,
        slug: &str,
        content_md: &str,
        meta: &serde_json::Value,
    ) -> Result<()> {
        let plans_dir = self.artifacts_dir().join("plans");
        std::fs::create_dir_all(&plans_dir)?;
        std::fs::write(plans_dir.join(format!("{slug}.md")), content_md)?;
        write_json_atomic(&plans_dir.join(format!("{slug}.meta.json")), meta)
    }

    pub fn write_todo(&self, agent_session_id: &str, data: &serde_json::Value) -> Result<()> {
        let todos_dir = self.artifacts_dir().join("todos");
        std::fs::create_dir_all(&todos_dir)?;
        write_json_atomic(&todos_dir.join(format!("{agent_session_id}.json")), data)
    }

    pub fn write_task(
        &self,
        agent_session_id: &str,
        task_id: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let tasks_dir = self.artifacts_dir().join("tasks").join(agent_session_id);
        std::fs::create_dir_all(&tasks_dir)?;
        write_json_atomic(&tasks_dir.join(format!("{task_id}.json")), data)
    }

    // -- Project state ------------------------------------------------------

    pub fn load_state(&self) -> Option<ProjectState> {
        let path = self.state_dir().join(STATE_FILE);
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save_state(&self, state: &ProjectState) -> Result<()> {
        std::fs::create_dir_all(self.state_dir())?;
        write_json_atomic(&self.state_dir().join(STATE_FILE), state)
    }
}

/// Parameters for [`Store::create_session`].
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub command: Vec<String>,
    pub cwd: String,
    pub source: SessionSource,
    pub create_events: bool,
    pub started_at: Option<f64>,
    pub agent_session_id: Option<String>,
}

impl CreateSession {
    pub fn new(command: Vec<String>, cwd: impl Into<String>, source: SessionSource) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            source,
            create_events: source == SessionSource::Pty,
            started_at: None,
            agent_session_id: None,
        }
    }
}

fn generate_session_id(started_at: f64) -> String {
    let secs = started_at.max(0.0) as i64;
    let stamp = DateTime::<Utc>::from_timestamp(secs, 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .format("%Y%m%d-%H%M%S");
    let suffix: u16 = rand::rng().random();
    format!("{stamp}-{suffix:04x}")
}

fn ensure_gitignore(store_root: &Path) -> Result<()> {
    let Some(project_root) = store_root.parent() else {
        return Ok(());
    };
    let gitignore = project_root.join(".gitignore");
    let entry = format!("{MEMORY_BANK_DIR}/");

    if gitignore.exists() {
        let mut content = std::fs::read_to_string(&gitignore)?;
        if content.lines().any(|line| line == entry) {
            return Ok(());
        }
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&entry);
        content.push('\n');
        std::fs::write(&gitignore, content)?;
    } else {
        std::fs::write(&gitignore, format!("{entry}\n"))?;
    }
    Ok(())
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return T::default();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

/// Pretty-printed JSON written through a temp file and rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)
        .map_err(|err| MemoryBankError::corrupt(path, err))?;
    body.push('\n');

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// JSONL rewritten through a temp file and rename, so a reader never
/// observes a torn log.
fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let mut body = String::new();
    for record in records {
        body.push_str(
            &serde_json::to_string(record).map_err(|err| MemoryBankError::corrupt(path, err))?,
        );
        body.push('\n');
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut records = Vec::new();
    stream_jsonl(path, &mut |record| records.push(record))?;
    Ok(records)
}

fn stream_jsonl<T: DeserializeOwned>(path: &Path, f: &mut impl FnMut(T)) -> Result<()> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(trimmed)
            .map_err(|err| MemoryBankError::corrupt(path, err))?;
        f(record);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventStream;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().expect("create temp dir");
        let root = dir.path().join(MEMORY_BANK_DIR);
        let (created, store) = Store::init(&root).expect("init store");
        assert!(created);
        (dir, store)
    }

    #[test]
    fn init_is_idempotent_and_creates_layout() {
        let (_dir, store) = test_store();
        assert!(store.config_path().exists());
        assert!(store.sessions_dir().exists());
        assert!(store.index_dir().exists());
        assert!(store.state_dir().exists());

        let (created_again, _) = Store::init(store.root()).expect("re-init store");
        assert!(!created_again);
    }

    #[test]
    fn init_appends_gitignore_entry_once() {
        let (dir, store) = test_store();
        let gitignore = dir.path().join(".gitignore");
        let content = std::fs::read_to_string(&gitignore).expect("read gitignore");
        assert_eq!(content, ".memory-bank/\n");

        // Re-running init must not duplicate the entry.
        Store::init(store.root()).expect("re-init store");
        let content = std::fs::read_to_string(&gitignore).expect("read gitignore");
        assert_eq!(content, ".memory-bank/\n");
    }

    #[test]
    fn open_fails_without_init() {
        let dir = TempDir::new().expect("create temp dir");
        let err = Store::open(&dir.path().join(MEMORY_BANK_DIR)).expect_err("expect not init");
        assert!(matches!(err, MemoryBankError::NotInitialized(_)));
    }

    #[test]
    fn session_lifecycle() {
        let (_dir, store) = test_store();
        let meta = store
            .create_session(CreateSession::new(
                vec!["cargo".to_string(), "test".to_string()],
                "/tmp/project",
                SessionSource::Pty,
            ))
            .expect("create session");

        assert!(meta.ended_at.is_none());
        assert!(store.has_events(&meta.id));
        assert!(meta.id.len() > 16);

        let finalized = store
            .finalize_session(&meta.id, Some(0), None)
            .expect("finalize session");
        assert_eq!(finalized.exit_code, Some(0));
        let ended = finalized.ended_at.expect("ended_at set");
        assert!(ended >= finalized.started_at);

        let listed = store.list_sessions().expect("list sessions");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, meta.id);

        assert!(store.delete_session(&meta.id).expect("delete session"));
        assert!(!store.delete_session(&meta.id).expect("delete again"));
    }

    #[test]
    fn finalize_unknown_session_fails() {
        let (_dir, store) = test_store();
        let err = store
            .finalize_session("nope", None, None)
            .expect_err("expect missing session");
        assert!(matches!(err, MemoryBankError::SessionNotFound(_)));
    }

    #[test]
    fn events_round_trip_in_order() {
        let (_dir, store) = test_store();
        let meta = store
            .create_session(CreateSession::new(
                vec!["bash".to_string()],
                "/tmp",
                SessionSource::Pty,
            ))
            .expect("create session");

        for i in 0..3 {
            store
                .append_event(
                    &meta.id,
                    &SessionEvent {
                        ts: i as f64,
                        stream: EventStream::Out,
                        text: format!("line {i}"),
                    },
                )
                .expect("append event");
        }

        let events = store.read_events(&meta.id).expect("read events");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].text, "line 2");
    }

    #[test]
    fn chunk_rewrite_is_byte_exact() {
        let (_dir, store) = test_store();
        let meta = store
            .create_session(CreateSession::new(
                vec!["claude".to_string()],
                "/tmp",
                SessionSource::Hook,
            ))
            .expect("create session");

        let chunks = vec![Chunk {
            session_id: meta.id.clone(),
            chunk_index: 0,
            source_type: SourceType::Session,
            text: "hello world".to_string(),
            token_count: 3,
            quality: 1.0,
            start_ts: 1.0,
            end_ts: 2.0,
            speaker_role: None,
        }];

        store.write_chunks(&meta.id, &chunks).expect("write chunks");
        let first = std::fs::read(store.chunks_path(&meta.id)).expect("read log");
        store.write_chunks(&meta.id, &chunks).expect("rewrite chunks");
        let second = std::fs::read(store.chunks_path(&meta.id)).expect("read log again");
        assert_eq!(first, second);

        assert!(store.has_chunks(&meta.id));
        let loaded = store.read_chunks(&meta.id).expect("read chunks");
        assert_eq!(loaded, chunks);
    }

    #[test]
    fn for_each_chunk_covers_sessions_and_artifacts() {
        let (_dir, store) = test_store();
        let meta = store
            .create_session(CreateSession::new(
                vec!["claude".to_string()],
                "/tmp",
                SessionSource::Hook,
            ))
            .expect("create session");

        let session_chunk = Chunk {
            session_id: meta.id.clone(),
            chunk_index: 0,
            source_type: SourceType::Session,
            text: "session text".to_string(),
            token_count: 3,
            quality: 1.0,
            start_ts: 1.0,
            end_ts: 1.0,
            speaker_role: None,
        };
        let artifact_chunk = Chunk {
            session_id: "agent-session".to_string(),
            chunk_index: 0,
            source_type: SourceType::Plan,
            text: "plan text".to_string(),
            token_count: 3,
            quality: 1.0,
            start_ts: 2.0,
            end_ts: 2.0,
            speaker_role: None,
        };

        store
            .write_chunks(&meta.id, std::slice::from_ref(&session_chunk))
            .expect("write chunks");
        store
            .append_artifact_chunks(std::slice::from_ref(&artifact_chunk))
            .expect("append artifact chunks");

        let all = store.all_chunks().expect("all chunks");
        assert_eq!(all, vec![session_chunk, artifact_chunk]);
    }

    #[test]
    fn hooks_and_import_state_round_trip() {
        let (_dir, store) = test_store();

        let mut hooks = HooksState::default();
        hooks.sessions.insert(
            "agent-uuid".to_string(),
            HookSessionState {
                mb_session_id: "20250101-000000-aaaa".to_string(),
                transcript_path: "/tmp/t.jsonl".to_string(),
                transcript_size: 42,
                last_processed: 100.0,
            },
        );
        store.save_hooks_state(&hooks).expect("save hooks state");
        assert_eq!(store.load_hooks_state(), hooks);

        let mut imports = ImportState::default();
        imports
            .imported
            .insert("uuid-1".to_string(), "20250101-000000-bbbb".to_string());
        imports
            .artifacts
            .insert(artifact_key(SourceType::Todo, "uuid-1", "uuid-1"));
        store.save_import_state(&imports).expect("save import state");
        assert_eq!(store.load_import_state(), imports);
    }

    #[test]
    fn shared_locks_coexist() {
        let (_dir, store) = test_store();
        let first = store.lock_shared().expect("first shared lock");
        let second = store.lock_shared().expect("second shared lock");
        drop(first);
        drop(second);
        let _exclusive = store.lock_exclusive().expect("exclusive after drop");
    }
}
