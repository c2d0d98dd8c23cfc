//! Global, per-OS-user registry of Memory Bank projects. Enables
//! cross-project search without scanning the filesystem.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::storage::now_ts;

const REGISTRY_FILE: &str = "projects.json";
const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub root: String,
    #[serde(default)]
    pub registered_at: f64,
    #[serde(default)]
    pub last_import_at: Option<f64>,
    #[serde(default)]
    pub session_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

fn default_version() -> u32 {
    REGISTRY_VERSION
}

/// Handle to the registry directory. Tests point it at a temp dir; the CLI
/// uses [`Registry::for_current_user`].
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
}

impl Registry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.memory-bank/` for the current user, when a home directory exists.
    pub fn for_current_user() -> Option<Registry> {
        dirs::home_dir().map(|home| Registry::new(home.join(".memory-bank")))
    }

    fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn read(&self) -> RegistryDocument {
        let Ok(raw) = std::fs::read_to_string(self.path()) else {
            return RegistryDocument::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Atomic write through a temp file and rename.
    fn write(&self, doc: &RegistryDocument) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut body = serde_json::to_string_pretty(doc)
            .map_err(|err| crate::error::MemoryBankError::corrupt(self.path(), err))?;
        body.push('\n');
        let tmp = self.dir.join(format!("{REGISTRY_FILE}.tmp"));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.path())?;
        Ok(())
    }

    /// Register a project root. Idempotent; an existing entry keeps its
    /// stats.
    pub fn register(&self, project_root: &Path) -> Result<ProjectEntry> {
        let root = normalize_root(project_root);
        let mut doc = self.read();

        if let Some(entry) = doc.projects.iter().find(|p| p.root == root) {
            return Ok(entry.clone());
        }

        let entry = ProjectEntry {
            root,
            registered_at: now_ts(),
            last_import_at: None,
            session_count: 0,
        };
        doc.projects.push(entry.clone());
        self.write(&doc)?;
        Ok(entry)
    }

    pub fn list(&self) -> Result<Vec<ProjectEntry>> {
        Ok(self.read().projects)
    }

    /// Remove a project; returns false when it was not registered.
    pub fn remove(&self, project_root: &Path) -> Result<bool> {
        let root = normalize_root(project_root);
        let mut doc = self.read();
        let before = doc.projects.len();
        doc.projects.retain(|p| p.root != root);
        if doc.projects.len() == before {
            return Ok(false);
        }
        self.write(&doc)?;
        Ok(true)
    }

    /// Stamp import stats for a project, registering it if needed.
    pub fn update_stats(&self, project_root: &Path, session_count: u64) -> Result<()> {
        let root = normalize_root(project_root);
        let mut doc = self.read();

        match doc.projects.iter_mut().find(|p| p.root == root) {
            Some(entry) => {
                entry.last_import_at = Some(now_ts());
                entry.session_count = session_count;
            }
            None => {
                doc.projects.push(ProjectEntry {
                    root,
                    registered_at: now_ts(),
                    last_import_at: Some(now_ts()),
                    session_count,
                });
            }
        }
        self.write(&doc)
    }
}

fn normalize_root(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn register_list_remove_round_trip() {
        let home = TempDir::new().expect("create temp dir");
        let project = TempDir::new().expect("create project dir");
        let registry = Registry::new(home.path().join(".memory-bank"));

        let entry = registry.register(project.path()).expect("register");
        assert_eq!(entry.session_count, 0);

        // Idempotent.
        registry.register(project.path()).expect("re-register");
        assert_eq!(registry.list().expect("list").len(), 1);

        assert!(registry.remove(project.path()).expect("remove"));
        assert!(!registry.remove(project.path()).expect("remove again"));
        assert!(registry.list().expect("list").is_empty());
    }

    #[test]
    fn update_stats_registers_missing_projects() {
        let home = TempDir::new().expect("create temp dir");
        let project = TempDir::new().expect("create project dir");
        let registry = Registry::new(home.path().join(".memory-bank"));

        registry
            .update_stats(project.path(), 7)
            .expect("update stats");
        let entries = registry.list().expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_count, 7);
        assert!(entries[0].last_import_at.is_some());
    }

    #[test]
    fn corrupt_registry_resets_to_empty() {
        let home = TempDir::new().expect("create temp dir");
        let dir = home.path().join(".memory-bank");
        std::fs::create_dir_all(&dir).expect("create registry dir");
        std::fs::write(dir.join(REGISTRY_FILE), "not json").expect("write garbage");

        let registry = Registry::new(&dir);
        assert!(registry.list().expect("list").is_empty());
    }
}
