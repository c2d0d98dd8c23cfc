//! Store schema versioning.
//!
//! `schema_version` lives in `config.json`. Version 1 predates the field;
//! version 2 stamps it and rewrites legacy event logs whose records used the
//! old `stdout`/`stderr` stream names.

use serde_json::Value;
use tracing::info;

use crate::config::CURRENT_SCHEMA_VERSION;
use crate::error::MemoryBankError;
use crate::error::Result;
use crate::storage::Store;

/// Schema version of an existing store; 1 when the field is absent.
pub fn detect_version(store: &Store) -> Result<u32> {
    let raw = std::fs::read_to_string(store.config_path())?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| MemoryBankError::corrupt(store.config_path(), err))?;
    Ok(value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32)
}

/// Run all pending migrations. Returns `(old_version, new_version)`.
pub fn migrate(store: &Store) -> Result<(u32, u32)> {
    let old_version = detect_version(store)?;
    if old_version >= CURRENT_SCHEMA_VERSION {
        return Ok((old_version, old_version));
    }

    let _guard = store.lock_exclusive()?;
    let mut current = old_version;
    if current == 1 {
        migrate_v1_to_v2(store)?;
        current = 2;
    }

    info!("migrated store from v{old_version} to v{current}");
    Ok((old_version, current))
}

/// v1 -> v2: stamp `schema_version` and rename legacy event stream tags.
fn migrate_v1_to_v2(store: &Store) -> Result<()> {
    let raw = std::fs::read_to_string(store.config_path())?;
    let mut value: Value = serde_json::from_str(&raw)
        .map_err(|err| MemoryBankError::corrupt(store.config_path(), err))?;
    if let Some(map) = value.as_object_mut() {
        map.insert("schema_version".to_string(), Value::from(2));
    }
    let mut body = serde_json::to_string_pretty(&value)
        .map_err(|err| MemoryBankError::corrupt(store.config_path(), err))?;
    body.push('\n');
    std::fs::write(store.config_path(), body)?;

    for meta in store.list_sessions()? {
        let events_path = store.root().join("sessions").join(&meta.id).join("events.jsonl");
        if !events_path.exists() {
            continue;
        }
        let raw = std::fs::read_to_string(&events_path)?;
        let mut lines: Vec<String> = Vec::new();
        let mut modified = false;
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut event: Value = serde_json::from_str(trimmed)
                .map_err(|err| MemoryBankError::corrupt(&events_path, err))?;
            if let Some(stream) = event.get("stream").and_then(Value::as_str) {
                let renamed = match stream {
                    "stdout" | "stderr" => Some("out"),
                    "stdin" => Some("in"),
                    _ => None,
                };
                if let Some(renamed) = renamed {
                    event["stream"] = Value::from(renamed);
                    modified = true;
                }
            }
            lines.push(
                serde_json::to_string(&event)
                    .map_err(|err| MemoryBankError::corrupt(&events_path, err))?,
            );
        }
        if modified {
            let tmp = events_path.with_extension("tmp");
            std::fs::write(&tmp, lines.join("\n") + "\n")?;
            std::fs::rename(&tmp, &events_path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionSource;
    use crate::storage::CreateSession;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn current_stores_are_left_alone() {
        let dir = TempDir::new().expect("create temp dir");
        let (_, store) = Store::init(&dir.path().join(".memory-bank")).expect("init store");
        let (old, new) = migrate(&store).expect("migrate");
        assert_eq!(old, CURRENT_SCHEMA_VERSION);
        assert_eq!(new, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn v1_store_is_upgraded_and_events_renamed() {
        let dir = TempDir::new().expect("create temp dir");
        let (_, store) = Store::init(&dir.path().join(".memory-bank")).expect("init store");

        // Rewrite the config without a schema_version, as a v1 store had.
        std::fs::write(
            store.config_path(),
            r#"{"version": "1.0", "ollama": {"base_url": "http://localhost:11434"}}"#,
        )
        .expect("write v1 config");

        let meta = store
            .create_session(CreateSession::new(
                vec!["bash".to_string()],
                "/tmp",
                SessionSource::Pty,
            ))
            .expect("create session");
        let events_path = store
            .root()
            .join("sessions")
            .join(&meta.id)
            .join("events.jsonl");
        std::fs::write(
            &events_path,
            "{\"ts\": 1.0, \"stream\": \"stdout\", \"text\": \"legacy\"}\n",
        )
        .expect("write legacy event");

        assert_eq!(detect_version(&store).expect("detect"), 1);
        let (old, new) = migrate(&store).expect("migrate");
        assert_eq!((old, new), (1, 2));
        assert_eq!(detect_version(&store).expect("detect again"), 2);

        let events = store.read_events(&meta.id).expect("read migrated events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream, crate::models::EventStream::Out);
    }
}
