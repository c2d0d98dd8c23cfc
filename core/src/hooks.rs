//! Stop-hook installation into the host agent's settings file.
//!
//! The agent invokes our handler on every Stop event with a JSON payload on
//! stdin. Install/uninstall edit the `hooks.Stop` array in the agent's
//! `settings.json`, matching our entry by a marker substring so repeated
//! installs stay idempotent.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use serde_json::json;

use crate::error::MemoryBankError;
use crate::error::Result;

/// Substring identifying our hook entry inside the settings file.
pub const HOOK_MARKER: &str = "mb hook";

/// Stdin payload delivered by the host agent on a Stop event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HookPayload {
    pub transcript_path: String,
    pub session_id: String,
    #[serde(default)]
    pub cwd: String,
}

impl HookPayload {
    pub fn parse(raw: &str) -> Option<HookPayload> {
        serde_json::from_str(raw).ok()
    }
}

/// `~/.claude/settings.json` for the current user.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookStatus {
    pub installed: bool,
    pub command: Option<String>,
}

fn read_settings(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|err| MemoryBankError::corrupt(path, err))
}

fn write_settings(path: &Path, settings: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(settings)
        .map_err(|err| MemoryBankError::corrupt(path, err))?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

fn find_hook_index(stop_hooks: &[Value]) -> Option<usize> {
    stop_hooks.iter().position(|entry| {
        entry
            .get("hooks")
            .and_then(Value::as_array)
            .map(|hooks| {
                hooks.iter().any(|hook| {
                    hook.get("command")
                        .and_then(Value::as_str)
                        .map(|cmd| cmd.contains(HOOK_MARKER))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    })
}

/// Install the Stop hook. Returns false when it was already present.
pub fn install(settings_path: &Path, command: &str) -> Result<bool> {
    let mut settings = read_settings(settings_path)?;
    if !settings.is_object() {
        return Err(MemoryBankError::corrupt(
            settings_path,
            "settings root is not an object",
        ));
    }

    let hooks = settings
        .as_object_mut()
        .and_then(|map| {
            map.entry("hooks")
                .or_insert_with(|| json!({}))
                .as_object_mut()
        })
        .ok_or_else(|| MemoryBankError::corrupt(settings_path, "hooks is not an object"))?;
    let stop = hooks
        .entry("Stop")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| MemoryBankError::corrupt(settings_path, "hooks.Stop is not an array"))?;

    if find_hook_index(stop).is_some() {
        return Ok(false);
    }

    stop.push(json!({
        "matcher": "",
        "hooks": [{"type": "command", "command": command}],
    }));
    write_settings(settings_path, &settings)?;
    Ok(true)
}

/// Remove the Stop hook; empty containers are cleaned up. Returns false
/// when no hook was installed.
pub fn uninstall(settings_path: &Path) -> Result<bool> {
    if !settings_path.exists() {
        return Ok(false);
    }
    let mut settings = read_settings(settings_path)?;

    let Some(stop) = settings
        .get_mut("hooks")
        .and_then(|hooks| hooks.get_mut("Stop"))
        .and_then(Value::as_array_mut)
    else {
        return Ok(false);
    };
    let Some(index) = find_hook_index(stop) else {
        return Ok(false);
    };
    stop.remove(index);
    let stop_empty = stop.is_empty();

    if stop_empty
        && let Some(hooks) = settings.get_mut("hooks").and_then(Value::as_object_mut)
    {
        hooks.remove("Stop");
        if hooks.is_empty()
            && let Some(root) = settings.as_object_mut()
        {
            root.remove("hooks");
        }
    }

    write_settings(settings_path, &settings)?;
    Ok(true)
}

pub fn status(settings_path: &Path) -> Result<HookStatus> {
    if !settings_path.exists() {
        return Ok(HookStatus {
            installed: false,
            command: None,
        });
    }
    let settings = read_settings(settings_path)?;
    let Some(stop) = settings
        .get("hooks")
        .and_then(|hooks| hooks.get("Stop"))
        .and_then(Value::as_array)
    else {
        return Ok(HookStatus {
            installed: false,
            command: None,
        });
    };

    let command = find_hook_index(stop).and_then(|index| {
        stop[index]
            .get("hooks")
            .and_then(Value::as_array)
            .and_then(|hooks| {
                hooks.iter().find_map(|hook| {
                    hook.get("command")
                        .and_then(Value::as_str)
                        .filter(|cmd| cmd.contains(HOOK_MARKER))
                        .map(ToString::to_string)
                })
            })
    });

    Ok(HookStatus {
        installed: command.is_some(),
        command,
    })
}
