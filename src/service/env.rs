//! `KEY=value` environment files
//!
//! Services read these at start time (systemd `EnvironmentFile=`, sourced by
//! openrc scripts). The same format is used by `/etc/os-release`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::{Error, Result};

/// Parse `KEY=value` lines, skipping comments and blank lines
///
/// Values may be wrapped in single or double quotes. Double-quoted values
/// honor `\"` and `\\` escapes.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].to_string();
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    value.to_string()
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '$' | '#' | '`'))
}

/// Render variables as sorted `KEY=value` lines
pub fn render_env(vars: &BTreeMap<String, String>) -> String {
    vars.iter()
        .map(|(key, value)| {
            if needs_quoting(value) {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("{}=\"{}\"\n", key, escaped)
            } else {
                format!("{}={}\n", key, value)
            }
        })
        .collect()
}

/// Merge `vars` into the environment file at `path`
///
/// Existing keys not present in `vars` are kept; keys in `vars` win.
/// Parent directories are created as needed.
pub async fn write_env_file(path: &Path, vars: &BTreeMap<String, String>) -> Result<()> {
    let display = path.display().to_string();

    let mut merged = match tokio::fs::read_to_string(path).await {
        Ok(existing) => parse_env(&existing),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(Error::env_file(&display, e.to_string())),
    };
    merged.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::env_file(&display, e.to_string()))?;
    }
    tokio::fs::write(path, render_env(&merged))
        .await
        .map_err(|e| Error::env_file(&display, e.to_string()))
}
