//! Env-file reading and merge
//!
//! Env files are UTF-8 text, one `KEY=VALUE` per line. Blank lines and lines
//! whose first non-whitespace character is `#` are ignored. A value entirely
//! wrapped in a matching single or double quote pair has the outer pair
//! stripped; no escape processing is performed.

use crate::error::{Result, RuntimeError};
use std::collections::HashMap;
use std::path::Path;

/// Read an env file into a key/value map
///
/// # Errors
///
/// Returns [`RuntimeError::EnvFileRead`] when the file cannot be read.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| RuntimeError::EnvFileRead {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(eq) = line.find('=') else {
            continue;
        };
        if eq == 0 {
            continue;
        }
        let key = line[..eq].trim().to_string();
        let value = strip_quotes(line[eq + 1..].trim());
        vars.insert(key, value.to_string());
    }

    Ok(vars)
}

/// Merge env-file variables with inline variables; inline wins on conflict
pub fn merge_env(
    file_vars: HashMap<String, String>,
    inline: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = file_vars;
    for (key, value) in inline {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
