//! Configuration document parsing with environment variable substitution.
//!
//! Documents are JSON when the trimmed text starts with `{`, otherwise
//! YAML. Both parse into a `serde_json::Value`; the validator applies the
//! lenient schema rules on top.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error listing every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in ENV_VAR_RE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(val) => {
                result = result.replace(&cap[0], &val);
            }
            Err(_) => {
                missing.push(var_name.to_string());
            }
        }
    }

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(result)
}

/// Parse a configuration document (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the text is neither
/// valid JSON nor valid YAML.
pub fn parse_document(text: &str) -> Result<Value> {
    let substituted = substitute_env_vars(text)?;
    let trimmed = substituted.trim_start();
    if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).context("Failed to parse pipeline JSON")
    } else {
        serde_yaml::from_str(&substituted).context("Failed to parse pipeline YAML")
    }
}

/// Read and parse a configuration document from a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the content cannot be
/// parsed.
pub fn load_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    parse_document(&content)
}
