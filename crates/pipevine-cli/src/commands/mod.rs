pub mod run;
pub mod schedule;
pub mod validate;
pub mod visualize;

use std::path::Path;

use anyhow::{Context, Result};

use pipevine_engine::config::{parser, validator};
use pipevine_types::Pipeline;

/// Parse and validate a configuration file, logging diagnostics.
///
/// Errors fail the load unless `force` is set; warnings are logged either
/// way.
pub fn load_pipeline(config_path: &Path, strict: bool, force: bool) -> Result<Pipeline> {
    let label = config_path.display().to_string();
    let doc = parser::load_document(config_path)?;
    let report = validator::validate(&doc, &label, strict);

    for warning in &report.warnings {
        tracing::warn!("{warning}");
    }
    for error in &report.errors {
        tracing::error!("{error}");
    }
    if !report.errors.is_empty() {
        if !force {
            anyhow::bail!(
                "validation failed for '{label}' with {} error(s)",
                report.errors.len()
            );
        }
        tracing::warn!("proceeding despite validation errors (--force)");
    }
    report
        .pipeline
        .with_context(|| format!("'{label}' produced no pipeline"))
}
