use std::path::Path;

use anyhow::Result;

use pipevine_engine::config::{parser, validator};

/// Execute the `validate` command: parse and report diagnostics.
pub fn execute(config_path: &Path, strict: bool, json: bool) -> Result<()> {
    let label = config_path.display().to_string();
    let doc = parser::load_document(config_path)?;
    let report = validator::validate(&doc, &label, strict);
    let valid = report.is_valid();

    if json {
        let body = serde_json::json!({
            "valid": valid,
            "pipeline": report.pipeline.as_ref().map(|p| p.name.clone()),
            "warnings": report.warnings,
            "errors": report.errors,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        for warning in &report.warnings {
            println!("warning: {warning}");
        }
        for error in &report.errors {
            println!("error: {error}");
        }
        match &report.pipeline {
            Some(pipeline) if valid => println!(
                "'{label}' is valid: pipeline '{}' with {} task(s)",
                pipeline.name,
                pipeline.tasks.len()
            ),
            _ => println!("'{label}' is invalid ({} error(s))", report.errors.len()),
        }
    }

    if valid {
        Ok(())
    } else {
        anyhow::bail!("validation failed for '{label}'")
    }
}
