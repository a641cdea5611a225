use std::path::Path;

use anyhow::{Context, Result};

use pipevine_types::Pipeline;

/// Execute the `visualize` command: emit a Mermaid diagram of the DAG.
pub fn execute(config_path: &Path, output: Option<&Path>) -> Result<()> {
    let pipeline = super::load_pipeline(config_path, false, false)?;
    let diagram = mermaid(&pipeline);
    match output {
        Some(path) => {
            std::fs::write(path, &diagram)
                .with_context(|| format!("Failed to write diagram to {}", path.display()))?;
            tracing::info!(path = %path.display(), "diagram written");
        }
        None => print!("{diagram}"),
    }
    Ok(())
}

/// Render the task graph as a Mermaid `graph TD` block.
fn mermaid(pipeline: &Pipeline) -> String {
    let mut out = String::from("graph TD\n");
    for task in &pipeline.tasks {
        let label = task.name.replace('"', "'");
        out.push_str(&format!("    {}[\"{}\"]\n", task.id, label));
        if !task.enabled {
            out.push_str(&format!("    class {} disabled\n", task.id));
        }
    }
    for task in &pipeline.tasks {
        for dep in &task.depends_on {
            out.push_str(&format!("    {} --> {}\n", dep, task.id));
        }
    }
    if pipeline.tasks.iter().any(|t| !t.enabled) {
        out.push_str("    classDef disabled stroke-dasharray: 5 5\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipevine_types::Task;
    use serde_json::json;

    #[test]
    fn mermaid_lists_nodes_and_edges() {
        let pipeline = Pipeline {
            name: "p".into(),
            version: "1".into(),
            description: None,
            tasks: vec![
                Task {
                    id: "a".into(),
                    name: "Fetch \"raw\" data".into(),
                    plugin: "echo".into(),
                    config: json!({}),
                    depends_on: vec![],
                    retry: None,
                    timeout_ms: None,
                    enabled: true,
                },
                Task {
                    id: "b".into(),
                    name: "b".into(),
                    plugin: "echo".into(),
                    config: json!({}),
                    depends_on: vec!["a".into()],
                    retry: None,
                    timeout_ms: None,
                    enabled: false,
                },
            ],
            triggers: vec![],
            concurrency: 5,
            timeout_ms: 0,
            env: Default::default(),
        };
        let diagram = mermaid(&pipeline);
        assert!(diagram.starts_with("graph TD\n"));
        assert!(diagram.contains("a[\"Fetch 'raw' data\"]"));
        assert!(diagram.contains("a --> b"));
        assert!(diagram.contains("class b disabled"));
    }
}
