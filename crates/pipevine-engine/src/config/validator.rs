//! Lenient schema validation for parsed configuration documents.
//!
//! Turns an untrusted `serde_json::Value` into a validated
//! [`Pipeline`] plus diagnostics. Fatal problems (missing ids, duplicate
//! ids, broken graph structure) accumulate as errors; recoverable ones
//! (wrong-typed optional fields) accumulate as warnings and fall back to
//! defaults. The rules are applied in order: document shape, required
//! pipeline fields, optional pipeline fields, per-task checks, triggers,
//! then graph structure.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use pipevine_types::pipeline::{DEFAULT_CONCURRENCY, DEFAULT_RETRY_DELAY_MS};
use pipevine_types::{Pipeline, RetryPolicy, Task, Trigger};

use crate::errors::EngineError;
use crate::graph;

const WEBHOOK_METHODS: [&str; 3] = ["GET", "POST", "PUT"];

/// Outcome of validating one configuration document.
#[derive(Debug)]
pub struct ValidationReport {
    /// The normalized pipeline; `None` only when the document shape is
    /// unusable (no `pipeline` mapping).
    pub pipeline: Option<Pipeline>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// True when validation produced a pipeline and no errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.pipeline.is_some()
    }

    /// Unwrap the pipeline, converting collected errors into
    /// [`EngineError::Validation`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] when any error was recorded or
    /// no pipeline could be built.
    pub fn into_pipeline(self, source_label: &str) -> Result<Pipeline, EngineError> {
        if !self.errors.is_empty() {
            return Err(EngineError::validation(source_label, self.errors));
        }
        self.pipeline.ok_or_else(|| {
            EngineError::validation(
                source_label,
                vec!["document produced no pipeline".to_string()],
            )
        })
    }
}

/// Validate a parsed configuration document.
///
/// `strict` appends every warning to the error list, so documents with
/// warnings fail [`ValidationReport::into_pipeline`]; callers may still
/// elect to run the returned pipeline (`--force`).
#[must_use]
pub fn validate(doc: &Value, source_label: &str, strict: bool) -> ValidationReport {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let Some(section) = doc.get("pipeline").and_then(Value::as_object) else {
        errors.push(format!(
            "{source_label}: document must contain a 'pipeline' mapping"
        ));
        return finish(None, warnings, errors, strict);
    };

    let name = required_string(section, "name", &mut errors);
    let version = required_string(section, "version", &mut errors);
    let description = optional_string(section, "description", &mut warnings);

    let raw_tasks: Vec<Value> = match section.get("tasks") {
        Some(Value::Array(entries)) => entries.clone(),
        Some(_) | None => {
            errors.push("'tasks' must be an array".to_string());
            Vec::new()
        }
    };
    if matches!(section.get("tasks"), Some(Value::Array(a)) if a.is_empty()) {
        warnings.push("pipeline declares no tasks".to_string());
    }

    let concurrency = match section.get("concurrency") {
        None => DEFAULT_CONCURRENCY,
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => n as usize,
            _ => {
                warnings.push(format!(
                    "'concurrency' must be a positive integer, got {value}; using default {DEFAULT_CONCURRENCY}"
                ));
                DEFAULT_CONCURRENCY
            }
        },
    };

    let timeout_ms = match section.get("timeout") {
        None => 0,
        Some(value) => match value.as_u64() {
            Some(n) => n,
            None => {
                warnings.push(format!(
                    "'timeout' must be a non-negative millisecond count, got {value}; treating as unbounded"
                ));
                0
            }
        },
    };

    let env = validate_env(section.get("env"), &mut warnings);
    let tasks = validate_tasks(&raw_tasks, &mut warnings, &mut errors);
    let triggers = validate_triggers(section.get("triggers"), &mut warnings, &mut errors);

    errors.extend(graph::verify(&tasks));

    let pipeline = Pipeline {
        name,
        version,
        description,
        tasks,
        triggers,
        concurrency,
        timeout_ms,
        env,
    };
    finish(Some(pipeline), warnings, errors, strict)
}

fn finish(
    pipeline: Option<Pipeline>,
    warnings: Vec<String>,
    mut errors: Vec<String>,
    strict: bool,
) -> ValidationReport {
    if strict {
        errors.extend(warnings.iter().cloned());
    }
    ValidationReport {
        pipeline,
        warnings,
        errors,
    }
}

fn required_string(
    section: &serde_json::Map<String, Value>,
    field: &str,
    errors: &mut Vec<String>,
) -> String {
    match section.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        _ => {
            errors.push(format!("'{field}' must be a non-empty string"));
            String::new()
        }
    }
}

fn optional_string(
    section: &serde_json::Map<String, Value>,
    field: &str,
    warnings: &mut Vec<String>,
) -> Option<String> {
    match section.get(field) {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            warnings.push(format!("'{field}' must be a string, got {other}; ignoring"));
            None
        }
    }
}

fn validate_env(raw: Option<&Value>, warnings: &mut Vec<String>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    match raw {
        None => {}
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                match value.as_str() {
                    Some(s) => {
                        env.insert(key.clone(), s.to_string());
                    }
                    None => warnings.push(format!(
                        "env entry '{key}' must be a string, got {value}; ignoring"
                    )),
                }
            }
        }
        Some(other) => {
            warnings.push(format!("'env' must be a mapping, got {other}; ignoring"));
        }
    }
    env
}

fn validate_tasks(raw: &[Value], warnings: &mut Vec<String>, errors: &mut Vec<String>) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::with_capacity(raw.len());
    let mut seen: HashSet<String> = HashSet::new();

    for (index, entry) in raw.iter().enumerate() {
        let Some(fields) = entry.as_object() else {
            errors.push(format!("task[{index}] must be a mapping"));
            continue;
        };

        let id = match fields.get("id").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => {
                errors.push(format!("task[{index}]: 'id' must be a non-empty string"));
                continue;
            }
        };
        if !seen.insert(id.clone()) {
            errors.push(format!("task[{index}]: duplicate task id '{id}'"));
            continue;
        }

        let plugin = match fields.get("plugin").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => {
                errors.push(format!(
                    "task '{id}': 'plugin' must be a non-empty string"
                ));
                continue;
            }
        };

        let name = match fields.get("name").and_then(Value::as_str) {
            Some(s) if !s.trim().is_empty() => s.to_string(),
            _ => {
                warnings.push(format!(
                    "task '{id}': missing display name, falling back to id"
                ));
                id.clone()
            }
        };

        let config = match fields.get("config") {
            Some(value @ Value::Object(_)) => value.clone(),
            other => {
                warnings.push(format!(
                    "task '{id}': 'config' {}; treating as empty mapping",
                    if other.is_none() {
                        "is missing".to_string()
                    } else {
                        "is not a mapping".to_string()
                    }
                ));
                Value::Object(serde_json::Map::new())
            }
        };

        let depends_on = match fields.get("dependsOn") {
            None => Vec::new(),
            Some(Value::Array(entries)) => {
                let mut deps = Vec::with_capacity(entries.len());
                for dep in entries {
                    match dep.as_str() {
                        Some(s) => deps.push(s.to_string()),
                        None => errors.push(format!(
                            "task '{id}': 'dependsOn' entries must be strings, got {dep}"
                        )),
                    }
                }
                deps
            }
            Some(other) => {
                errors.push(format!(
                    "task '{id}': 'dependsOn' must be an array, got {other}; treating as empty"
                ));
                Vec::new()
            }
        };

        let retry = validate_retry(&id, fields.get("retry"), warnings);

        let timeout_ms = match fields.get("timeout") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(n) if n > 0 => Some(n),
                _ => {
                    warnings.push(format!(
                        "task '{id}': 'timeout' must be a positive number, got {value}; ignoring"
                    ));
                    None
                }
            },
        };

        // Only the literal `false` disables a task.
        let enabled = !matches!(fields.get("enabled"), Some(Value::Bool(false)));

        tasks.push(Task {
            id,
            name,
            plugin,
            config,
            depends_on,
            retry,
            timeout_ms,
            enabled,
        });
    }
    tasks
}

fn validate_retry(
    task_id: &str,
    raw: Option<&Value>,
    warnings: &mut Vec<String>,
) -> Option<RetryPolicy> {
    let fields = match raw {
        None => return None,
        Some(Value::Object(fields)) => fields,
        Some(other) => {
            warnings.push(format!(
                "task '{task_id}': 'retry' must be a mapping, got {other}; ignoring"
            ));
            return None;
        }
    };

    let attempts = match fields.get("attempts") {
        Some(value) => match value.as_f64() {
            Some(n) => n.floor().max(0.0) as u32,
            None => {
                warnings.push(format!(
                    "task '{task_id}': 'retry.attempts' must be a number, got {value}; ignoring retry"
                ));
                0
            }
        },
        None => 0,
    };
    if attempts == 0 {
        return None;
    }

    let delay_ms = match fields.get("delay") {
        None => DEFAULT_RETRY_DELAY_MS,
        Some(value) => match value.as_f64() {
            Some(n) => n.max(0.0) as u64,
            None => {
                warnings.push(format!(
                    "task '{task_id}': 'retry.delay' must be a number, got {value}; using default"
                ));
                DEFAULT_RETRY_DELAY_MS
            }
        },
    };

    Some(RetryPolicy { attempts, delay_ms })
}

fn validate_triggers(
    raw: Option<&Value>,
    warnings: &mut Vec<String>,
    errors: &mut Vec<String>,
) -> Vec<Trigger> {
    let entries = match raw {
        None => return Vec::new(),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            warnings.push(format!(
                "'triggers' must be an array, got {other}; ignoring"
            ));
            return Vec::new();
        }
    };

    let mut triggers = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let kind = entry.get("type").and_then(Value::as_str);
        let config = entry.get("config").and_then(Value::as_object);
        let (Some(kind), Some(config)) = (kind, config) else {
            warnings.push(format!(
                "trigger[{index}]: must have a string 'type' and mapping 'config'; dropping"
            ));
            continue;
        };

        match kind {
            "cron" => {
                let Some(expression) = config.get("expression").and_then(Value::as_str) else {
                    errors.push(format!(
                        "trigger[{index}]: cron trigger requires an 'expression'"
                    ));
                    continue;
                };
                if expression.split_whitespace().count() != 5 {
                    warnings.push(format!(
                        "trigger[{index}]: cron expression '{expression}' does not have five fields"
                    ));
                }
                let timezone = match config.get("timezone") {
                    None => None,
                    Some(Value::String(tz)) => Some(tz.clone()),
                    Some(other) => {
                        warnings.push(format!(
                            "trigger[{index}]: 'timezone' must be a string, got {other}; ignoring"
                        ));
                        None
                    }
                };
                triggers.push(Trigger::Cron {
                    expression: expression.to_string(),
                    timezone,
                });
            }
            "webhook" => {
                let Some(path) = config.get("path").and_then(Value::as_str) else {
                    errors.push(format!(
                        "trigger[{index}]: webhook trigger requires a 'path'"
                    ));
                    continue;
                };
                let method = config
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("POST")
                    .to_string();
                if !WEBHOOK_METHODS.contains(&method.as_str()) {
                    warnings.push(format!(
                        "trigger[{index}]: webhook method '{method}' is not one of {WEBHOOK_METHODS:?}"
                    ));
                }
                let secret = config
                    .get("secret")
                    .and_then(Value::as_str)
                    .map(String::from);
                triggers.push(Trigger::Webhook {
                    path: path.to_string(),
                    method,
                    secret,
                });
            }
            "manual" => triggers.push(Trigger::Manual),
            other => {
                warnings.push(format!(
                    "trigger[{index}]: unknown trigger type '{other}'; dropping"
                ));
            }
        }
    }
    triggers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_document;
    use serde_json::json;

    fn valid_yaml() -> &'static str {
        r#"
pipeline:
  name: order-sync
  version: "1.0"
  concurrency: 3
  tasks:
    - id: fetch
      name: Fetch orders
      plugin: echo
      config:
        url: https://example.com/orders
    - id: transform
      plugin: echo
      config: {}
      dependsOn: [fetch]
    - id: load
      plugin: echo
      config: {}
      dependsOn: [transform]
      retry:
        attempts: 3
        delay: 250
      timeout: 5000
"#
    }

    fn check(yaml: &str) -> ValidationReport {
        let doc = parse_document(yaml).unwrap();
        validate(&doc, "test", false)
    }

    #[test]
    fn valid_document_passes() {
        let report = check(valid_yaml());
        assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
        let pipeline = report.pipeline.unwrap();
        assert_eq!(pipeline.name, "order-sync");
        assert_eq!(pipeline.concurrency, 3);
        assert_eq!(pipeline.tasks.len(), 3);
        assert_eq!(
            pipeline.tasks[2].retry,
            Some(RetryPolicy {
                attempts: 3,
                delay_ms: 250
            })
        );
        assert_eq!(pipeline.tasks[2].timeout_ms, Some(5000));
    }

    #[test]
    fn missing_pipeline_key_is_fatal() {
        let report = check("other: {}\n");
        assert!(report.pipeline.is_none());
        assert!(report.errors[0].contains("'pipeline' mapping"));
    }

    #[test]
    fn missing_name_and_version_each_error() {
        let report = check("pipeline:\n  tasks: []\n");
        assert!(report.errors.iter().any(|e| e.contains("'name'")));
        assert!(report.errors.iter().any(|e| e.contains("'version'")));
    }

    #[test]
    fn empty_tasks_is_a_warning_not_error() {
        let report = check("pipeline:\n  name: p\n  version: '1'\n  tasks: []\n");
        assert!(report.errors.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("no tasks")));
        assert!(report.pipeline.unwrap().tasks.is_empty());
    }

    #[test]
    fn wrong_typed_concurrency_warns_and_defaults() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  concurrency: lots\n  tasks:\n    - id: a\n      plugin: echo\n      config: {}\n",
        );
        assert!(report.errors.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("'concurrency'")));
        assert_eq!(report.pipeline.unwrap().concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn zero_concurrency_rejected_to_default() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  concurrency: 0\n  tasks:\n    - id: a\n      plugin: echo\n      config: {}\n",
        );
        assert_eq!(report.pipeline.unwrap().concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn task_without_id_is_dropped_with_error() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - plugin: echo\n      config: {}\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("task[0]")));
        assert!(report.pipeline.unwrap().tasks.is_empty());
    }

    #[test]
    fn duplicate_task_id_dropped_with_error() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      plugin: echo\n      config: {}\n    - id: a\n      plugin: echo\n      config: {}\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("duplicate task id 'a'")));
        assert_eq!(report.pipeline.unwrap().tasks.len(), 1);
    }

    #[test]
    fn missing_name_falls_back_to_id_with_warning() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      plugin: echo\n      config: {}\n",
        );
        assert!(report.warnings.iter().any(|w| w.contains("display name")));
        assert_eq!(report.pipeline.unwrap().tasks[0].name, "a");
    }

    #[test]
    fn missing_config_becomes_empty_mapping() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n",
        );
        assert!(report.warnings.iter().any(|w| w.contains("'config'")));
        assert_eq!(report.pipeline.unwrap().tasks[0].config, json!({}));
    }

    #[test]
    fn depends_on_non_array_errors_and_clears() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      dependsOn: a-string\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("'dependsOn'")));
        assert!(report.pipeline.unwrap().tasks[0].depends_on.is_empty());
    }

    #[test]
    fn retry_attempts_floored_and_zero_drops_block() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      retry:\n        attempts: 2.9\n",
        );
        let pipeline = report.pipeline.unwrap();
        assert_eq!(
            pipeline.tasks[0].retry,
            Some(RetryPolicy {
                attempts: 2,
                delay_ms: DEFAULT_RETRY_DELAY_MS
            })
        );

        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      retry:\n        attempts: 0\n        delay: 100\n",
        );
        assert!(report.pipeline.unwrap().tasks[0].retry.is_none());
    }

    #[test]
    fn negative_retry_delay_clamped_to_zero() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      retry:\n        attempts: 1\n        delay: -50\n",
        );
        assert_eq!(
            report.pipeline.unwrap().tasks[0].retry,
            Some(RetryPolicy {
                attempts: 1,
                delay_ms: 0
            })
        );
    }

    #[test]
    fn non_positive_timeout_warns_and_drops() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      timeout: 0\n",
        );
        assert!(report.warnings.iter().any(|w| w.contains("'timeout'")));
        assert!(report.pipeline.unwrap().tasks[0].timeout_ms.is_none());
    }

    #[test]
    fn only_literal_false_disables() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      enabled: false\n    - id: b\n      name: b\n      plugin: echo\n      config: {}\n      dependsOn: [a]\n      enabled: 'no'\n",
        );
        let pipeline = report.pipeline.unwrap();
        assert!(!pipeline.tasks[0].enabled);
        assert!(pipeline.tasks[1].enabled);
    }

    #[test]
    fn cron_trigger_field_count_warning() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n  triggers:\n    - type: cron\n      config:\n        expression: '* * *'\n",
        );
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("does not have five fields")));
        assert_eq!(report.pipeline.unwrap().triggers.len(), 1);
    }

    #[test]
    fn cron_without_expression_errors_and_drops() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n  triggers:\n    - type: cron\n      config: {}\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("'expression'")));
        assert!(report.pipeline.unwrap().triggers.is_empty());
    }

    #[test]
    fn webhook_method_violation_warns() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n  triggers:\n    - type: webhook\n      config:\n        path: /hook\n        method: DELETE\n",
        );
        assert!(report.warnings.iter().any(|w| w.contains("DELETE")));
        assert_eq!(report.pipeline.unwrap().triggers.len(), 1);
    }

    #[test]
    fn unknown_trigger_type_dropped_with_warning() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n  triggers:\n    - type: carrier-pigeon\n      config: {}\n",
        );
        assert!(report.warnings.iter().any(|w| w.contains("carrier-pigeon")));
        assert!(report.pipeline.unwrap().triggers.is_empty());
    }

    #[test]
    fn cycle_produces_errors_naming_tasks() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      dependsOn: [b]\n    - id: b\n      name: b\n      plugin: echo\n      config: {}\n      dependsOn: [a]\n",
        );
        assert!(report.errors.iter().any(|e| e.contains("cycle")));
    }

    #[test]
    fn two_disconnected_roots_error() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n    - id: b\n      name: b\n      plugin: echo\n      config: {}\n",
        );
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("disconnected root")));
    }

    #[test]
    fn unresolved_dependency_names_both_ends() {
        let report = check(
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      name: a\n      plugin: echo\n      config: {}\n      dependsOn: [ghost]\n",
        );
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("'a'") && e.contains("'ghost'")));
    }

    #[test]
    fn strict_mode_promotes_warnings() {
        let yaml =
            "pipeline:\n  name: p\n  version: '1'\n  tasks:\n    - id: a\n      plugin: echo\n      config: {}\n";
        let doc = parse_document(yaml).unwrap();
        let lax = validate(&doc, "test", false);
        assert!(lax.errors.is_empty());
        assert!(!lax.warnings.is_empty());

        let strict = validate(&doc, "test", true);
        assert_eq!(
            strict.errors.len(),
            lax.errors.len() + lax.warnings.len()
        );
        assert!(strict.into_pipeline("test").is_err());
    }

    #[test]
    fn canonical_round_trip_is_idempotent() {
        let report = check(valid_yaml());
        let pipeline = report.pipeline.unwrap();
        let doc = pipeline.to_config_value();
        let second = validate(&doc, "roundtrip", false);
        assert!(second.errors.is_empty(), "errors: {:?}", second.errors);
        assert_eq!(second.pipeline.unwrap(), pipeline);
    }
}
