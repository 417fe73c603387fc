//! Process Executor (`CLTool._run`): build argv, run a process in a fresh working
//! directory, and collect outputs via glob bindings or a tool-authored `result.cwl.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::document::ToolDoc;
use crate::error::EngineError;
use crate::value::{bare_name, file_handle, file_handle_path};

#[derive(Debug)]
pub struct ProcessTool {
    pub doc: ToolDoc,
    pub origin: PathBuf,
}

struct Argv {
    argv: Vec<String>,
    stdin: Option<String>,
    stdout: Option<String>,
}

impl ProcessTool {
    pub fn new(doc: ToolDoc, origin: PathBuf) -> Self {
        Self { doc, origin }
    }

    fn node_label(&self) -> String {
        self.origin.display().to_string()
    }

    pub fn run(&mut self, inputs: Map<String, Value>) -> Result<Map<String, Value>> {
        let job = build_job_record(&inputs);
        let Argv { argv, stdin, stdout } = build_argv(&self.doc, &job);
        let command_line = compose_command_line(&argv, stdin.as_deref(), stdout.as_deref());
        debug!(cmd = %command_line, "process executor command line");

        let work_dir = tempfile::Builder::new()
            .prefix("cwl-job-")
            .tempdir()
            .context("failed to create a fresh working directory for process execution")?;

        let job_path = work_dir.path().join("job.cwl.json");
        fs::write(&job_path, serde_json::to_vec_pretty(&job)?)
            .with_context(|| format!("failed to write job record to {}", job_path.display()))?;

        // Spawned with an explicit working directory rather than a global chdir, so
        // concurrent process invocations on the same host never race on cwd (see §5).
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(&command_line)
            .current_dir(work_dir.path())
            .status()
            .with_context(|| format!("failed to spawn process for '{}'", self.node_label()))?;

        if !status.success() {
            return Err(EngineError::ProcessFailed {
                node: self.node_label(),
                status: status.to_string(),
            }
            .into());
        }

        let result_path = work_dir.path().join("result.cwl.json");
        if result_path.exists() {
            let raw = fs::read_to_string(&result_path)
                .with_context(|| format!("failed to read {}", result_path.display()))?;
            let decoded: Value = serde_json::from_str(&raw)
                .with_context(|| format!("failed to decode {}", result_path.display()))?;
            return decoded.as_object().cloned().ok_or_else(|| {
                anyhow::anyhow!(
                    "result.cwl.json at {} must decode to a mapping",
                    result_path.display()
                )
            });
        }

        collect_output_bindings(&self.doc, work_dir.path())
    }
}

fn build_job_record(inputs: &Map<String, Value>) -> Value {
    json!({
        "inputs": Value::Object(inputs.clone()),
        "allocatedResources": { "cpu": 1, "mem": 2048 },
    })
}

/// Build argv by appending `baseCmd`/`arguments` with tokens bound from `job.inputs` via each
/// declared `inputBindings` entry (§4.5 step 2), ordered by `position` (ties keep declaration
/// order).
fn build_argv(doc: &ToolDoc, job: &Value) -> Argv {
    let mut argv: Vec<String> = doc
        .base_cmd
        .iter()
        .chain(doc.arguments.iter())
        .map(value_to_token)
        .collect();

    let job_inputs = job.get("inputs").and_then(Value::as_object);

    let mut bindings: Vec<(i64, usize, &crate::document::InputBindingDoc)> = doc
        .input_bindings
        .iter()
        .enumerate()
        .map(|(seq, binding)| (binding.position, seq, binding))
        .collect();
    bindings.sort_by_key(|(position, seq, _)| (*position, *seq));

    for (_, _, binding) in bindings {
        let value = job_inputs
            .and_then(|m| m.get(&binding.input))
            .cloned()
            .unwrap_or(Value::Null);
        if value.is_null() {
            continue;
        }
        if let Some(prefix) = &binding.prefix {
            argv.push(prefix.clone());
        }
        match value.as_array() {
            Some(elements) => argv.extend(elements.iter().map(input_value_to_token)),
            None => argv.push(input_value_to_token(&value)),
        }
    }

    Argv {
        argv,
        stdin: None,
        stdout: None,
    }
}

fn value_to_token(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a job input value as a command-line token: a File handle contributes its path,
/// everything else goes through `value_to_token`.
fn input_value_to_token(value: &Value) -> String {
    match file_handle_path(value) {
        Some(path) => path.to_string_lossy().into_owned(),
        None => value_to_token(value),
    }
}

fn shell_quote(token: &str) -> String {
    if !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        token.to_string()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}

fn compose_command_line(argv: &[String], stdin: Option<&str>, stdout: Option<&str>) -> String {
    let mut line = argv
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ");
    if let Some(stdin) = stdin {
        line.push_str(" < ");
        line.push_str(&shell_quote(stdin));
    }
    if let Some(stdout) = stdout {
        line.push_str(" > ");
        line.push_str(&shell_quote(stdout));
    }
    line
}

fn collect_output_bindings(doc: &ToolDoc, work_dir: &Path) -> Result<Map<String, Value>> {
    let mut result = Map::new();
    for out in &doc.outputs {
        let Some(binding) = out.effective_output_binding() else {
            continue;
        };
        let Some(pattern) = binding.glob.as_deref() else {
            continue;
        };

        let glob_pattern = work_dir.join(pattern);
        let glob_pattern_str = glob_pattern.to_string_lossy().into_owned();
        let mut matches: Vec<PathBuf> = glob::glob(&glob_pattern_str)
            .with_context(|| format!("invalid glob pattern '{pattern}'"))?
            .filter_map(|entry| entry.ok())
            .collect();
        matches.sort();

        let name = bare_name(&out.id).to_string();

        if out.declares_file_type() {
            if let Some(first) = matches.first() {
                let absolute = fs::canonicalize(first).unwrap_or_else(|_| first.clone());
                result.insert(name, file_handle(&absolute));
            }
        } else if out.declares_file_array_type() {
            let handles = matches
                .iter()
                .map(|m| {
                    let absolute = fs::canonicalize(m).unwrap_or_else(|_| m.clone());
                    file_handle(&absolute)
                })
                .collect();
            result.insert(name, Value::Array(handles));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shell_quote_leaves_simple_tokens_bare() {
        assert_eq!(shell_quote("echo"), "echo");
        assert_eq!(shell_quote("-n"), "-n");
        assert_eq!(shell_quote("a/b.txt"), "a/b.txt");
    }

    #[test]
    fn shell_quote_escapes_whitespace_and_metacharacters() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn compose_command_line_appends_redirections() {
        let argv = vec!["cat".to_string(), "a b".to_string()];
        let line = compose_command_line(&argv, Some("in.txt"), Some("out.txt"));
        assert_eq!(line, "cat 'a b' < in.txt > out.txt");
    }

    #[test]
    fn build_argv_binds_job_inputs_by_position_and_prefix() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["grep"],
            "inputBindings": [
                {"input": "pattern", "position": 2},
                {"input": "flag", "position": 1, "prefix": "-c"}
            ],
            "outputs": []
        }))
        .unwrap();
        let mut inputs = Map::new();
        inputs.insert("pattern".to_string(), json!("needle"));
        inputs.insert("flag".to_string(), json!(true));
        let job = build_job_record(&inputs);
        let argv = build_argv(&doc, &job);
        assert_eq!(argv.argv, vec!["grep", "-c", "true", "needle"]);
    }

    #[test]
    fn build_argv_renders_file_handle_inputs_as_their_path() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["cat"],
            "inputBindings": [{"input": "file", "position": 0}],
            "outputs": []
        }))
        .unwrap();
        let mut inputs = Map::new();
        inputs.insert("file".to_string(), file_handle(Path::new("/tmp/in.txt")));
        let job = build_job_record(&inputs);
        let argv = build_argv(&doc, &job);
        assert_eq!(argv.argv, vec!["cat", "/tmp/in.txt"]);
    }

    #[test]
    fn build_argv_skips_bindings_for_absent_inputs() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["echo"],
            "inputBindings": [{"input": "missing", "position": 0}],
            "outputs": []
        }))
        .unwrap();
        let argv = build_argv(&doc, &build_job_record(&Map::new()));
        assert_eq!(argv.argv, vec!["echo"]);
    }

    #[test]
    fn build_job_record_matches_documented_shape() {
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(1));
        let job = build_job_record(&inputs);
        assert_eq!(
            job,
            json!({"inputs": {"x": 1}, "allocatedResources": {"cpu": 1, "mem": 2048}})
        );
    }

    #[test]
    fn run_writes_job_record_and_fails_on_nonzero_exit() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["false"],
            "outputs": []
        }))
        .unwrap();
        let mut tool = ProcessTool::new(doc, PathBuf::from("/tmp/fail-tool.json"));
        let err = tool.run(Map::new()).unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[test]
    fn run_collects_file_output_via_glob_binding() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["sh", "-c", "echo hello > output.txt"],
            "outputs": [{
                "id": "#output",
                "type": "File",
                "outputBinding": {"glob": "output.txt"}
            }]
        }))
        .unwrap();
        let mut tool = ProcessTool::new(doc, PathBuf::from("/tmp/passthrough-tool.json"));
        let result = tool.run(Map::new()).unwrap();
        let handle = result.get("output").expect("output port populated");
        let path = crate::value::file_handle_path(handle).expect("file handle");
        assert_eq!(path.file_name().unwrap(), "output.txt");
    }

    #[test]
    fn run_prefers_result_cwl_json_over_bindings() {
        let doc: ToolDoc = serde_json::from_value(json!({
            "baseCmd": ["sh", "-c", "echo '{\"result\": {\"answer\": 42}}' > result.cwl.json"],
            "outputs": [{
                "id": "#ignored",
                "type": "File",
                "outputBinding": {"glob": "*.never"}
            }]
        }))
        .unwrap();
        let mut tool = ProcessTool::new(doc, PathBuf::from("/tmp/self-describing-tool.json"));
        let result = tool.run(Map::new()).unwrap();
        assert_eq!(result.get("result"), Some(&json!({"answer": 42})));
    }
}
