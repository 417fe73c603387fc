//! Document Loader: resolve a path relative to a parent, decode, normalize, classify by
//! `class`, and instantiate the matching Runnable.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::document::ClassDoc;
use crate::error::EngineError;
use crate::expression::ExpressionTool;
use crate::normalize::normalize;
use crate::process::ProcessTool;
use crate::runnable::Runnable;
use crate::workflow::WorkflowRunnable;

/// Guards against malformed or self-referential workflow documents while they are loaded
/// recursively at construction time. A document already on the stack, or a load that would
/// exceed the configured depth, is reported as `CycleDetected`.
pub(crate) struct LoadContext {
    pub stack: Vec<PathBuf>,
    pub depth: u32,
    pub max_depth: u32,
}

impl LoadContext {
    fn new(max_depth: u32) -> Self {
        Self {
            stack: Vec::new(),
            depth: 0,
            max_depth,
        }
    }
}

pub const DEFAULT_MAX_NESTING_DEPTH: u32 = 64;

/// Resolve `target` relative to `parent`'s directory, if a parent is given and the target
/// is itself relative.
pub fn resolve_path(target: &str, parent: Option<&Path>) -> PathBuf {
    let candidate = Path::new(target);
    match parent {
        Some(parent_path) if candidate.is_relative() => {
            let base = parent_path.parent().unwrap_or(Path::new("."));
            base.join(candidate)
        }
        _ => candidate.to_path_buf(),
    }
}

fn decode(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read document at {}", path.display()))?;
    // YAML is a superset of JSON for the documents this engine accepts; try it first and
    // fall back to a dedicated JSON parse so pure-JSON documents get a JSON-flavored error.
    match serde_yaml::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(yaml_err) => serde_json::from_str::<Value>(&raw).with_context(|| {
            format!(
                "failed to decode document at {}: {}",
                path.display(),
                yaml_err
            )
        }),
    }
}

/// Load a document by path, optionally resolved relative to a parent document's directory.
pub fn load(target: &str, parent: Option<&Path>) -> Result<Runnable> {
    load_with_limit(target, parent, DEFAULT_MAX_NESTING_DEPTH)
}

pub fn load_with_limit(target: &str, parent: Option<&Path>, max_nesting_depth: u32) -> Result<Runnable> {
    let mut ctx = LoadContext::new(max_nesting_depth);
    load_guarded(target, parent, &mut ctx)
}

pub(crate) fn load_guarded(
    target: &str,
    parent: Option<&Path>,
    ctx: &mut LoadContext,
) -> Result<Runnable> {
    let path = resolve_path(target, parent);
    let canonical = fs::canonicalize(&path).unwrap_or_else(|_| path.clone());

    if ctx.stack.contains(&canonical) {
        return Err(EngineError::CycleDetected { path: canonical }.into());
    }
    if ctx.depth >= ctx.max_depth {
        return Err(EngineError::CycleDetected { path: canonical }.into());
    }

    let mut value = decode(&path)?;
    if !value.is_object() {
        return Err(EngineError::MalformedDocument { path }.into());
    }
    normalize(&mut value);

    let class_doc: ClassDoc = serde_json::from_value(value.clone())
        .with_context(|| format!("failed to read 'class' field at {}", path.display()))?;
    let class = class_doc.class.unwrap_or_default();
    debug!(path = %path.display(), class = %class, "loading document");

    match class.as_str() {
        "CommandLineTool" => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("malformed CommandLineTool at {}", path.display()))?;
            Ok(Runnable::Process(ProcessTool::new(doc, path)))
        }
        "ExpressionTool" => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("malformed ExpressionTool at {}", path.display()))?;
            Ok(Runnable::Expression(ExpressionTool::new(doc)))
        }
        "Workflow" => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("malformed Workflow at {}", path.display()))?;
            ctx.stack.push(canonical);
            ctx.depth += 1;
            let built = WorkflowRunnable::build(doc, &path, ctx);
            ctx.depth -= 1;
            ctx.stack.pop();
            Ok(Runnable::Workflow(built?))
        }
        other => Err(EngineError::UnknownClass {
            class: other.to_string(),
            path,
        }
        .into()),
    }
}
