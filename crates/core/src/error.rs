use std::path::PathBuf;

use thiserror::Error;

/// The fixed set of failure kinds the engine can surface to a caller of `run`.
///
/// Construction-time errors (`MalformedDocument`, `UnknownClass`, `CycleDetected`) abort
/// loading; execution-time errors abort the enclosing workflow immediately.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed document at {path}: decoded root is not a mapping")]
    MalformedDocument { path: PathBuf },

    #[error("unknown class '{class}' in document at {path}")]
    UnknownClass { class: String, path: PathBuf },

    #[error("cycle detected while constructing workflow graph at {path}")]
    CycleDetected { path: PathBuf },

    #[error("scatter ambiguous: more than one input port is over-nested ({ports:?})")]
    ScatterAmbiguous { ports: Vec<String> },

    #[error("input port '{port}' is under-nested: declared depth {expected}, supplied depth {actual}")]
    UnderNested {
        port: String,
        expected: usize,
        actual: usize,
    },

    #[error("scatter unsupported on port '{port}': over-nesting of {levels} levels exceeds the single supported level")]
    ScatterUnsupported { port: String, levels: usize },

    #[error("process for node '{node}' failed with exit status {status}")]
    ProcessFailed { node: String, status: String },

    #[error("expression failed: {diagnostic}\nsource:\n{source_text}")]
    ExpressionFailure {
        source_text: String,
        diagnostic: String,
    },
}
