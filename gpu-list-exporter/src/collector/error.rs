use std::time::Duration;

use thiserror::Error;

/// Cycle-local collection failure. The poll loop logs it and moves on.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("failed to read CSV output: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed process row {line}: expected 9 fields, found {fields}")]
    MalformedRow { line: usize, fields: usize },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}
