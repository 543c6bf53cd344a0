//! Shared protocol and configuration types.

use serde::{Deserialize, Serialize};

/// Structured error describing a failure of the user's process, carried on
/// the wire as `application/vnd.rundev.procError+json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcError {
    /// What went wrong (build failure, start failure, port timeout).
    pub message: String,
    /// Captured process output, so the developer can read the actual error.
    pub output: String,
}

/// A command line as an argv vector: `["go", "build", "./..."]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cmd(pub Vec<String>);

impl Cmd {
    /// The program to execute; empty string when the vector is empty.
    pub fn command(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments following the program, if any.
    pub fn args(&self) -> &[String] {
        if self.0.len() <= 1 {
            &[]
        } else {
            &self.0[1..]
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// A rebuild step, optionally conditioned on which files changed.
///
/// When `on` is non-empty, the daemon skips the command unless one of the
/// paths touched by a patch matches one of the patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCmd {
    /// The command to run, in the sync directory.
    pub c: Cmd,
    /// File patterns gating the command; empty means "always run".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<String>,
}
