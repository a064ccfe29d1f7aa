use std::{fmt, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{constants::NO_EXIT_CODE, core::cancel::CancelSignal};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// A named script argument. Names starting with `-` are flags and are
/// emitted before their value; all other parameters are positional and
/// contribute only their value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ParamValue::Text(value.into()))
    }

    pub fn is_flag(&self) -> bool {
        self.name.starts_with('-')
    }
}

/// Serializes parameters into an argument vector, preserving their order.
pub fn to_args(parameters: &[Parameter]) -> Vec<String> {
    let mut args = Vec::with_capacity(parameters.len() * 2);
    for param in parameters {
        match (param.is_flag(), &param.value) {
            (true, ParamValue::Bool(true)) => args.push(param.name.clone()),
            (true, ParamValue::Bool(false)) => {}
            (true, value) => {
                args.push(param.name.clone());
                args.push(value.to_string());
            }
            (false, value) => args.push(value.to_string()),
        }
    }
    args
}

/// One script call: a script identifier relative to the working directory,
/// its parameters and the caller's cancellation signal.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub script: String,
    pub parameters: Vec<Parameter>,
    pub cancel: CancelSignal,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            parameters: Vec::new(),
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Script name plus parameters, without a cancellation signal. Batch input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptCall {
    pub script: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl ScriptCall {
    pub fn new(script: impl Into<String>, parameters: Vec<Parameter>) -> Self {
        Self {
            script: script.into(),
            parameters,
        }
    }

    pub fn into_request(self, cancel: CancelSignal) -> ExecutionRequest {
        ExecutionRequest {
            script: self.script,
            parameters: self.parameters,
            cancel,
        }
    }
}

/// Why an execution or install did not succeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum Failure {
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("failed to launch {program}: {reason}")]
    Launch { program: String, reason: String },
    #[error("execution timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("process exited with code {code}")]
    NonZeroExit { code: i32 },
    #[error("process exited with code 0 but wrote to stderr")]
    StderrNonEmpty,
    #[error("cancelled while waiting for an execution slot")]
    CancelledWhileQueued,
    #[error("cancelled by caller")]
    Cancelled,
    #[error("package manager is not available: {command}")]
    PackageManagerUnavailable { command: String },
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub script_path: PathBuf,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
    pub interpreter: Option<String>,
    pub failure: Option<Failure>,
}

impl ExecutionResult {
    /// A result for a run that failed before any process produced output.
    pub fn rejected(script_path: PathBuf, failure: Failure) -> Self {
        Self {
            success: false,
            script_path,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: NO_EXIT_CODE,
            duration: Duration::ZERO,
            completed_at: Utc::now(),
            interpreter: None,
            failure: Some(failure),
        }
    }

    /// Captured stderr followed by the failure description, if any.
    pub fn error_message(&self) -> String {
        match (&self.failure, self.stderr.trim_end()) {
            (None, stderr) => stderr.to_string(),
            (Some(failure), "") => failure.to_string(),
            (Some(failure), stderr) => format!("{}\n{}", stderr, failure),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStatistics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub total_execution_time: Duration,
    pub average_execution_time: Duration,
    pub last_execution_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub completed_at: DateTime<Utc>,
    pub interpreter: Option<String>,
}

impl BatchSummary {
    pub fn new(results: &[ExecutionResult], interpreter: Option<String>) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            completed_at: Utc::now(),
            interpreter,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LibraryInstallationOutcome {
    pub success: bool,
    pub installed: Vec<String>,
    pub failed: Vec<String>,
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl LibraryInstallationOutcome {
    pub fn new(installed: Vec<String>, failed: Vec<String>) -> Self {
        let message = if failed.is_empty() {
            format!("Successfully installed all {} libraries", installed.len())
        } else {
            format!(
                "Installed {} libraries, failed to install {} libraries",
                installed.len(),
                failed.len()
            )
        };
        Self {
            success: failed.is_empty(),
            installed,
            failed,
            message,
            completed_at: Utc::now(),
        }
    }

    pub fn all_failed(failed: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            installed: Vec::new(),
            failed,
            message: message.into(),
            completed_at: Utc::now(),
        }
    }
}

/// Program plus base arguments used to reach the package manager,
/// e.g. `python3` + `["-m", "pip"]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PackageManagerCommand {
    pub program: String,
    pub base_args: Vec<String>,
}

impl PackageManagerCommand {
    /// Base arguments followed by `extra`.
    pub fn args_with<I, S>(&self, extra: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args
            .iter()
            .cloned()
            .chain(extra.into_iter().map(Into::into))
            .collect()
    }
}

impl fmt::Display for PackageManagerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.base_args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EnvironmentReport {
    pub is_valid: bool,
    pub message: String,
    pub interpreter: String,
    pub package_manager: PackageManagerCommand,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PackageManagerStatus {
    pub is_available: bool,
    pub message: String,
    pub interpreter: String,
    pub package_manager: PackageManagerCommand,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct InterpreterVersion {
    pub success: bool,
    pub interpreter: String,
    pub version_output: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Raw outcome of a single diagnostic install.
#[derive(Clone, Debug, Serialize)]
pub struct InstallDiagnostic {
    pub success: bool,
    pub message: String,
    pub library: String,
    pub package_manager: PackageManagerCommand,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutorStatus {
    pub is_executing: bool,
    pub active_executions: usize,
    pub statistics: ExecutionStatistics,
    pub interpreter: String,
    pub package_manager: PackageManagerCommand,
    pub checked_at: DateTime<Utc>,
}
