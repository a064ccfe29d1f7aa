use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Serialize;

use crate::constants::{DEFAULT_MAX_CONCURRENT, DEFAULT_SCRIPT_EXTENSION, DEFAULT_TIMEOUT};

pub const ENV_INTERPRETER: &str = "SCRIPTRUNNER_INTERPRETER";
pub const ENV_WORKDIR: &str = "SCRIPTRUNNER_WORKDIR";
pub const ENV_TIMEOUT_SECS: &str = "SCRIPTRUNNER_TIMEOUT_SECS";
pub const ENV_MAX_CONCURRENT: &str = "SCRIPTRUNNER_MAX_CONCURRENT";
pub const ENV_ENCODING: &str = "SCRIPTRUNNER_ENCODING";
pub const ENV_STDERR_POLICY: &str = "SCRIPTRUNNER_STDERR_POLICY";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max concurrent executions must be greater than 0")]
    ZeroConcurrency,
    #[error("timeout must be greater than 0")]
    ZeroTimeout,
    #[error("script extension must not be empty")]
    EmptyExtension,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Text decoding applied to every captured output line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum OutputEncoding {
    /// UTF-8, invalid sequences replaced with U+FFFD.
    #[default]
    Utf8,
    /// ISO-8859-1: every byte maps to the code point of the same value.
    Latin1,
}

impl OutputEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            OutputEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            OutputEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

impl FromStr for OutputEncoding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf8" | "utf-8" => Ok(OutputEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(OutputEncoding::Latin1),
            _ => Err(()),
        }
    }
}

/// Decides whether a script that exits 0 but writes to stderr succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum StderrPolicy {
    /// Success needs exit code 0 and an empty error stream.
    #[default]
    Strict,
    /// Success needs exit code 0 only.
    Lenient,
}

impl FromStr for StderrPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(StderrPolicy::Strict),
            "lenient" => Ok(StderrPolicy::Lenient),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutorConfig {
    pub interpreter: Option<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub output_encoding: OutputEncoding,
    pub max_concurrent: usize,
    pub script_extension: String,
    pub stderr_policy: StderrPolicy,
}

impl ExecutorConfig {
    pub fn new<T: AsRef<Path>>(working_dir: T) -> Self {
        Self {
            interpreter: None,
            working_dir: working_dir.as_ref().into(),
            timeout: DEFAULT_TIMEOUT,
            output_encoding: OutputEncoding::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            script_extension: DEFAULT_SCRIPT_EXTENSION.to_string(),
            stderr_policy: StderrPolicy::default(),
        }
    }

    /// Defaults overlaid with `SCRIPTRUNNER_*` environment variables.
    /// The working directory falls back to the process's current directory.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with variables read through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let working_dir = match lookup(ENV_WORKDIR) {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
            _ => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        let mut config = Self::new(working_dir);

        if let Some(interpreter) = lookup(ENV_INTERPRETER) {
            if !interpreter.trim().is_empty() {
                config.interpreter = Some(interpreter.trim().to_string());
            }
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_TIMEOUT_SECS)? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, ENV_MAX_CONCURRENT)? {
            config.max_concurrent = max;
        }
        if let Some(encoding) = parse_var::<OutputEncoding, _>(&lookup, ENV_ENCODING)? {
            config.output_encoding = encoding;
        }
        if let Some(policy) = parse_var::<StderrPolicy, _>(&lookup, ENV_STDERR_POLICY)? {
            config.stderr_policy = policy;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_output_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.output_encoding = encoding;
        self
    }

    pub fn with_script_extension(mut self, extension: impl Into<String>) -> Self {
        self.script_extension = extension.into();
        self
    }

    pub fn with_stderr_policy(mut self, policy: StderrPolicy) -> Self {
        self.stderr_policy = policy;
        self
    }

    /// Setup-time mutation hook. Once the config is handed to a service it is frozen.
    pub fn configure<F: FnOnce(&mut Self)>(mut self, f: F) -> Self {
        f(&mut self);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.script_extension.trim_start_matches('.').is_empty() {
            return Err(ConfigError::EmptyExtension);
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(None),
    }
}
