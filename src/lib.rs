//! Bounded-concurrency runner for interpreter scripts and package installs.
//!
//! Every script run and install step is one child process admitted through a
//! shared [`core::gate::ConcurrencyGate`]. Anticipated failures come back as
//! result values; only invalid configuration is reported as an error.

pub mod config;
pub mod constants;
pub mod core;
pub mod native;
pub mod service;

#[cfg(test)]
mod stubs;

pub use config::{ConfigError, ExecutorConfig, OutputEncoding, StderrPolicy};
pub use crate::core::{
    cancel::{CancelHandle, CancelSignal, cancel_pair},
    domain::{
        BatchSummary, ExecutionRequest, ExecutionResult, ExecutionStatistics, Failure,
        LibraryInstallationOutcome, ParamValue, Parameter, ScriptCall,
    },
};
pub use service::ScriptService;
