use std::{
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::core::{
    cancel::CancelSignal,
    traits::launcher::{Launcher, ProcessError, ProcessOutput, ProcessSpec, Termination},
};

#[derive(Debug, Clone)]
enum Behavior {
    Output(ProcessOutput),
    LaunchError,
    Panic,
}

/// Answers every launch with the same canned outcome after `delay`,
/// recording the specs it saw and how many launches overlapped.
#[derive(Debug)]
pub struct LauncherStub {
    behavior: Behavior,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    specs: Mutex<Vec<ProcessSpec>>,
}

impl LauncherStub {
    fn with_behavior(behavior: Behavior, delay: Duration) -> Self {
        Self {
            behavior,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        }
    }

    pub fn new(output: ProcessOutput, delay: Duration) -> Self {
        Self::with_behavior(Behavior::Output(output), delay)
    }

    pub fn exiting(code: i32, stdout: &str, stderr: &str, delay: Duration) -> Self {
        Self::new(
            ProcessOutput {
                termination: Termination::Exited { code },
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                duration: delay,
            },
            delay,
        )
    }

    pub fn failing_launch() -> Self {
        Self::with_behavior(Behavior::LaunchError, Duration::ZERO)
    }

    pub fn panicking() -> Self {
        Self::with_behavior(Behavior::Panic, Duration::ZERO)
    }

    pub fn calls(&self) -> usize {
        self.specs.lock().unwrap().len()
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// Highest number of launches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Launcher for LauncherStub {
    #[tracing::instrument(skip(self, cancel))]
    async fn launch(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, ProcessError> {
        self.specs.lock().unwrap().push(spec.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("Stub launch finished: cancelled={}", cancelled);

        match &self.behavior {
            _ if cancelled => Ok(ProcessOutput {
                termination: Termination::Cancelled,
                stdout: String::new(),
                stderr: String::new(),
                duration: self.delay,
            }),
            Behavior::Output(output) => Ok(output.clone()),
            Behavior::LaunchError => Err(ProcessError::Launch {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            }),
            Behavior::Panic => panic!("launcher stub panicked"),
        }
    }
}
