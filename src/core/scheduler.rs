use std::{
    panic::AssertUnwindSafe,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use futures::FutureExt;
use uuid::Uuid;

use crate::{
    config::{ConfigError, ExecutorConfig, StderrPolicy},
    constants::NO_EXIT_CODE,
    core::{
        domain::{ExecutionRequest, ExecutionResult, ExecutionStatistics, Failure, to_args},
        gate::ConcurrencyGate,
        resolver::EnvironmentResolver,
        stats::StatsRecorder,
        traits::launcher::{Launcher, ProcessError, ProcessOutput, ProcessSpec, Termination},
    },
};

/// Single admission point for script runs. Owns the concurrency gate and
/// the aggregate statistics; never lets an execution fault escape.
#[derive(Debug)]
pub struct ExecutionScheduler {
    config: Arc<ExecutorConfig>,
    resolver: Arc<EnvironmentResolver>,
    launcher: Arc<dyn Launcher>,
    gate: Arc<ConcurrencyGate>,
    stats: StatsRecorder,
}

impl ExecutionScheduler {
    pub fn new(
        config: Arc<ExecutorConfig>,
        resolver: Arc<EnvironmentResolver>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let gate = ConcurrencyGate::new(config.max_concurrent);
        Ok(Self {
            config,
            resolver,
            launcher,
            gate,
            stats: StatsRecorder::default(),
        })
    }

    pub fn gate(&self) -> Arc<ConcurrencyGate> {
        self.gate.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn active_executions(&self) -> usize {
        self.gate.active()
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        self.stats.snapshot()
    }

    /// Full path of `script` inside the working directory.
    pub fn script_path(&self, script: &str) -> PathBuf {
        self.config.working_dir.join(script)
    }

    #[tracing::instrument(skip(self, request), fields(script = %request.script, execution_id = tracing::field::Empty))]
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let script_path = self.script_path(&request.script);

        if let Err(reason) = self.validate(&request.script, &script_path).await {
            tracing::info!("Rejected script request: {}", reason);
            return ExecutionResult::rejected(script_path, Failure::Validation { reason });
        }

        let slot = match self.gate.admit(&request.cancel).await {
            Ok(slot) => slot,
            Err(failure) => {
                tracing::info!("Not admitted: {}", failure);
                return ExecutionResult::rejected(script_path, failure);
            }
        };
        let record = self.stats.begin();

        let execution_id = Uuid::new_v4();
        tracing::Span::current().record("execution_id", tracing::field::display(execution_id));
        tracing::debug!("Admitted, {} active", self.gate.active());

        let interpreter = self.resolver.resolve().await;
        let spec = ProcessSpec::new(&interpreter, &self.config.working_dir)
            .args([script_path.to_string_lossy().into_owned()])
            .args(to_args(&request.parameters))
            .timeout(self.config.timeout)
            .encoding(self.config.output_encoding);

        let launched = AssertUnwindSafe(self.launcher.launch(&spec, &request.cancel))
            .catch_unwind()
            .await;
        drop(slot);

        let result = match launched {
            Ok(Ok(output)) => self.classify(script_path, &interpreter, output),
            Ok(Err(e)) => failed_launch(script_path, &interpreter, e),
            Err(_) => {
                tracing::error!("Launcher panicked while running {}", spec);
                let mut result = ExecutionResult::rejected(
                    script_path,
                    Failure::Internal {
                        reason: "execution panicked".to_string(),
                    },
                );
                result.interpreter = Some(interpreter);
                result
            }
        };

        record.finish(result.success, result.duration, result.completed_at);
        tracing::info!(
            "Execution finished: success={}, exit_code={}, duration={:?}",
            result.success,
            result.exit_code,
            result.duration
        );
        result
    }

    /// Checks the request without touching the gate.
    async fn validate(&self, script: &str, script_path: &Path) -> Result<(), String> {
        if script.trim().is_empty() {
            return Err("script name is empty".to_string());
        }

        let relative = Path::new(script);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(format!(
                "script {:?} must be a relative path inside the working directory",
                script
            ));
        }

        let expected = self.config.script_extension.trim_start_matches('.');
        let extension_ok = script_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(expected));
        if !extension_ok {
            return Err(format!("script {:?} must have a .{} extension", script, expected));
        }

        let missing = || format!("script {} does not exist", script_path.display());
        let resolved = tokio::fs::canonicalize(script_path)
            .await
            .map_err(|_| missing())?;
        let root = tokio::fs::canonicalize(&self.config.working_dir)
            .await
            .map_err(|e| {
                format!(
                    "working directory {} is not accessible: {}",
                    self.config.working_dir.display(),
                    e
                )
            })?;
        // Symlinks are followed, so the target itself must stay under the root.
        if !resolved.starts_with(&root) {
            return Err(format!(
                "script {:?} resolves outside the working directory",
                script
            ));
        }

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => Ok(()),
            _ => Err(missing()),
        }
    }

    fn classify(
        &self,
        script_path: PathBuf,
        interpreter: &str,
        output: ProcessOutput,
    ) -> ExecutionResult {
        let failure = match output.termination {
            Termination::TimedOut => Some(Failure::Timeout {
                after: self.config.timeout,
            }),
            Termination::Cancelled => Some(Failure::Cancelled),
            Termination::Exited { code } if code != 0 => Some(Failure::NonZeroExit { code }),
            Termination::Exited { .. } => match self.config.stderr_policy {
                StderrPolicy::Strict if !output.stderr.is_empty() => Some(Failure::StderrNonEmpty),
                _ => None,
            },
        };

        ExecutionResult {
            success: failure.is_none(),
            script_path,
            exit_code: output.exit_code().unwrap_or(NO_EXIT_CODE),
            stdout: output.stdout,
            stderr: output.stderr,
            duration: output.duration,
            completed_at: Utc::now(),
            interpreter: Some(interpreter.to_string()),
            failure,
        }
    }
}

fn failed_launch(script_path: PathBuf, interpreter: &str, error: ProcessError) -> ExecutionResult {
    tracing::warn!("Execution failed: {}", error);
    let failure = match error {
        ProcessError::Launch { program, source } => Failure::Launch {
            program,
            reason: source.to_string(),
        },
        other => Failure::Internal {
            reason: other.to_string(),
        },
    };

    let mut result = ExecutionResult::rejected(script_path, failure);
    result.interpreter = Some(interpreter.to_string());
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        core::cancel::{CancelSignal, cancel_pair},
        core::domain::{ParamValue, Parameter},
        core::traits::launcher::MockLauncher,
        stubs::launcher::LauncherStub,
    };

    struct Fixture {
        dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("scriptrunner_{}", Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("job.py"), "print('hi')\n").unwrap();
            std::fs::write(dir.join("notes.txt"), "not a script\n").unwrap();
            Self { dir }
        }

        fn config(&self, max_concurrent: usize) -> Arc<ExecutorConfig> {
            Arc::new(
                ExecutorConfig::new(&self.dir)
                    .with_max_concurrent(max_concurrent)
                    .with_timeout(Duration::from_secs(5)),
            )
        }

        fn scheduler(&self, max_concurrent: usize, launcher: Arc<dyn Launcher>) -> ExecutionScheduler {
            let resolver = Arc::new(
                EnvironmentResolver::new(None, &self.dir, launcher.clone())
                    .with_candidates(Vec::<String>::new())
                    .with_fallback("python3"),
            );
            ExecutionScheduler::new(self.config(max_concurrent), resolver, launcher).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let fixture = Fixture::new();
        let launcher: Arc<dyn Launcher> = Arc::new(LauncherStub::failing_launch());
        let resolver = Arc::new(EnvironmentResolver::new(None, &fixture.dir, launcher.clone()));
        let config = Arc::new(ExecutorConfig::new(&fixture.dir).with_max_concurrent(0));

        let res = ExecutionScheduler::new(config, resolver, launcher);
        assert!(matches!(res, Err(ConfigError::ZeroConcurrency)));
    }

    #[tokio::test]
    async fn test_validation_failures_consume_nothing() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::ZERO));
        let scheduler = fixture.scheduler(1, stub.clone());

        // Hold the only slot: validation must not wait for it.
        let _held = scheduler.gate().admit(&CancelSignal::never()).await.unwrap();

        for script in ["missing.py", "notes.txt", "", "../job.py", "/etc/passwd.py"] {
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                scheduler.execute(ExecutionRequest::new(script)),
            )
            .await
            .expect("validation must not queue behind the gate");

            assert!(!result.success);
            assert_eq!(result.exit_code, -1);
            assert!(
                matches!(result.failure, Some(Failure::Validation { .. })),
                "{:?} for {:?}",
                result.failure,
                script
            );
        }

        assert_eq!(stub.calls(), 0);
        assert_eq!(scheduler.statistics().total, 0);
    }

    #[tokio::test]
    async fn test_builds_interpreter_command() {
        let fixture = Fixture::new();
        let expected_script = fixture.dir.join("job.py").to_string_lossy().into_owned();

        let mut launcher = MockLauncher::new();
        launcher
            .expect_launch()
            .withf(move |spec, _| {
                spec.program == "python3"
                    && spec.args == [expected_script.as_str(), "in.csv", "--limit", "5"]
                    && spec.timeout == Duration::from_secs(5)
            })
            .times(1)
            .returning(|_, _| {
                Ok(ProcessOutput {
                    termination: Termination::Exited { code: 0 },
                    stdout: "ok\n".to_string(),
                    stderr: String::new(),
                    duration: Duration::from_millis(30),
                })
            });

        let scheduler = fixture.scheduler(2, Arc::new(launcher));
        let request = ExecutionRequest::new("job.py").with_parameters(vec![
            Parameter::text("input", "in.csv"),
            Parameter::new("--limit", ParamValue::Integer(5)),
        ]);

        let result = scheduler.execute(request).await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.interpreter.as_deref(), Some("python3"));
        assert_eq!(result.duration, Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_strict_stderr_policy() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "out\n", "warning\n", Duration::ZERO));
        let scheduler = fixture.scheduler(1, stub);

        let result = scheduler.execute(ExecutionRequest::new("job.py")).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.failure, Some(Failure::StderrNonEmpty));
    }

    #[tokio::test]
    async fn test_lenient_stderr_policy() {
        let fixture = Fixture::new();
        let launcher: Arc<dyn Launcher> =
            Arc::new(LauncherStub::exiting(0, "out\n", "warning\n", Duration::ZERO));
        let resolver = Arc::new(
            EnvironmentResolver::new(None, &fixture.dir, launcher.clone())
                .with_candidates(Vec::<String>::new()),
        );
        let config = Arc::new(
            ExecutorConfig::new(&fixture.dir).with_stderr_policy(StderrPolicy::Lenient),
        );
        let scheduler = ExecutionScheduler::new(config, resolver, launcher).unwrap();

        let result = scheduler.execute(ExecutionRequest::new("job.py")).await;
        assert!(result.success);
        assert_eq!(result.stderr, "warning\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_and_launch_failure() {
        let fixture = Fixture::new();

        let scheduler = fixture.scheduler(1, Arc::new(LauncherStub::exiting(2, "", "boom\n", Duration::ZERO)));
        let result = scheduler.execute(ExecutionRequest::new("job.py")).await;
        assert_eq!(result.failure, Some(Failure::NonZeroExit { code: 2 }));
        assert_eq!(result.error_message(), "boom\nprocess exited with code 2");

        let scheduler = fixture.scheduler(1, Arc::new(LauncherStub::failing_launch()));
        let result = scheduler.execute(ExecutionRequest::new("job.py")).await;
        assert!(matches!(result.failure, Some(Failure::Launch { .. })));
        assert_eq!(result.exit_code, -1);
        assert_eq!(scheduler.statistics().failed, 1);
        assert_eq!(scheduler.gate().available(), 1);
    }

    #[tokio::test]
    async fn test_panicking_launch_is_contained() {
        let fixture = Fixture::new();
        let scheduler = fixture.scheduler(1, Arc::new(LauncherStub::panicking()));

        let result = scheduler.execute(ExecutionRequest::new("job.py")).await;
        assert!(matches!(result.failure, Some(Failure::Internal { .. })));
        assert_eq!(scheduler.gate().available(), 1);
        assert_eq!(scheduler.active_executions(), 0);

        let stats = scheduler.statistics();
        assert_eq!((stats.total, stats.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::from_millis(50)));
        let scheduler = Arc::new(fixture.scheduler(3, stub.clone()));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move { scheduler.execute(ExecutionRequest::new("job.py")).await })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        assert_eq!(stub.calls(), 12);
        assert!(stub.peak_in_flight() <= 3);
        assert!(scheduler.gate().peak() <= 3);
        assert_eq!(scheduler.active_executions(), 0);

        let stats = scheduler.statistics();
        assert_eq!(stats.total, 12);
        assert_eq!(stats.total, stats.successful + stats.failed);
        assert_eq!(stats.average_execution_time, stats.total_execution_time / 12);
        assert!(stats.last_execution_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_releases_nothing() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::from_millis(300)));
        let scheduler = Arc::new(fixture.scheduler(1, stub.clone()));

        let running = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.execute(ExecutionRequest::new("job.py")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (handle, signal) = cancel_pair();
        let queued = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .execute(ExecutionRequest::new("job.py").with_cancel(signal))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let queued = queued.await.unwrap();
        assert_eq!(queued.failure, Some(Failure::CancelledWhileQueued));
        assert!(running.await.unwrap().success);

        assert_eq!(stub.calls(), 1);
        assert_eq!(scheduler.gate().available(), 1);
        assert_eq!(scheduler.statistics().total, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_running_releases_slot() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::from_secs(30)));
        let scheduler = Arc::new(fixture.scheduler(1, stub));

        let (handle, signal) = cancel_pair();
        let run = tokio::spawn({
            let scheduler = scheduler.clone();
            async move {
                scheduler
                    .execute(ExecutionRequest::new("job.py").with_cancel(signal))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.active_executions(), 1);
        handle.cancel();

        let result = run.await.unwrap();
        assert_eq!(result.failure, Some(Failure::Cancelled));
        assert_eq!(scheduler.active_executions(), 0);
        assert_eq!(scheduler.gate().available(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_execution_keeps_stats_balanced() {
        let fixture = Fixture::new();
        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::from_secs(5)));
        let scheduler = fixture.scheduler(2, stub.clone());

        let res = tokio::time::timeout(
            Duration::from_millis(100),
            scheduler.execute(ExecutionRequest::new("job.py")),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(stub.calls(), 1);

        let stats = scheduler.statistics();
        assert_eq!((stats.total, stats.successful, stats.failed), (1, 0, 1));
        assert_eq!(stats.total, stats.successful + stats.failed);
        assert_eq!(scheduler.active_executions(), 0);
        assert_eq!(scheduler.gate().available(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_working_dir_is_rejected() {
        let fixture = Fixture::new();
        let outside = std::env::temp_dir().join(format!("scriptrunner_outside_{}.py", Uuid::new_v4()));
        std::fs::write(&outside, "print('escaped')\n").unwrap();
        std::os::unix::fs::symlink(&outside, fixture.dir.join("link.py")).unwrap();
        std::fs::create_dir_all(fixture.dir.join("pkg")).unwrap();
        std::fs::write(fixture.dir.join("pkg/inner.py"), "pass\n").unwrap();
        std::os::unix::fs::symlink(fixture.dir.join("pkg/inner.py"), fixture.dir.join("alias.py"))
            .unwrap();

        let stub = Arc::new(LauncherStub::exiting(0, "", "", Duration::ZERO));
        let scheduler = fixture.scheduler(1, stub.clone());

        let result = scheduler.execute(ExecutionRequest::new("link.py")).await;
        assert!(
            matches!(&result.failure, Some(Failure::Validation { reason }) if reason.contains("outside")),
            "{:?}",
            result.failure
        );
        assert_eq!(stub.calls(), 0);

        // A link that stays inside the working directory is fine.
        let result = scheduler.execute(ExecutionRequest::new("alias.py")).await;
        assert!(result.success, "{:?}", result.failure);
        assert_eq!(stub.calls(), 1);

        let _ = std::fs::remove_file(outside);
    }
}
