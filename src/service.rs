use std::{collections::HashMap, sync::Arc};

use chrono::Utc;

use crate::{
    config::{ConfigError, ExecutorConfig},
    constants::{LIST_PACKAGES_ARGS, NO_EXIT_CODE, PROBE_TIMEOUT, VERSION_ARG},
    core::{
        batch::BatchCoordinator,
        cancel::CancelSignal,
        domain::{
            BatchSummary, EnvironmentReport, ExecutionRequest, ExecutionResult,
            ExecutionStatistics, ExecutorStatus, InstallDiagnostic, InstalledPackage, InterpreterVersion,
            LibraryInstallationOutcome, PackageManagerStatus, Parameter, ScriptCall,
        },
        installer::LibraryInstaller,
        resolver::EnvironmentResolver,
        scheduler::ExecutionScheduler,
        traits::launcher::{Launcher, ProcessError, ProcessSpec},
    },
    native::launcher::NativeLauncher,
};

#[derive(Debug, thiserror::Error)]
pub enum PackageListError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("package listing did not finish successfully (exit code {code}): {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("unreadable package listing: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Entry point for the web layer: one object wiring resolver, scheduler,
/// batch coordinator and installer around a shared launcher.
#[derive(Debug)]
pub struct ScriptService {
    config: Arc<ExecutorConfig>,
    resolver: Arc<EnvironmentResolver>,
    launcher: Arc<dyn Launcher>,
    scheduler: Arc<ExecutionScheduler>,
    batch: BatchCoordinator,
    installer: LibraryInstaller,
}

impl ScriptService {
    /// Service backed by real OS processes.
    pub fn new(config: ExecutorConfig) -> Result<Self, ConfigError> {
        Self::with_launcher(config, Arc::new(NativeLauncher::new()))
    }

    pub fn with_launcher(
        config: ExecutorConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, ConfigError> {
        let resolver = EnvironmentResolver::new(
            config.interpreter.as_deref(),
            &config.working_dir,
            launcher.clone(),
        );
        Self::from_parts(config, Arc::new(resolver), launcher)
    }

    pub fn from_parts(
        config: ExecutorConfig,
        resolver: Arc<EnvironmentResolver>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self, ConfigError> {
        let config = Arc::new(config);
        let scheduler = Arc::new(ExecutionScheduler::new(
            config.clone(),
            resolver.clone(),
            launcher.clone(),
        )?);
        let installer = LibraryInstaller::new(
            config.clone(),
            resolver.clone(),
            launcher.clone(),
            scheduler.gate(),
        );
        tracing::info!(
            "Script service ready: working_dir={}, max_concurrent={}, timeout={:?}",
            config.working_dir.display(),
            config.max_concurrent,
            config.timeout
        );

        Ok(Self {
            batch: BatchCoordinator::new(scheduler.clone()),
            config,
            resolver,
            launcher,
            scheduler,
            installer,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute_script(
        &self,
        script: &str,
        parameters: Vec<Parameter>,
        cancel: &CancelSignal,
    ) -> ExecutionResult {
        let request = ExecutionRequest::new(script)
            .with_parameters(parameters)
            .with_cancel(cancel.clone());
        self.scheduler.execute(request).await
    }

    /// Results come back in call order.
    pub async fn execute_batch(
        &self,
        calls: Vec<ScriptCall>,
        cancel: &CancelSignal,
    ) -> (Vec<ExecutionResult>, BatchSummary) {
        let results = self.batch.execute_calls(calls, cancel).await;
        let interpreter = results.iter().find_map(|r| r.interpreter.clone());
        let summary = BatchSummary::new(&results, interpreter);
        tracing::info!(
            "Batch finished: {}/{} succeeded",
            summary.successful,
            summary.total
        );
        (results, summary)
    }

    pub async fn install_libraries(
        &self,
        libraries: &[String],
        versions: &HashMap<String, String>,
        extra_options: &[String],
        cancel: &CancelSignal,
    ) -> LibraryInstallationOutcome {
        self.installer
            .install_all(libraries, versions, extra_options, cancel)
            .await
    }

    /// Diagnostic install of a single requirement, reporting the raw exit
    /// code and streams.
    pub async fn diagnose_install(&self, library: &str, cancel: &CancelSignal) -> InstallDiagnostic {
        self.installer.diagnose(library, cancel).await
    }

    pub fn statistics(&self) -> ExecutionStatistics {
        self.scheduler.statistics()
    }

    /// Valid when the interpreter answers `--version` and the working
    /// directory exists.
    pub async fn validate_environment(&self) -> EnvironmentReport {
        let interpreter = self.resolver.resolve().await;
        let package_manager = self.resolver.package_manager().await;

        let interpreter_ok = self.resolver.probe(&interpreter, &[]).await;
        let dir_ok = tokio::fs::metadata(&self.config.working_dir)
            .await
            .is_ok_and(|meta| meta.is_dir());
        let message = match (interpreter_ok, dir_ok) {
            (true, true) => "Environment is properly configured".to_string(),
            (false, _) => format!("Interpreter {} is not runnable", interpreter),
            (true, false) => format!(
                "Working directory {} does not exist",
                self.config.working_dir.display()
            ),
        };
        if !(interpreter_ok && dir_ok) {
            tracing::warn!("Environment validation failed: {}", message);
        }

        EnvironmentReport {
            is_valid: interpreter_ok && dir_ok,
            message,
            interpreter,
            package_manager,
            checked_at: Utc::now(),
        }
    }

    pub async fn status(&self) -> ExecutorStatus {
        let active_executions = self.scheduler.active_executions();
        ExecutorStatus {
            is_executing: active_executions > 0,
            active_executions,
            statistics: self.statistics(),
            interpreter: self.resolver.resolve().await,
            package_manager: self.resolver.package_manager().await,
            checked_at: Utc::now(),
        }
    }

    pub async fn package_manager_status(&self) -> PackageManagerStatus {
        let is_available = self.installer.is_package_manager_available().await;
        let package_manager = self.resolver.package_manager().await;
        PackageManagerStatus {
            is_available,
            message: if is_available {
                format!("{} is available", package_manager)
            } else {
                format!("{} is not available", package_manager)
            },
            interpreter: package_manager.program.clone(),
            package_manager,
            checked_at: Utc::now(),
        }
    }

    pub async fn interpreter_version(&self) -> InterpreterVersion {
        let interpreter = self.resolver.resolve().await;
        let spec = ProcessSpec::new(&interpreter, &self.config.working_dir)
            .args([VERSION_ARG])
            .timeout(PROBE_TIMEOUT)
            .encoding(self.config.output_encoding);

        match self.launcher.launch(&spec, &CancelSignal::never()).await {
            Ok(output) => InterpreterVersion {
                success: output.exited_ok(),
                exit_code: output.exit_code().unwrap_or(NO_EXIT_CODE),
                version_output: output.stdout,
                stderr: output.stderr,
                interpreter,
            },
            Err(e) => InterpreterVersion {
                success: false,
                interpreter,
                version_output: String::new(),
                stderr: e.to_string(),
                exit_code: NO_EXIT_CODE,
            },
        }
    }

    /// Parses `<package manager> list --format=json`.
    pub async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, PackageListError> {
        let pm = self.resolver.package_manager().await;
        let spec = ProcessSpec::new(&pm.program, &self.config.working_dir)
            .args(pm.args_with(LIST_PACKAGES_ARGS))
            .timeout(self.config.timeout)
            .encoding(self.config.output_encoding);

        let output = self.launcher.launch(&spec, &CancelSignal::never()).await?;
        if !output.exited_ok() {
            return Err(PackageListError::Failed {
                code: output.exit_code().unwrap_or(NO_EXIT_CODE),
                stderr: output.stderr.trim_end().to_string(),
            });
        }

        let packages: Vec<InstalledPackage> = serde_json::from_str(output.stdout.trim())?;
        tracing::debug!("{} packages installed", packages.len());
        Ok(packages)
    }

    pub async fn clear_interpreter_cache(&self) {
        self.resolver.clear_cache().await;
    }
}
