use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;

use crate::{
    config::ExecutorConfig,
    constants::{
        DISABLE_VERSION_CHECK_FLAG, INSTALL_FLAGS, INSTALL_SUBCOMMAND, NO_EXIT_CODE,
        NO_LIBRARIES_MSG,
    },
    core::{
        cancel::CancelSignal,
        domain::{Failure, InstallDiagnostic, LibraryInstallationOutcome, PackageManagerCommand},
        gate::ConcurrencyGate,
        resolver::EnvironmentResolver,
        traits::launcher::{Launcher, ProcessOutput, ProcessSpec, Termination},
    },
};

/// Installs libraries one by one through the package manager. Each install
/// step holds a slot of the same gate script runs use.
#[derive(Debug)]
pub struct LibraryInstaller {
    config: Arc<ExecutorConfig>,
    resolver: Arc<EnvironmentResolver>,
    launcher: Arc<dyn Launcher>,
    gate: Arc<ConcurrencyGate>,
}

impl LibraryInstaller {
    pub fn new(
        config: Arc<ExecutorConfig>,
        resolver: Arc<EnvironmentResolver>,
        launcher: Arc<dyn Launcher>,
        gate: Arc<ConcurrencyGate>,
    ) -> Self {
        Self {
            config,
            resolver,
            launcher,
            gate,
        }
    }

    pub async fn is_package_manager_available(&self) -> bool {
        let pm = self.resolver.package_manager().await;
        self.resolver.probe(&pm.program, &pm.base_args).await
    }

    /// Installs every library, best effort: one failure does not stop the rest.
    /// `extra_options` are appended verbatim to each install command.
    #[tracing::instrument(skip(self, versions, extra_options, cancel))]
    pub async fn install_all(
        &self,
        libraries: &[String],
        versions: &HashMap<String, String>,
        extra_options: &[String],
        cancel: &CancelSignal,
    ) -> LibraryInstallationOutcome {
        if libraries.is_empty() {
            return LibraryInstallationOutcome::all_failed(Vec::new(), NO_LIBRARIES_MSG);
        }

        let pm = self.resolver.package_manager().await;
        if !self.resolver.probe(&pm.program, &pm.base_args).await {
            let failure = Failure::PackageManagerUnavailable {
                command: pm.to_string(),
            };
            tracing::warn!("{}", failure);
            return LibraryInstallationOutcome::all_failed(libraries.to_vec(), failure.to_string());
        }

        let mut installed = Vec::new();
        let mut failed = Vec::new();
        for library in libraries {
            match self
                .install_one(&pm, library, versions.get(library), extra_options, cancel)
                .await
            {
                Ok(()) => {
                    tracing::info!("Installed {}", library);
                    installed.push(library.clone());
                }
                Err(failure) => {
                    tracing::warn!("Failed to install {}: {}", library, failure);
                    failed.push(library.clone());
                }
            }
        }

        let outcome = LibraryInstallationOutcome::new(installed, failed);
        tracing::info!("Installation completed: {}", outcome.message);
        outcome
    }

    /// One throwaway install of `library` with the package manager's version
    /// check disabled, reporting the raw process outcome.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn diagnose(&self, library: &str, cancel: &CancelSignal) -> InstallDiagnostic {
        let pm = self.resolver.package_manager().await;
        let args = pm.args_with(
            [INSTALL_SUBCOMMAND, library]
                .into_iter()
                .chain(INSTALL_FLAGS)
                .chain([DISABLE_VERSION_CHECK_FLAG]),
        );
        let spec = self.install_spec(&pm, args);
        tracing::info!("Diagnostic install: {}", spec);

        match self.run_step(&spec, cancel).await {
            Ok(output) => InstallDiagnostic {
                success: output.exited_ok(),
                message: if output.exited_ok() {
                    "Test installation successful".to_string()
                } else {
                    "Test installation failed".to_string()
                },
                library: library.to_string(),
                exit_code: output.exit_code().unwrap_or(NO_EXIT_CODE),
                stdout: output.stdout,
                stderr: output.stderr,
                package_manager: pm,
            },
            Err(failure) => InstallDiagnostic {
                success: false,
                message: format!("Test installation error: {}", failure),
                library: library.to_string(),
                exit_code: NO_EXIT_CODE,
                stdout: String::new(),
                stderr: String::new(),
                package_manager: pm,
            },
        }
    }

    async fn install_one(
        &self,
        pm: &PackageManagerCommand,
        library: &str,
        version: Option<&String>,
        extra_options: &[String],
        cancel: &CancelSignal,
    ) -> Result<(), Failure> {
        let spec = self.install_spec(pm, install_args(pm, library, version, extra_options));
        tracing::debug!("Executing: {}", spec);

        let output = self.run_step(&spec, cancel).await?;
        if !output.stderr.is_empty() {
            tracing::debug!("Package manager stderr for {}: {}", library, output.stderr.trim_end());
        }

        // Package managers log to stderr routinely; only the exit code counts.
        match output.exit_code() {
            Some(0) => Ok(()),
            Some(code) => Err(Failure::NonZeroExit { code }),
            None => Err(match output.termination {
                Termination::Cancelled => Failure::Cancelled,
                _ => Failure::Timeout {
                    after: self.config.timeout,
                },
            }),
        }
    }

    fn install_spec(&self, pm: &PackageManagerCommand, args: Vec<String>) -> ProcessSpec {
        ProcessSpec::new(&pm.program, &self.config.working_dir)
            .args(args)
            .timeout(self.config.timeout)
            .encoding(self.config.output_encoding)
            .env("PYTHONPATH", self.config.working_dir.to_string_lossy())
    }

    /// Runs one package-manager process while holding a gate slot. Launch
    /// errors and panics come back as failures.
    async fn run_step(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, Failure> {
        let _slot = self.gate.admit(cancel).await?;

        match AssertUnwindSafe(self.launcher.launch(spec, cancel))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(Failure::Launch {
                program: spec.program.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                tracing::error!("Launcher panicked while running {}", spec);
                Err(Failure::Internal {
                    reason: "install step panicked".to_string(),
                })
            }
        }
    }
}

/// `<base args> install <name>[==<version>] --quiet --user <extra...>`
pub fn install_args(
    pm: &PackageManagerCommand,
    library: &str,
    version: Option<&String>,
    extra_options: &[String],
) -> Vec<String> {
    let package = match version {
        Some(version) => format!("{}=={}", library, version),
        None => library.to_string(),
    };

    pm.args_with(
        [INSTALL_SUBCOMMAND.to_string(), package]
            .into_iter()
            .chain(INSTALL_FLAGS.iter().map(|f| f.to_string()))
            .chain(extra_options.iter().cloned()),
    )
}
