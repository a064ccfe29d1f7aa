use std::{panic::AssertUnwindSafe, path::PathBuf, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::sync::Mutex;

use crate::{
    constants::{
        FALLBACK_INTERPRETER, INTERPRETER_CANDIDATES, PACKAGE_MANAGER_MODULE_ARGS, PROBE_TIMEOUT,
        VERSION_ARG,
    },
    core::{
        cancel::CancelSignal,
        domain::PackageManagerCommand,
        traits::launcher::{Launcher, ProcessSpec},
    },
};

#[derive(Debug, Default)]
struct InterpreterCache {
    path: Option<String>,
    resolved: bool,
}

/// Finds a working interpreter by probing candidates with `--version` and
/// caches the winner. Concurrent first-time callers share a single probe run.
#[derive(Debug)]
pub struct EnvironmentResolver {
    candidates: Vec<String>,
    fallback: String,
    working_dir: PathBuf,
    probe_timeout: Duration,
    launcher: Arc<dyn Launcher>,
    cache: Mutex<InterpreterCache>,
}

impl EnvironmentResolver {
    /// `preferred` is tried before the built-in candidate list.
    pub fn new(
        preferred: Option<&str>,
        working_dir: impl Into<PathBuf>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(preferred) = preferred {
            candidates.push(preferred.to_string());
        }
        for candidate in INTERPRETER_CANDIDATES {
            if !candidates.iter().any(|c| c == candidate) {
                candidates.push(candidate.to_string());
            }
        }

        Self {
            candidates,
            fallback: FALLBACK_INTERPRETER.to_string(),
            working_dir: working_dir.into(),
            probe_timeout: PROBE_TIMEOUT,
            launcher,
            cache: Mutex::new(InterpreterCache::default()),
        }
    }

    pub fn with_candidates<I, S>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.candidates = candidates.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Returns the cached interpreter, probing candidates on first use.
    /// Never fails: with no working candidate the fallback name is cached and
    /// the first real execution reports the missing interpreter.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self) -> String {
        // Held across probing so racing callers wait for the first one.
        let mut cache = self.cache.lock().await;
        if cache.resolved {
            if let Some(path) = &cache.path {
                return path.clone();
            }
        }

        let path = match self.probe_candidates().await {
            Some(path) => {
                tracing::info!("Using interpreter: {}", path);
                path
            }
            None => {
                tracing::warn!(
                    "No interpreter answered {} among {:?}, falling back to {}",
                    VERSION_ARG,
                    self.candidates,
                    self.fallback
                );
                self.fallback.clone()
            }
        };

        cache.path = Some(path.clone());
        cache.resolved = true;
        path
    }

    /// Forgets the cached interpreter so the next [`resolve`](Self::resolve) probes again.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.lock().await;
        cache.path = None;
        cache.resolved = false;
        tracing::debug!("Interpreter cache cleared");
    }

    pub async fn package_manager(&self) -> PackageManagerCommand {
        PackageManagerCommand {
            program: self.resolve().await,
            base_args: PACKAGE_MANAGER_MODULE_ARGS
                .iter()
                .map(|a| a.to_string())
                .collect(),
        }
    }

    /// Runs `program args... --version` with the short probe timeout.
    pub async fn probe(&self, program: &str, args: &[String]) -> bool {
        let spec = ProcessSpec::new(program, &self.working_dir)
            .args(args.iter().cloned())
            .args([VERSION_ARG])
            .timeout(self.probe_timeout);

        let never = CancelSignal::never();
        let launched = AssertUnwindSafe(self.launcher.launch(&spec, &never))
            .catch_unwind()
            .await;
        let Ok(launched) = launched else {
            tracing::warn!("Probe {} panicked", spec);
            return false;
        };

        match launched {
            Ok(output) if output.exited_ok() => true,
            Ok(output) => {
                tracing::debug!("Probe {} failed: {:?}", spec, output.termination);
                false
            }
            Err(e) => {
                tracing::debug!("Probe {} failed: {}", spec, e);
                false
            }
        }
    }

    async fn probe_candidates(&self) -> Option<String> {
        for candidate in &self.candidates {
            if self.probe(candidate, &[]).await {
                return Some(candidate.clone());
            }
        }
        None
    }
}
