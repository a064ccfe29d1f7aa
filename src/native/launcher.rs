use crate::{
    core::{
        cancel::CancelSignal,
        traits::launcher::{Launcher, ProcessError, ProcessOutput, ProcessSpec},
    },
    native::executor::ProcessExecutor,
};

/// Launches real OS processes, one fresh [`ProcessExecutor`] per call.
#[derive(Clone, Debug, Default)]
pub struct NativeLauncher;

impl NativeLauncher {
    pub fn new() -> Self {
        NativeLauncher
    }
}

#[async_trait::async_trait]
impl Launcher for NativeLauncher {
    async fn launch(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, ProcessError> {
        ProcessExecutor::new().execute(spec, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_parallel_launches_use_separate_executors() {
        let launcher = Arc::new(NativeLauncher::new());
        let spec = ProcessSpec::new("sh", std::env::temp_dir()).args(["-c", "sleep 0.2; echo done"]);

        let never = CancelSignal::never();
        let (a, b) = tokio::join!(launcher.launch(&spec, &never), launcher.launch(&spec, &never));

        assert_eq!(a.unwrap().stdout, "done\n");
        assert_eq!(b.unwrap().stdout, "done\n");
    }
}
