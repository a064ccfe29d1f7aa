use std::{
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    config::OutputEncoding,
    constants::{NO_EXIT_CODE, OUTPUT_DRAIN_GRACE},
    core::{
        cancel::CancelSignal,
        traits::launcher::{ProcessError, ProcessOutput, ProcessSpec, Termination},
    },
};

type SharedBuf = Arc<Mutex<String>>;

/// Runs one child process to completion, timeout or cancellation.
///
/// An executor handles a single execution at a time; a second call while one
/// is in flight fails with [`ProcessError::Busy`] instead of queueing.
/// Concurrency comes from using several executors.
#[derive(Debug, Default)]
pub struct ProcessExecutor {
    busy: AtomicBool,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    #[tracing::instrument(skip(self, cancel), fields(program = %spec.program))]
    pub async fn execute(
        &self,
        spec: &ProcessSpec,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, ProcessError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProcessError::Busy);
        }
        let _guard = BusyGuard(&self.busy);

        tracing::debug!("Spawning: {}", spec);
        let start = Instant::now();
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k, v)))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Launch {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = SharedBuf::default();
        let stderr = SharedBuf::default();
        let mut readers = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_line_reader(out, spec.encoding, stdout.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_line_reader(err, spec.encoding, stderr.clone()));
        }

        let termination = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Termination::Exited {
                    code: status.code().unwrap_or(NO_EXIT_CODE),
                },
                Err(source) => {
                    abort_readers(&readers);
                    return Err(ProcessError::Wait {
                        program: spec.program.clone(),
                        source,
                    });
                }
            },
            _ = tokio::time::sleep(spec.timeout) => Termination::TimedOut,
            _ = cancel.cancelled() => Termination::Cancelled,
        };

        match termination {
            Termination::Exited { code } => {
                tracing::debug!("Process exited with code {}", code);
                drain_readers(readers, OUTPUT_DRAIN_GRACE).await;
            }
            Termination::TimedOut => {
                tracing::warn!("Process timed out after {:?}, killing it", spec.timeout);
                terminate(&mut child).await;
                abort_readers(&readers);
            }
            Termination::Cancelled => {
                tracing::info!("Execution cancelled by caller, killing process");
                terminate(&mut child).await;
                abort_readers(&readers);
            }
        }

        Ok(ProcessOutput {
            termination,
            stdout: take_buf(&stdout),
            stderr: take_buf(&stderr),
            duration: start.elapsed(),
        })
    }
}

/// Best-effort kill. The child may already be gone; that race is not an error.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!("Kill failed, process most likely already exited: {}", e);
    }
}

fn spawn_line_reader<R>(reader: R, encoding: OutputEncoding, buf: SharedBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = encoding.decode(trim_line_ending(&line));
                    let mut buf = buf.lock().unwrap_or_else(|e| e.into_inner());
                    buf.push_str(&text);
                    buf.push('\n');
                }
                Err(e) => {
                    tracing::warn!("Failed to read process output: {}", e);
                    break;
                }
            }
        }
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Waits for the readers to hit EOF, giving up after `grace` (a grandchild
/// holding the pipes open must not stall completion).
async fn drain_readers(readers: Vec<JoinHandle<()>>, grace: Duration) {
    let handles: Vec<_> = readers.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(grace, futures::future::join_all(readers))
        .await
        .is_err()
    {
        tracing::warn!("Output streams still open {:?} after exit", grace);
        handles.iter().for_each(|h| h.abort());
    }
}

fn abort_readers(readers: &[JoinHandle<()>]) {
    readers.iter().for_each(|h| h.abort());
}

fn take_buf(buf: &SharedBuf) -> String {
    std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()))
}
