//! Single-job supervisor.
//!
//! `JobService` runs at most one runner process at a time. The runner is
//! spawned in its own process group; a blocking pump thread feeds its output
//! through the result protocol while the supervising task waits for exit and
//! settles the final status. All job state sits behind one mutex.

use super::buffer::DEFAULT_LOG_CAPACITY;
use super::executor::Executor;
use super::job::{JobRecord, JobSnapshot, JobStatus};
use super::process::{self, ChildHandle, Signal};
use super::protocol::{self, Line, RunResult};
use serde::Serialize;
use std::io::{self, BufRead, BufReader, PipeReader, Write};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("failed to serialize job configuration: {0}")]
    ConfigSerialization(#[source] serde_json::Error),
    #[error("failed to write job configuration: {0}")]
    ConfigWrite(#[source] io::Error),
    #[error("failed to spawn runner: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to wait for runner: {0}")]
    Wait(#[source] io::Error),
    #[error("job service must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Tunables for the job service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Log lines retained per job
    pub max_log_lines: usize,
    /// Wait after SIGTERM before escalating to SIGKILL
    pub grace_period: Duration,
    /// Wait after SIGKILL before giving up
    pub kill_wait: Duration,
    /// Bound on waiting for the log pump once the runner has exited
    pub pump_join_timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_log_lines: DEFAULT_LOG_CAPACITY,
            grace_period: Duration::from_secs(10),
            kill_wait: Duration::from_secs(2),
            pump_join_timeout: Duration::from_secs(2),
        }
    }
}

/// How the runner ended, as seen by the supervisor
enum Outcome {
    Exited(ExitStatus),
    /// Cancelled before the runner was spawned
    CancelledBeforeSpawn,
}

struct Inner {
    state: Mutex<JobRecord>,
    status_tx: watch::Sender<JobStatus>,
    executor: Arc<dyn Executor>,
    options: JobOptions,
    runtime: tokio::runtime::Handle,
}

/// Cloneable handle to the job service; clones share the same job.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("status", &self.status())
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl JobService {
    /// Create an idle service bound to the current Tokio runtime.
    pub fn new(executor: Arc<dyn Executor>, options: JobOptions) -> Result<Self, JobError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| JobError::NoRuntime)?;
        let (status_tx, _) = watch::channel(JobStatus::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(JobRecord::idle(options.max_log_lines)),
                status_tx,
                executor,
                options,
                runtime,
            }),
        })
    }

    /// Start a job for `config`.
    ///
    /// Returns `false`, touching nothing, if a job is already running.
    /// Otherwise the previous job's logs, result and error are discarded and
    /// the runner is launched in the background; every later failure ends up
    /// in [`JobService::error`] with status `Failed`.
    pub fn start<C: Serialize + ?Sized>(&self, config: &C) -> bool {
        let payload = serde_json::to_vec_pretty(config).map_err(JobError::ConfigSerialization);

        let job_id = Uuid::new_v4();
        {
            let mut state = self.lock();
            if state.status == JobStatus::Running {
                return false;
            }
            *state = JobRecord::running(job_id, self.inner.options.max_log_lines);
            self.inner.status_tx.send_replace(JobStatus::Running);
        }

        tracing::info!("Job {} started", job_id);
        let service = self.clone();
        self.inner
            .runtime
            .spawn(async move { service.supervise(job_id, payload).await });
        true
    }

    /// Best-effort cancellation of the running job and its whole process group.
    ///
    /// Sends SIGTERM, waits up to the grace period, then SIGKILL. Never fails;
    /// OS errors other than "already gone" are recorded as log lines.
    pub async fn cancel(&self) {
        let (job_id, handle) = {
            let mut state = self.lock();
            if state.status != JobStatus::Running {
                return;
            }
            state.cancel_requested = true;
            (state.id, state.child.clone())
        };
        let Some(job_id) = job_id else { return };
        tracing::info!("Cancellation requested for job {}", job_id);

        // Without a handle the runner is not spawned yet; the supervisor
        // terminates it once it is registered.
        if let Some(handle) = handle {
            self.terminate_group(job_id, handle).await;
        }
    }

    /// SIGTERM, grace period, SIGKILL, final wait.
    async fn terminate_group(&self, job_id: Uuid, mut handle: ChildHandle) {
        if let Err(e) = handle.signal_group(Signal::Terminate) {
            self.cancel_fault(job_id, &handle, Signal::Terminate, e);
            return;
        }
        if handle.wait_exited(self.inner.options.grace_period).await {
            return;
        }

        tracing::warn!(
            "Job {} did not exit within {:?} of SIGTERM, sending SIGKILL",
            job_id,
            self.inner.options.grace_period
        );
        if let Err(e) = handle.signal_group(Signal::Kill) {
            self.cancel_fault(job_id, &handle, Signal::Kill, e);
            return;
        }
        if !handle.wait_exited(self.inner.options.kill_wait).await {
            self.push_log(
                job_id,
                format!(
                    "Error during cancellation: process group {} still alive after SIGKILL",
                    handle.pid()
                ),
            );
        }
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// All retained log lines, or at most the `last_n` most recent, oldest first.
    pub fn logs(&self, last_n: Option<usize>) -> Vec<String> {
        let state = self.lock();
        match last_n {
            Some(n) => state.logs.last_n(n),
            None => state.logs.to_vec(),
        }
    }

    /// Log lines appended after the first `seq` lines of this job, plus the
    /// sequence number to pass next time.
    ///
    /// Lines already evicted from the buffer are skipped.
    pub fn logs_since(&self, seq: u64) -> (Vec<String>, u64) {
        self.lock().logs_since(seq)
    }

    /// Output location reported by a successful runner
    pub fn result(&self) -> Option<String> {
        self.lock().result.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.lock().snapshot()
    }

    /// Resolve once no job is running, returning the settled status.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.inner.status_tx.subscribe();
        let settled = rx
            .wait_for(|status| *status != JobStatus::Running)
            .await
            .map(|status| *status);
        settled.unwrap_or_else(|_| self.status())
    }

    fn lock(&self) -> MutexGuard<'_, JobRecord> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the record if it still belongs to `job_id`.
    fn with_job<T>(&self, job_id: Uuid, f: impl FnOnce(&mut JobRecord) -> T) -> Option<T> {
        let mut state = self.lock();
        if state.id == Some(job_id) {
            Some(f(&mut state))
        } else {
            None
        }
    }

    fn push_log(&self, job_id: Uuid, line: String) {
        self.with_job(job_id, |record| record.push_log(line));
    }

    fn cancel_fault(&self, job_id: Uuid, handle: &ChildHandle, signal: Signal, err: io::Error) {
        if process::is_already_gone(&err) {
            tracing::debug!("Process group {} already gone before {}", handle.pid(), signal);
            return;
        }
        tracing::warn!(
            "Failed to send {} to process group {}: {}",
            signal,
            handle.pid(),
            err
        );
        self.push_log(job_id, format!("Error during cancellation: {err}"));
    }

    async fn supervise(self, job_id: Uuid, payload: Result<Vec<u8>, JobError>) {
        match self.run(job_id, payload).await {
            Ok(outcome) => self.settle(job_id, outcome),
            Err(e) => {
                tracing::error!("Job {} failed: {}", job_id, e);
                self.fail(job_id, e.to_string());
            }
        }
    }

    async fn run(&self, job_id: Uuid, payload: Result<Vec<u8>, JobError>) -> Result<Outcome, JobError> {
        // Removed when dropped, whichever way this function returns.
        let config_file = write_config(&payload?)?;

        if self.cancel_requested(job_id) {
            return Ok(Outcome::CancelledBeforeSpawn);
        }

        let command = self.inner.executor.command(config_file.path());
        tracing::debug!(
            "Job {} runner: {}",
            job_id,
            self.inner.executor.describe(config_file.path())
        );
        let mut spawned = process::spawn_in_group(command).map_err(JobError::Spawn)?;
        let handle = spawned.handle();
        let cancelled_meanwhile = self
            .with_job(job_id, |record| {
                record.child = Some(handle.clone());
                record.cancel_requested
            })
            .unwrap_or(true);
        if cancelled_meanwhile {
            let service = self.clone();
            self.inner
                .runtime
                .spawn(async move { service.terminate_group(job_id, handle).await });
        }

        let pump = spawned.take_output().map(|output| {
            let service = self.clone();
            tokio::task::spawn_blocking(move || service.pump_logs(job_id, output))
        });

        let exit = spawned.wait().await.map_err(JobError::Wait)?;
        self.with_job(job_id, |record| record.child = None);

        if let Some(pump) = pump {
            if tokio::time::timeout(self.inner.options.pump_join_timeout, pump)
                .await
                .is_err()
            {
                tracing::warn!(
                    "Log pump for job {} still running after {:?}; trailing output may be lost",
                    job_id,
                    self.inner.options.pump_join_timeout
                );
            }
        }

        Ok(Outcome::Exited(exit))
    }

    fn cancel_requested(&self, job_id: Uuid) -> bool {
        self.with_job(job_id, |record| record.cancel_requested)
            .unwrap_or(true)
    }

    /// Read the runner's combined output until EOF.
    fn pump_logs(&self, job_id: Uuid, output: PipeReader) {
        let mut reader = BufReader::new(output);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Log pump for job {} stopped: {}", job_id, e);
                    break;
                }
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);

            let line_kind = protocol::classify_line(line);
            let accepted = self.with_job(job_id, |record| {
                // A settled record is final; output from lingering grandchildren is discarded.
                if record.status != JobStatus::Running {
                    return false;
                }
                match line_kind {
                    Line::Result(RunResult::Success { output_dir }) => {
                        record.result = Some(output_dir)
                    }
                    Line::Result(RunResult::Error { message }) => record.error = Some(message),
                    Line::Malformed => {}
                    Line::Plain => record.push_log(line.to_string()),
                }
                true
            });
            if accepted != Some(true) {
                break;
            }
        }
    }

    fn settle(&self, job_id: Uuid, outcome: Outcome) {
        let settled = self.with_job(job_id, |record| {
            if record.status != JobStatus::Running {
                return None;
            }
            let status = match outcome {
                _ if record.cancel_requested => JobStatus::Cancelled,
                Outcome::CancelledBeforeSpawn => JobStatus::Cancelled,
                Outcome::Exited(exit) if exit.success() => JobStatus::Completed,
                Outcome::Exited(exit) => {
                    if record.error.is_none() {
                        record.error = Some(exit_message(exit));
                    }
                    JobStatus::Failed
                }
            };
            record.finish(status);
            self.inner.status_tx.send_replace(status);
            Some(status)
        });

        if let Some(Some(status)) = settled {
            tracing::info!("Job {} finished: {}", job_id, status);
        }
    }

    fn fail(&self, job_id: Uuid, message: String) {
        self.with_job(job_id, |record| {
            if record.status != JobStatus::Running {
                return;
            }
            record.error = Some(message);
            record.finish(JobStatus::Failed);
            self.inner.status_tx.send_replace(JobStatus::Failed);
        });
    }
}

fn write_config(payload: &[u8]) -> Result<tempfile::NamedTempFile, JobError> {
    let mut file = tempfile::Builder::new()
        .prefix("quantflow_config_")
        .suffix(".json")
        .tempfile()
        .map_err(JobError::ConfigWrite)?;
    file.write_all(payload).map_err(JobError::ConfigWrite)?;
    file.flush().map_err(JobError::ConfigWrite)?;
    Ok(file)
}

fn exit_message(exit: ExitStatus) -> String {
    if let Some(code) = exit.code() {
        return format!("Process exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = exit.signal() {
            return format!("Process terminated by signal {signal}");
        }
    }
    format!("Process exited abnormally ({exit})")
}
