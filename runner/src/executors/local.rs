use super::{ApplicationIdSource, ExecutorError, RunLimits, RunResult, RunState};
use crate::{
    metrics::{Master, MetricsCollector, PerfMetrics, ProcessHandle},
    sync::{interrupt_signals, kill_group, LivePids},
};
use parking_lot::Mutex;
use std::{
    fmt,
    io::{self, Read},
    mem,
    os::unix::process::CommandExt,
    process::{Command, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};

/// how long `yarn application -kill` may take before the local kill goes ahead
const REMOTE_KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Kills the process group when dropped while still armed, so an error or
/// panic in the middle of a run never leaves the program behind
struct GroupKiller {
    pgid: i32,
    armed: bool,
}

impl Drop for GroupKiller {
    fn drop(&mut self) {
        if self.armed {
            warn!(pid = self.pgid, "Run failed, killing process group");

            if let Err(e) = kill_group(self.pgid) {
                error!(pid = self.pgid, error = ?e, "Failed to kill process group");
            }
        }
    }
}

/// Output stream read on its own thread, readable while the program runs
struct Captured {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Captured {
    fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let shared = buffer.clone();

        let reader = thread::spawn(move || {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 8192];

            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(read) => shared.lock().extend_from_slice(&chunk[..read]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = ?e, "Failed to read program output");
                        break;
                    }
                }
            }
        });

        Self { buffer, reader }
    }

    /// everything read so far
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// wait for the end of the stream
    fn join(self) -> Result<String, ExecutorError> {
        self.reader.join().map_err(|_| ExecutorError::OutputLost)?;
        let bytes = mem::take(&mut *self.buffer.lock());

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Runs commands through `/bin/sh` on this machine while sampling them
pub struct LocalExecutor {
    collector: MetricsCollector,
    limits: RunLimits,
    pids: LivePids,
    state: RunState,
    application_ids: Option<Box<dyn ApplicationIdSource>>,
}

impl fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("collector", &self.collector)
            .field("limits", &self.limits)
            .field("pids", &self.pids)
            .field("state", &self.state)
            .field("application_ids", &self.application_ids.is_some())
            .finish()
    }
}

impl LocalExecutor {
    pub fn new(collector: MetricsCollector, limits: RunLimits, pids: LivePids) -> Self {
        Self {
            collector,
            limits,
            pids,
            state: RunState::NotStarted,
            application_ids: None,
        }
    }

    /// Where the remote application id of a YARN run comes from. Without one,
    /// a YARN run cannot be measured or killed remotely.
    pub fn with_application_id_source(mut self, source: impl ApplicationIdSource + 'static) -> Self {
        self.application_ids = Some(Box::new(source));
        self
    }

    /// state the last run ended in
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn limits(&self) -> &RunLimits {
        &self.limits
    }

    pub fn master(&self) -> Master {
        self.collector.master()
    }

    fn command(&self, command: &str) -> Command {
        let mut shell = Command::new("/bin/sh");
        let memory_limit = self.limits.memory_limit;

        shell
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own group, so the whole tree can be killed at once
            .process_group(0);

        // SAFETY: only async signal safe calls (pthread_sigmask, setrlimit) between fork and exec
        unsafe {
            shell.pre_exec(move || {
                // the interrupt watcher blocks these in the parent
                interrupt_signals().thread_unblock().map_err(io::Error::from)?;

                if let Some(bytes) = memory_limit {
                    let limit = nix::libc::rlimit {
                        rlim_cur: bytes as nix::libc::rlim_t,
                        rlim_max: bytes as nix::libc::rlim_t,
                    };

                    if nix::libc::setrlimit(nix::libc::RLIMIT_AS, &limit) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        shell
    }

    fn find_application_id(&mut self, handle: &mut ProcessHandle, stdout: &str, stderr: &str) {
        if handle.application_id.is_some() || self.collector.master() != Master::Yarn {
            return;
        }

        if let Some(source) = self.application_ids.as_mut() {
            handle.application_id = source.application_id(stdout, stderr);

            if let Some(ref application_id) = handle.application_id {
                info!(pid = handle.pid, application_id = %application_id, "Found YARN application");
            }
        }
    }

    /// kill the remote application first (if any), then the local group
    fn kill(&self, handle: &ProcessHandle) {
        if self.collector.master() == Master::Yarn {
            if handle.application_id.is_none() {
                warn!(
                    pid = handle.pid,
                    "YARN application id unknown, only killing the local process group"
                );
            } else if !self.collector.kill_remote(handle, REMOTE_KILL_TIMEOUT) {
                warn!(pid = handle.pid, "Failed to kill the YARN application");
            }
        }

        if let Err(e) = kill_group(handle.pid) {
            error!(pid = handle.pid, error = ?e, "Failed to kill process group");
        }
    }

    /// Run a command until it exits or its time limit is hit
    #[instrument(skip(self), level = "info")]
    pub fn run(&mut self, command: &str) -> Result<RunResult, ExecutorError> {
        let result = self.run_program(command);

        self.state = match result {
            Ok(ref result) if result.timed_out => RunState::TimedOut,
            Ok(_) => RunState::Completed,
            Err(_) => RunState::Failed,
        };

        result
    }

    fn run_program(&mut self, command: &str) -> Result<RunResult, ExecutorError> {
        let started = Instant::now();
        let mut shell = self.command(command);
        // the guard removes the pid again on every way out of this function
        let (mut child, _registered) = self.pids.spawn(&mut shell).map_err(ExecutorError::Spawn)?;
        let pid = child.id() as i32;
        let mut killer = GroupKiller {
            pgid: pid,
            armed: true,
        };
        let mut handle = ProcessHandle::new(pid);

        let stdout = Captured::drain(child.stdout.take());
        let stderr = Captured::drain(child.stderr.take());

        info!(pid = pid, "Started program");
        self.collector.start(&handle);
        self.state = RunState::Running;

        let mut timed_out = false;
        let status = loop {
            // blocks for one sample interval
            self.collector.update(&handle, self.limits.sample_interval);

            if handle.application_id.is_none() && self.application_ids.is_some() {
                self.find_application_id(&mut handle, &stdout.text(), &stderr.text());
            }

            if let Some(limit) = self.limits.time_limit {
                if started.elapsed() > limit {
                    info!(pid = pid, "Time limit of {limit:?} exceeded, killing program");
                    timed_out = true;
                    self.kill(&handle);

                    break child.wait().map_err(ExecutorError::Wait)?;
                }
            }

            if let Some(status) = child.try_wait().map_err(ExecutorError::Wait)? {
                break status;
            }
        };

        // background children of the shell still hold the output pipes
        if let Err(e) = kill_group(pid) {
            warn!(pid = pid, error = ?e, "Failed to kill leftover processes");
        }
        killer.armed = false;

        let elapsed = started.elapsed();
        let stdout = stdout.join()?;
        let stderr = stderr.join()?;
        self.find_application_id(&mut handle, &stdout, &stderr);

        let metrics = match self.collector.get_perf_metrics(&handle) {
            Ok(metrics) => metrics,
            // a timeout is a result, not an error, even without usage numbers
            Err(e) if timed_out => {
                warn!(pid = pid, error = %e, "No metrics for the timed out run");

                PerfMetrics {
                    elapsed,
                    ..Default::default()
                }
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            pid = pid,
            status = %status,
            elapsed = ?elapsed,
            "Program finished"
        );

        Ok(RunResult {
            time: if timed_out {
                f64::INFINITY
            } else {
                elapsed.as_secs_f64()
            },
            timed_out,
            return_code: status.code(),
            stdout,
            stderr,
            metrics,
        })
    }
}
