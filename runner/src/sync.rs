use nix::{
    errno::Errno,
    sys::signal::{killpg, SigSet, Signal},
    unistd::Pid,
};
use parking_lot::FairMutex;
use std::{
    collections::BTreeSet,
    io,
    process::{exit, Child, Command},
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, warn};

/// exit status after an interrupt, 128 + SIGINT
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Process groups that are still alive and must be killed on interrupt.
///
/// Cheap to clone, all clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct LivePids {
    pids: Arc<FairMutex<BTreeSet<i32>>>,
}

/// Removes its pid from the live set when dropped, on every exit path of a run
#[derive(Debug)]
pub struct PidGuard {
    pids: Arc<FairMutex<BTreeSet<i32>>>,
    pid: i32,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        self.pids.lock().remove(&self.pid);
        debug!(pid = self.pid, "Removed from live pids");
    }
}

impl PidGuard {
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl LivePids {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32) -> PidGuard {
        self.pids.lock().insert(pid);
        debug!(pid = pid, "Added to live pids");

        PidGuard {
            pids: self.pids.clone(),
            pid,
        }
    }

    /// Spawn `command` and register its pid under the same lock, so an
    /// interrupt either kills the new group or comes before it exists
    pub fn spawn(&self, command: &mut Command) -> io::Result<(Child, PidGuard)> {
        let mut pids = self.pids.lock();
        let child = command.spawn()?;
        let pid = child.id() as i32;

        pids.insert(pid);
        debug!(pid = pid, "Added to live pids");

        Ok((
            child,
            PidGuard {
                pids: self.pids.clone(),
                pid,
            },
        ))
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.pids.lock().contains(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.pids.lock().is_empty()
    }

    /// SIGKILL every registered process group, returns how many were signalled
    pub fn kill_all(&self) -> usize {
        let pids = self.pids.lock();

        pids.iter()
            .filter(|pid| match kill_group(**pid) {
                Ok(()) => true,
                Err(e) => {
                    warn!(pid = **pid, error = ?e, "Failed to kill process group");
                    false
                }
            })
            .count()
    }
}

/// SIGKILL a process group, a group that is already gone is not an error
pub fn kill_group(pgid: i32) -> Result<(), Errno> {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// signals consumed by the interrupt watcher
pub fn interrupt_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);

    mask
}

/// Block SIGINT/SIGTERM on the calling thread and wait for them on a
/// dedicated thread, which kills every live process group and exits.
///
/// Must be called before any other thread is spawned so the mask is inherited.
/// Children have to unblock the signals again before exec.
pub fn spawn_interrupt_watcher(pids: LivePids) -> Result<JoinHandle<()>, Errno> {
    let mask = interrupt_signals();
    mask.thread_block()?;

    Ok(thread::spawn(move || match mask.wait() {
        Ok(signal) => {
            warn!(signal = ?signal, "Interrupted, killing all running programs");
            let killed = pids.kill_all();
            debug!("Killed {killed} process groups");

            exit(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => error!(error = ?e, "Failed to wait for interrupt signals"),
    }))
}
