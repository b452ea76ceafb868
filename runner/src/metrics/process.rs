use super::{MetricsError, PerfMetrics};
use std::{
    collections::{BTreeMap, BTreeSet},
    thread,
    time::{Duration, Instant},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, trace};

const BYTES_PER_MEGABYTE: f64 = (1024 * 1024) as f64;

#[derive(Debug, Clone, Copy)]
struct Accumulated {
    byte_seconds: f64,
    vcore_seconds: f64,
    started: Instant,
    samples: u64,
}

/// Samples resident memory and cpu usage of local processes and their
/// children, keyed by the pid of the launched shell
#[derive(Debug)]
pub struct ProcessMetrics {
    system: System,
    cpu_count: usize,
    tracked: BTreeMap<i32, Accumulated>,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            cpu_count: num_cpus::get(),
            tracked: BTreeMap::new(),
        }
    }

    fn refresh(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
    }

    /// Resident bytes and cpu percent of `pid` and all of its descendants.
    /// A process that is already gone reads as zero.
    fn sample(&self, pid: i32) -> (u64, f32) {
        let root = Pid::from_u32(pid as u32);

        if self.system.process(root).is_none() {
            return (0, 0.0);
        }

        let mut tree = BTreeSet::from([root]);
        // spark-submit forks a JVM below the shell, walk until no new children show up
        loop {
            let before = tree.len();
            for (child, process) in self.system.processes() {
                if process.parent().is_some_and(|parent| tree.contains(&parent)) {
                    tree.insert(*child);
                }
            }
            if tree.len() == before {
                break;
            }
        }

        tree.iter()
            .filter_map(|pid| self.system.process(*pid))
            .fold((0, 0.0), |(memory, cpu), process| {
                (memory + process.memory(), cpu + process.cpu_usage())
            })
    }

    pub fn start(&mut self, pid: i32) {
        if self.tracked.contains_key(&pid) {
            return;
        }

        // the first reading is usually zero, prime the cache
        self.refresh();
        self.tracked.insert(
            pid,
            Accumulated {
                byte_seconds: 0.0,
                vcore_seconds: 0.0,
                started: Instant::now(),
                samples: 0,
            },
        );
    }

    /// Block for `interval` and add one sample, weighted by the interval
    pub fn update(&mut self, pid: i32, interval: Duration) {
        self.start(pid);
        thread::sleep(interval);
        self.refresh();

        let (memory, cpu) = self.sample(pid);
        let seconds = interval.as_secs_f64();
        // readings under one core are accounted as a full core
        let vcores = f64::from(cpu.max(100.0)) * self.cpu_count as f64 / 100.0;

        trace!(pid = pid, memory = memory, cpu = cpu, "Sampled process");

        if let Some(accumulated) = self.tracked.get_mut(&pid) {
            accumulated.byte_seconds += memory as f64 * seconds;
            accumulated.vcore_seconds += vcores * seconds;
            accumulated.samples += 1;
        }
    }

    /// Finish tracking `pid` and report its integrals
    pub fn get_perf_metrics(&mut self, pid: i32) -> Result<PerfMetrics, MetricsError> {
        let accumulated = self
            .tracked
            .remove(&pid)
            .ok_or(MetricsError::UnknownProcess(pid))?;

        debug!(pid = pid, samples = accumulated.samples, "Finished sampling");

        Ok(PerfMetrics {
            memory_seconds: accumulated.byte_seconds / BYTES_PER_MEGABYTE,
            vcore_seconds: accumulated.vcore_seconds,
            elapsed: accumulated.started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn samples_running_process() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let pid = child.id() as i32;
        let mut collector = ProcessMetrics::new();

        collector.start(pid);
        collector.update(pid, Duration::from_millis(200));
        collector.update(pid, Duration::from_millis(200));

        let metrics = collector.get_perf_metrics(pid).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(metrics.memory_seconds > 0.0);
        // at least one core per sample
        let floor = 2.0 * 0.2 * num_cpus::get() as f64;
        assert!(metrics.vcore_seconds >= floor - 1e-9);
        assert!(metrics.elapsed >= Duration::from_millis(400));
    }

    #[test]
    fn dead_process_reads_zero_memory() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        let mut collector = ProcessMetrics::new();
        collector.update(pid, Duration::from_millis(10));

        let metrics = collector.get_perf_metrics(pid).unwrap();
        assert_eq!(metrics.memory_seconds, 0.0);
    }

    #[test]
    fn unknown_process() {
        let mut collector = ProcessMetrics::new();

        assert!(matches!(
            collector.get_perf_metrics(1234),
            Err(MetricsError::UnknownProcess(1234))
        ));
    }
}
