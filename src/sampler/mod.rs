//! Periodic process and host sampling.
//!
//! A `Sampler` reads three sources: the counting allocator (if the binary
//! installed it), this process as seen by `sysinfo`, and the host memory and
//! CPU tables. Statistics that cannot be read are left out of the collection
//! rather than reported as errors.
use crate::constants::{POLL_COUNT, RANDOM_VALUE};
use crate::metric::{Collection, Sample};
use rand::Rng;
use sysinfo::{Pid, System};

mod alloc;

pub use self::alloc::{stats as alloc_stats, AllocStats, CountingAlloc};

/// Something that can be sampled on the poll schedule.
///
/// The pool routes the two halves differently: `runtime` samples go through
/// the accumulator and out on the report schedule, `host` samples are queued
/// for delivery straight away.
pub trait Probe: Send {
    /// Allocator and process statistics, `RandomValue` and `PollCount`.
    fn runtime(&mut self) -> Collection;
    /// Host memory and CPU statistics.
    fn host(&mut self) -> Collection;
}

/// Reads allocator, process and host statistics.
pub struct Sampler {
    system: System,
    pid: Option<Pid>,
}

impl Default for Sampler {
    fn default() -> Sampler {
        Sampler::new()
    }
}

impl Sampler {
    /// Create a sampler for the current process.
    pub fn new() -> Sampler {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("process statistics unavailable: {}", e);
                None
            }
        };
        Sampler {
            system: System::new(),
            pid,
        }
    }

    /// Take every statistic, in the order allocator, process, host,
    /// `RandomValue`, `PollCount`.
    pub fn sample(&mut self) -> Collection {
        let mut samples = Vec::with_capacity(32);
        self.alloc_samples(&mut samples);
        self.process_samples(&mut samples);
        self.host_samples(&mut samples);
        self.tail_samples(&mut samples);
        Collection::new(samples)
    }

    /// The runtime half of `sample`.
    pub fn sample_runtime(&mut self) -> Collection {
        let mut samples = Vec::with_capacity(16);
        self.alloc_samples(&mut samples);
        self.process_samples(&mut samples);
        self.tail_samples(&mut samples);
        Collection::new(samples)
    }

    /// The host half of `sample`.
    pub fn sample_host(&mut self) -> Collection {
        let mut samples = Vec::with_capacity(16);
        self.host_samples(&mut samples);
        Collection::new(samples)
    }

    fn alloc_samples(&self, samples: &mut Vec<Sample>) {
        if let Some(stats) = alloc::stats() {
            samples.push(Sample::gauge("Alloc", stats.live_bytes as f64));
            samples.push(Sample::gauge("TotalAlloc", stats.total_bytes as f64));
            samples.push(Sample::gauge("Mallocs", stats.mallocs as f64));
            samples.push(Sample::gauge("Frees", stats.frees as f64));
            samples.push(Sample::gauge("HeapObjects", stats.live_objects() as f64));
            samples.push(Sample::gauge("Reallocs", stats.reallocs as f64));
        }
    }

    fn process_samples(&mut self, samples: &mut Vec<Sample>) {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return,
        };
        if !self.system.refresh_process(pid) {
            debug!("process {} not visible, skipping process statistics", pid);
            return;
        }
        if let Some(process) = self.system.process(pid) {
            samples.push(Sample::gauge("ProcessRss", process.memory() as f64));
            samples.push(Sample::gauge("ProcessVirtual", process.virtual_memory() as f64));
            samples.push(Sample::gauge("ProcessCpuPercent", f64::from(process.cpu_usage())));
        }
    }

    fn host_samples(&mut self, samples: &mut Vec<Sample>) {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total > 0 {
            samples.push(Sample::gauge("TotalMemory", total as f64));
            samples.push(Sample::gauge("FreeMemory", self.system.free_memory() as f64));
            samples.push(Sample::gauge("UsedMemory", self.system.used_memory() as f64));
            samples.push(Sample::gauge("TotalSwap", self.system.total_swap() as f64));
            samples.push(Sample::gauge("UsedSwap", self.system.used_swap() as f64));
        }
        self.system.refresh_cpu();
        for (idx, cpu) in self.system.cpus().iter().enumerate() {
            samples.push(Sample::gauge(
                format!("CPUutilization{}", idx + 1),
                f64::from(cpu.cpu_usage()),
            ));
        }
    }

    fn tail_samples(&self, samples: &mut Vec<Sample>) {
        samples.push(Sample::gauge(RANDOM_VALUE, rand::thread_rng().gen::<f64>()));
        samples.push(Sample::counter(POLL_COUNT, 1));
    }
}

impl Probe for Sampler {
    fn runtime(&mut self) -> Collection {
        self.sample_runtime()
    }

    fn host(&mut self) -> Collection {
        self.sample_host()
    }
}
