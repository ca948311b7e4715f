//! The agent's delivery pipeline.
//!
//! Four kinds of thread cooperate around one bounded job queue:
//!
//!  * the poller samples on `poll_interval`, adding the runtime half to the
//!    accumulator and queueing the host half straight away;
//!  * the reporter drains the accumulator on `report_interval` and queues
//!    what it found as one batch;
//!  * `workers` delivery threads pull batches off the queue and hand them to
//!    the `Client` under the retry policy.
//!
//! Shutdown closes a broadcast channel that every thread selects on. The
//! schedulers stop, the accumulator is drained one last time into the queue,
//! the queue is closed and the workers flush what is left with a single
//! attempt per batch.
use crate::accumulator::Accumulator;
use crate::metric::Collection;
use crate::retry::{self, Policy};
use crate::sampler::Probe;
use crate::transport::{Client, TransportError};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A unit of delivery: every sample of every collection goes out in one
/// `send_batch` call.
pub type Batch = Vec<Collection>;

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How often the poller samples.
    pub poll_interval: Duration,
    /// How often the reporter drains the accumulator.
    pub report_interval: Duration,
    /// Number of delivery workers.
    pub workers: usize,
    /// Capacity of the job queue, in batches.
    pub queue_depth: usize,
    /// Retry policy for each batch.
    pub retry: Policy,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            workers: 1,
            queue_depth: 64,
            retry: Policy::default(),
        }
    }
}

/// Delivery counters, updated by the workers.
#[derive(Debug, Default)]
pub struct Stats {
    delivered: AtomicUsize,
    failed: AtomicUsize,
    attempts: AtomicUsize,
}

impl Stats {
    /// Batches delivered.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Batches dropped after exhausting retries or a non-retryable error.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// `send_batch` calls made.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

/// How a shutdown went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Threads that finished within the grace period.
    pub joined: usize,
    /// Names of threads still running when the grace period ran out.
    pub abandoned: Vec<String>,
}

/// Sends on `done` when dropped, so a thread reports its end even if it
/// panics.
struct Finished {
    name: String,
    done: Sender<String>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        let _ = self.done.send(self.name.clone());
    }
}

/// A running delivery pipeline.
pub struct Pool {
    accumulator: Arc<Accumulator>,
    stats: Arc<Stats>,
    jobs: Option<Sender<Batch>>,
    shutdown: Option<Sender<()>>,
    done: Receiver<String>,
    threads: Vec<(String, thread::JoinHandle<()>)>,
}

impl Pool {
    /// Spawn the poller, reporter and workers.
    pub fn start<P>(
        client: Arc<dyn Client>,
        accumulator: Arc<Accumulator>,
        probe: P,
        config: PoolConfig,
    ) -> Result<Pool, std::io::Error>
    where
        P: Probe + 'static,
    {
        let (jobs_tx, jobs_rx) = bounded::<Batch>(config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<String>();
        let stats = Arc::new(Stats::default());
        let mut threads = Vec::new();

        let spawn = |name: String, body: Box<dyn FnOnce() + Send>| -> std::io::Result<(String, thread::JoinHandle<()>)> {
            let guard = Finished {
                name: name.clone(),
                done: done_tx.clone(),
            };
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                let _guard = guard;
                body();
            })?;
            Ok((name, handle))
        };

        for idx in 0..config.workers.max(1) {
            let worker = Worker {
                id: idx,
                client: Arc::clone(&client),
                jobs: jobs_rx.clone(),
                shutdown: shutdown_rx.clone(),
                stats: Arc::clone(&stats),
                retry: config.retry,
            };
            threads.push(spawn(format!("metrika-worker-{}", idx), Box::new(move || worker.run()))?);
        }

        let poller = Poller {
            probe,
            accumulator: Arc::clone(&accumulator),
            jobs: jobs_tx.clone(),
            shutdown: shutdown_rx.clone(),
            interval: config.poll_interval,
        };
        threads.push(spawn("metrika-poller".to_string(), Box::new(move || poller.run()))?);

        let reporter = Reporter {
            accumulator: Arc::clone(&accumulator),
            jobs: jobs_tx.clone(),
            shutdown: shutdown_rx,
            interval: config.report_interval,
        };
        threads.push(spawn("metrika-reporter".to_string(), Box::new(move || reporter.run()))?);

        info!(
            "pool started: {} workers, poll every {:?}, report every {:?}",
            config.workers.max(1),
            config.poll_interval,
            config.report_interval
        );
        Ok(Pool {
            accumulator,
            stats,
            jobs: Some(jobs_tx),
            shutdown: Some(shutdown_tx),
            done: done_rx,
            threads,
        })
    }

    /// Delivery counters.
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Stop the schedulers, flush what is pending and wait up to `grace` for
    /// every thread to finish.
    pub fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        // closing the channel wakes every select on it
        drop(self.shutdown.take());

        let schedulers = ["metrika-poller", "metrika-reporter"];
        let mut finished: Vec<String> = Vec::new();
        while finished.iter().filter(|n| schedulers.contains(&n.as_str())).count() < schedulers.len() {
            match self.done.recv_deadline(deadline) {
                Ok(name) => finished.push(name),
                Err(_) => break,
            }
        }

        if let Some(jobs) = self.jobs.take() {
            let remaining = self.accumulator.drain();
            if !remaining.is_empty() {
                debug!("queueing final batch of {} collections", remaining.len());
                let timeout = deadline.saturating_duration_since(Instant::now());
                if jobs.send_timeout(remaining, timeout).is_err() {
                    warn!("job queue full at shutdown, dropping final batch");
                }
            }
            // the last sender goes away here; workers stop once the queue is empty
        }

        while finished.len() < self.threads.len() {
            match self.done.recv_deadline(deadline) {
                Ok(name) => finished.push(name),
                Err(_) => break,
            }
        }

        let mut report = ShutdownReport {
            joined: 0,
            abandoned: Vec::new(),
        };
        for (name, handle) in self.threads.drain(..) {
            if finished.contains(&name) {
                if handle.join().is_err() {
                    error!("{} panicked", name);
                }
                report.joined += 1;
            } else {
                report.abandoned.push(name);
            }
        }
        if report.abandoned.is_empty() {
            info!(
                "pool stopped: {} delivered, {} failed, {} attempts",
                self.stats.delivered(),
                self.stats.failed(),
                self.stats.attempts()
            );
        } else {
            warn!("grace period over, abandoning {:?}", report.abandoned);
        }
        report
    }
}

struct Poller<P> {
    probe: P,
    accumulator: Arc<Accumulator>,
    jobs: Sender<Batch>,
    shutdown: Receiver<()>,
    interval: Duration,
}

impl<P: Probe> Poller<P> {
    fn run(mut self) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => self.poll(),
                recv(self.shutdown) -> _ => break,
            }
        }
        trace!("poller stopped");
    }

    fn poll(&mut self) {
        self.accumulator.add(self.probe.runtime());
        let host = self.probe.host();
        if host.is_empty() {
            return;
        }
        select! {
            send(self.jobs, vec![host.clone()]) -> res => {
                if res.is_err() {
                    self.accumulator.add(host);
                }
            }
            recv(self.shutdown) -> _ => {
                // hand it to the final drain instead
                self.accumulator.add(host);
            }
        }
    }
}

struct Reporter {
    accumulator: Arc<Accumulator>,
    jobs: Sender<Batch>,
    shutdown: Receiver<()>,
    interval: Duration,
}

impl Reporter {
    fn run(self) {
        let ticker = tick(self.interval);
        loop {
            select! {
                recv(ticker) -> _ => self.report(),
                recv(self.shutdown) -> _ => break,
            }
        }
        trace!("reporter stopped");
    }

    fn report(&self) {
        let batch = self.accumulator.drain();
        if batch.is_empty() {
            return;
        }
        trace!("reporting {} collections", batch.len());
        select! {
            send(self.jobs, batch.clone()) -> res => {
                if res.is_err() {
                    self.requeue(batch);
                }
            }
            recv(self.shutdown) -> _ => self.requeue(batch),
        }
    }

    fn requeue(&self, batch: Batch) {
        for collection in batch {
            self.accumulator.add(collection);
        }
    }
}

struct Worker {
    id: usize,
    client: Arc<dyn Client>,
    jobs: Receiver<Batch>,
    shutdown: Receiver<()>,
    stats: Arc<Stats>,
    retry: Policy,
}

impl Worker {
    fn run(self) {
        loop {
            select! {
                recv(self.jobs) -> msg => match msg {
                    Ok(batch) => self.deliver(&batch, &self.retry),
                    Err(_) => return,
                },
                recv(self.shutdown) -> _ => break,
            }
        }
        // best effort: one attempt per batch until the queue closes
        let once = Policy::once();
        for batch in self.jobs.iter() {
            self.deliver(&batch, &once);
        }
        trace!("worker {} stopped", self.id);
    }

    fn deliver(&self, batch: &[Collection], policy: &Policy) {
        let samples: usize = batch.iter().map(Collection::len).sum();
        let res = retry::with_backoff(
            policy,
            |_| {
                self.stats.attempts.fetch_add(1, Ordering::Relaxed);
                self.client.send_batch(batch)
            },
            TransportError::is_retryable,
        );
        match res {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!("worker {} delivered {} samples", self.id, samples);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("worker {} dropping batch of {} samples: {}", self.id, samples, e);
            }
        }
    }
}
