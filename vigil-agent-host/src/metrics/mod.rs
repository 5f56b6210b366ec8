//! Host metrics sampling and the report scheduler
//!
//! - `StatsSource`: where numbers come from (sysinfo on a real host)
//! - `Sampler`: last observed gauges plus the poll counter, owned by one task
//! - `run_scheduler`: poll tick, report tick, final flush on shutdown
//!
//! Samples are copied out of the sampler before they enter the queue, so nothing
//! mutable is shared with the delivery workers.

use std::collections::HashMap;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, Pid, RefreshKind, System};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_protocol::MetricSample;

/// Name of the counter carrying the number of polls.
pub const POLL_COUNT: &str = "PollCount";

/// Fills `into` with the current value of every named gauge.
pub trait StatsSource: Send {
    fn read(&mut self, into: &mut HashMap<String, f64>);
}

/// Host memory/CPU figures and the agent's own process usage.
pub struct SystemStats {
    sys: System,
    pid: Option<Pid>,
}

impl SystemStats {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!("Cannot resolve own pid, process gauges disabled: {}", e))
            .ok();
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self { sys, pid }
    }
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSource for SystemStats {
    fn read(&mut self, into: &mut HashMap<String, f64>) {
        let sys = &mut self.sys;
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        into.insert("TotalMemory".into(), total);
        into.insert("UsedMemory".into(), used);
        into.insert("FreeMemory".into(), sys.free_memory() as f64);
        into.insert("AvailableMemory".into(), sys.available_memory() as f64);
        into.insert("TotalSwap".into(), sys.total_swap() as f64);
        into.insert("UsedSwap".into(), sys.used_swap() as f64);
        into.insert("FreeSwap".into(), sys.free_swap() as f64);
        into.insert(
            "MemoryUsedPercent".into(),
            if total > 0.0 { used / total * 100.0 } else { 0.0 },
        );

        into.insert("CPUUtilization".into(), sys.global_cpu_info().cpu_usage() as f64);
        into.insert("CPUCount".into(), sys.cpus().len() as f64);
        for (i, cpu) in sys.cpus().iter().enumerate() {
            into.insert(format!("CPUutilization{}", i + 1), cpu.cpu_usage() as f64);
        }

        let load = System::load_average();
        into.insert("LoadAverage1".into(), load.one);
        into.insert("LoadAverage5".into(), load.five);
        into.insert("LoadAverage15".into(), load.fifteen);
        into.insert("Uptime".into(), System::uptime() as f64);

        let Some(pid) = self.pid else { return };
        if !sys.refresh_process(pid) {
            return;
        }
        if let Some(process) = sys.process(pid) {
            let io = process.disk_usage();
            into.insert("ProcessResident".into(), process.memory() as f64);
            into.insert("ProcessVirtual".into(), process.virtual_memory() as f64);
            into.insert("ProcessCPU".into(), process.cpu_usage() as f64);
            into.insert("ProcessRunTime".into(), process.run_time() as f64);
            into.insert("ProcessReadBytes".into(), io.read_bytes as f64);
            into.insert("ProcessWrittenBytes".into(), io.written_bytes as f64);
            into.insert("ProcessTotalReadBytes".into(), io.total_read_bytes as f64);
            into.insert("ProcessTotalWrittenBytes".into(), io.total_written_bytes as f64);
        }
    }
}

/// Agent-side metric state.
pub struct Sampler<S> {
    source: S,
    gauges: HashMap<String, f64>,
    poll_count: i64,
    /// `poll_count` as of the last report.
    reported_polls: i64,
}

impl<S: StatsSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self { source, gauges: HashMap::new(), poll_count: 0, reported_polls: 0 }
    }

    pub fn poll(&mut self) {
        self.source.read(&mut self.gauges);
        self.poll_count += 1;
    }

    pub fn poll_count(&self) -> i64 {
        self.poll_count
    }

    /// Every gauge (sorted by name) followed by `PollCount` carrying the polls
    /// made since the previous report, so the collector's sum stays equal to
    /// the total number of polls.
    pub fn report(&mut self) -> Vec<MetricSample> {
        let mut batch: Vec<MetricSample> = self
            .gauges
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(name, v)| MetricSample::gauge(name.clone(), *v))
            .collect();
        batch.sort_by(|a, b| a.id.cmp(&b.id));

        batch.push(MetricSample::counter(POLL_COUNT, self.poll_count - self.reported_polls));
        self.reported_polls = self.poll_count;
        batch
    }
}

/// Poll and report until `shutdown` fires, then flush once more and close the
/// queue by dropping the sender. Returns the number of samples pushed.
pub async fn run_scheduler<S: StatsSource>(
    mut sampler: Sampler<S>,
    poll_interval: Duration,
    report_interval: Duration,
    queue: mpsc::Sender<MetricSample>,
    shutdown: CancellationToken,
) -> u64 {
    let mut poll_tick = interval_at(Instant::now() + poll_interval, poll_interval);
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report_tick = interval_at(Instant::now() + report_interval, report_interval);
    report_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pushed = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = poll_tick.tick() => {
                sampler.poll();
                debug!("Polled stats (poll #{})", sampler.poll_count());
            }
            _ = report_tick.tick() => {
                match enqueue(&queue, sampler.report()).await {
                    Some(n) => pushed += n,
                    None => return pushed,
                }
            }
        }
    }

    info!("Shutdown requested, flushing pending metrics");
    if let Some(n) = enqueue(&queue, sampler.report()).await {
        pushed += n;
    }
    drop(queue);
    info!("Delivery queue closed after {} samples", pushed);
    pushed
}

/// Pushes a report, waiting while the queue is full. `None` when every worker
/// is gone and the queue can no longer be fed.
async fn enqueue(queue: &mpsc::Sender<MetricSample>, batch: Vec<MetricSample>) -> Option<u64> {
    let mut pushed = 0;
    for sample in batch {
        if queue.send(sample).await.is_err() {
            warn!("Delivery queue closed by the workers, dropping report");
            return None;
        }
        pushed += 1;
    }
    debug!("Queued {} samples", pushed);
    Some(pushed)
}
