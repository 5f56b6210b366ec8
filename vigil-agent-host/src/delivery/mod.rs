// Delivery worker pool
//
// A fixed number of workers share one bounded queue fed by the scheduler.
// Each worker takes one sample at a time, encodes it into an envelope and
// hands it to the transport; every attempt ends up on the results channel.
//
// Shutdown is a drain: once the scheduler drops its sender, workers keep
// pulling until the queue is closed and empty. `abort` is only fired when the
// drain overruns its deadline, and stops workers between samples.

use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_protocol::{CodecError, EnvelopeCodec, MetricSample};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to encode sample: {0}")]
    Encode(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector rejected sample with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub metric: String,
    pub result: Result<(), DeliveryError>,
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<MetricSample>>>;

pub struct WorkerPool {
    workers: JoinSet<()>,
    abort: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        queue: mpsc::Receiver<MetricSample>,
        codec: Arc<EnvelopeCodec>,
        transport: Arc<dyn Transport>,
        results: mpsc::UnboundedSender<DeliveryOutcome>,
    ) -> Self {
        let queue: SharedQueue = Arc::new(Mutex::new(queue));
        let abort = CancellationToken::new();
        let mut workers = JoinSet::new();
        for id in 0..size.max(1) {
            workers.spawn(worker(
                id,
                queue.clone(),
                codec.clone(),
                transport.clone(),
                results.clone(),
                abort.clone(),
            ));
        }
        info!("Started {} delivery workers", workers.len());
        Self { workers, abort }
    }

    /// Stops workers at their next sample boundary, even if the queue is
    /// still open.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Waits for every worker to exit.
    pub async fn join(&mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                error!("Delivery worker failed: {}", e);
            }
        }
    }

    /// Waits up to `timeout` for the workers to empty the closed queue, then
    /// aborts the rest. Returns `true` if the drain completed in time.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        if tokio::time::timeout(timeout, self.join()).await.is_ok() {
            info!("Delivery queue drained");
            return true;
        }
        warn!("Drain did not finish within {:?}, aborting workers", timeout);
        self.abort();
        self.join().await;
        false
    }
}

async fn worker(
    id: usize,
    queue: SharedQueue,
    codec: Arc<EnvelopeCodec>,
    transport: Arc<dyn Transport>,
    results: mpsc::UnboundedSender<DeliveryOutcome>,
    abort: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => None,
            sample = async { queue.lock().await.recv().await } => sample,
        };
        let Some(sample) = next else { break };

        let result = deliver(&codec, transport.as_ref(), &sample).await;
        if let Err(e) = &result {
            debug!("Worker {} failed to deliver {}: {}", id, sample.id, e);
        }
        if results.send(DeliveryOutcome { metric: sample.id, result }).is_err() {
            debug!("Results channel closed");
        }
    }
    debug!("Delivery worker {} stopped", id);
}

async fn deliver(
    codec: &EnvelopeCodec,
    transport: &dyn Transport,
    sample: &MetricSample,
) -> Result<(), DeliveryError> {
    let envelope = codec.encode(sample)?;
    transport.send(&envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::FakeStats;
    use crate::metrics::{run_scheduler, Sampler, POLL_COUNT};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use vigil_protocol::{Envelope, EnvelopeKeys};

    /// Records every decoded sample; optionally rejects one metric id.
    #[derive(Default)]
    struct FakeTransport {
        seen: StdMutex<Vec<MetricSample>>,
        reject: Option<&'static str>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let sample: MetricSample = EnvelopeCodec::plain().decode(envelope)?;
            let rejected = self.reject == Some(sample.id.as_str());
            self.seen.lock().unwrap().push(sample);
            if rejected {
                return Err(DeliveryError::Rejected { status: 400, body: "bad".into() });
            }
            Ok(())
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<DeliveryOutcome>) -> Vec<DeliveryOutcome> {
        let mut out = Vec::new();
        while let Some(o) = rx.recv().await {
            out.push(o);
        }
        out
    }

    #[tokio::test]
    async fn test_pool_delivers_every_sample() {
        let transport = Arc::new(FakeTransport::default());
        let (tx, rx) = mpsc::channel(4);
        let (res_tx, res_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::spawn(3, rx, Arc::new(EnvelopeCodec::plain()), transport.clone(), res_tx);

        for i in 0..20 {
            tx.send(MetricSample::counter(format!("m{i}"), i)).await.unwrap();
        }
        drop(tx);

        assert!(pool.drain(Duration::from_secs(5)).await);
        let outcomes = collect(res_rx).await;
        assert_eq!(outcomes.len(), 20);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let mut ids: Vec<String> = transport.seen.lock().unwrap().iter().map(|s| s.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn test_failures_surface_on_results() {
        let transport = Arc::new(FakeTransport { reject: Some("bad"), ..Default::default() });
        let (tx, rx) = mpsc::channel(4);
        let (res_tx, res_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::spawn(2, rx, Arc::new(EnvelopeCodec::plain()), transport, res_tx);

        tx.send(MetricSample::gauge("good", 1.0)).await.unwrap();
        tx.send(MetricSample::gauge("bad", 2.0)).await.unwrap();
        drop(tx);
        pool.join().await;

        let outcomes = collect(res_rx).await;
        assert_eq!(outcomes.len(), 2);
        let bad = outcomes.iter().find(|o| o.metric == "bad").unwrap();
        assert!(matches!(bad.result, Err(DeliveryError::Rejected { status: 400, .. })));
        assert!(outcomes.iter().find(|o| o.metric == "good").unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn test_signed_envelopes_carry_signature() {
        struct Inspect(StdMutex<Vec<Envelope>>);
        #[async_trait]
        impl Transport for Inspect {
            async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
                self.0.lock().unwrap().push(envelope.clone());
                Ok(())
            }
        }

        let transport = Arc::new(Inspect(StdMutex::new(Vec::new())));
        let codec = EnvelopeCodec::new(EnvelopeKeys { signing_key: Some(b"k".to_vec()), ..Default::default() });
        let (tx, rx) = mpsc::channel(1);
        let (res_tx, _res_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::spawn(1, rx, Arc::new(codec), transport.clone(), res_tx);
        tx.send(MetricSample::gauge("cpu", 1.0)).await.unwrap();
        drop(tx);
        pool.join().await;

        let sent = transport.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].compressed);
        assert!(sent[0].signature.is_some());
    }

    #[tokio::test]
    async fn test_abort_stops_workers_with_open_queue() {
        let transport = Arc::new(FakeTransport::default());
        let (tx, rx) = mpsc::channel(4);
        let (res_tx, _res_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::spawn(2, rx, Arc::new(EnvelopeCodec::plain()), transport, res_tx);

        // Sender still alive: only the abort can end the workers.
        assert!(!pool.drain(Duration::from_millis(50)).await);
        drop(tx);
    }

    #[tokio::test]
    async fn test_shutdown_drains_everything_already_queued() {
        let transport = Arc::new(FakeTransport { delay: Some(Duration::from_millis(5)), ..Default::default() });
        let (tx, rx) = mpsc::channel(2);
        let (res_tx, res_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::spawn(2, rx, Arc::new(EnvelopeCodec::plain()), transport.clone(), res_tx);

        let mut sampler = Sampler::new(FakeStats::new(&["A", "B", "C", "D"]));
        sampler.poll();
        sampler.poll();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let pushed = run_scheduler(
            sampler,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            tx,
            shutdown,
        )
        .await;
        assert_eq!(pushed, 5);

        assert!(pool.drain(Duration::from_secs(5)).await);
        let outcomes = collect(res_rx).await;
        assert_eq!(outcomes.len() as u64, pushed);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let seen = transport.seen.lock().unwrap();
        let polls = seen.iter().find(|s| s.id == POLL_COUNT).unwrap();
        assert_eq!(*polls, MetricSample::counter(POLL_COUNT, 2));
    }
}
