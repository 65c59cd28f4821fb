//! Dispatcher (spec §4.6): pushes a routed frame onto its chosen processor's
//! dedicated queue, retrying transient log-client failures with backoff
//! before giving up and marking the processor unhealthy.

use std::sync::Arc;

use frame_helpers::metrics::MetricsSink;
use frame_proto::FrameEnvelope;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::warn;

use super::log_client::{AppendError, LogClient};
use super::registry::{DispatchOutcome, ProcessorSnapshot, Registry, UnhealthyReason};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("processor queue at capacity")]
    QueueFull,
    #[error("dispatch failed after retries: {0}")]
    Failed(String),
}

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_FACTOR: u32 = 2;
const BACKOFF_JITTER_PCT: u64 = 20;

pub struct Dispatcher {
    log_client: Arc<dyn LogClient>,
    registry: Arc<Registry>,
    max_retries: u32,
    queue_cap_multiplier: u32,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(
        log_client: Arc<dyn LogClient>,
        registry: Arc<Registry>,
        max_retries: u32,
        queue_cap_multiplier: u32,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { log_client, registry, max_retries: max_retries.max(1), queue_cap_multiplier, metrics }
    }

    /// Dispatches `envelope` onto `candidate`'s dedicated queue. The caller
    /// has already reserved an inflight slot on `candidate`; this releases it
    /// on every path (success, queue-full, or exhausted retries).
    pub async fn dispatch(
        &self,
        envelope: &FrameEnvelope,
        candidate: &ProcessorSnapshot,
        orchestrator_seq: u64,
    ) -> Result<String, DispatchError> {
        let fields = envelope.encode_for_queue(orchestrator_seq);
        let cap = (candidate.declared_capacity as u64) * (self.queue_cap_multiplier.max(1) as u64);

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self.log_client.append_bounded(&candidate.queue_name, cap, &fields).await {
                Ok(entry_id) => {
                    self.registry.release(&candidate.processor_id, DispatchOutcome::Success);
                    self.metrics.incr("frames_dispatched");
                    return Ok(entry_id);
                }
                Err(AppendError::QueueFull) => {
                    self.registry.release(&candidate.processor_id, DispatchOutcome::Failure);
                    return Err(DispatchError::QueueFull);
                }
                Err(AppendError::Transient(err)) => {
                    last_error = err.to_string();
                    warn!(
                        processor_id = %candidate.processor_id,
                        attempt,
                        error = %last_error,
                        "dispatch attempt failed, retrying"
                    );
                    if attempt < self.max_retries {
                        sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        self.registry.release(&candidate.processor_id, DispatchOutcome::Failure);
        self.registry.mark_unhealthy(&candidate.processor_id, UnhealthyReason::DispatchFailure);
        self.metrics.incr("dispatch_failures");
        Err(DispatchError::Failed(last_error))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = BACKOFF_FACTOR.saturating_pow(attempt.saturating_sub(1));
    let base = BACKOFF_BASE.saturating_mul(multiplier);
    let jitter_ms = (base.as_millis() as u64 * BACKOFF_JITTER_PCT) / 100;
    // Deterministic jitter offset keyed on the attempt number; good enough to
    // avoid synchronized retry storms without pulling in a `rand` dependency.
    base + Duration::from_millis((attempt as u64 * 7) % jitter_ms.max(1))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use frame_helpers::metrics::NoopMetricsSink;
    use frame_proto::{FrameEnvelope, PayloadRef};

    use super::super::log_client::{LogClientError, LogEntry};
    use super::*;

    struct FlakyLogClient {
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl LogClient for FlakyLogClient {
        async fn ensure_group(&self, _: &str, _: &str) -> Result<(), LogClientError> {
            Ok(())
        }

        async fn append(&self, _: &str, _: &frame_proto::WireFields) -> Result<String, LogClientError> {
            Ok("1-0".to_string())
        }

        async fn append_bounded(
            &self,
            _stream: &str,
            _cap: u64,
            _fields: &frame_proto::WireFields,
        ) -> Result<String, AppendError> {
            if self.failures_remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 { None } else { Some(n - 1) }
            }).is_ok() {
                return Err(AppendError::Transient(LogClientError::Protocol("flaky".into())));
            }
            Ok("2-0".to_string())
        }

        async fn read_group(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: usize,
            _: u64,
        ) -> Result<Vec<LogEntry>, LogClientError> {
            Ok(Vec::new())
        }

        async fn ack(&self, _: &str, _: &str, _: &str) -> Result<(), LogClientError> {
            Ok(())
        }

        async fn claim_stale(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: u64,
            _: usize,
        ) -> Result<Vec<LogEntry>, LogClientError> {
            Ok(Vec::new())
        }

        async fn read_by_id(&self, _: &str, _: &str) -> Result<Option<LogEntry>, LogClientError> {
            Ok(None)
        }
    }

    fn sample_envelope() -> FrameEnvelope {
        FrameEnvelope {
            frame_id: "f1".into(),
            camera_id: "cam1".into(),
            capture_timestamp: chrono::Utc::now(),
            width: 1920,
            height: 1080,
            format: "jpeg".into(),
            payload: PayloadRef::External("s3://bucket/key".into()),
            metadata: None,
            trace_context: None,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_retries() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", HashSet::new(), 4, "t".into());
        assert!(registry.try_reserve("p1", 4));

        let log_client: Arc<dyn LogClient> = Arc::new(FlakyLogClient { failures_remaining: AtomicU32::new(2) });
        let dispatcher = Dispatcher::new(log_client, registry.clone(), 5, 2, Arc::new(NoopMetricsSink));

        let candidates = registry.select_candidates(&HashSet::new());
        // reserved above, so select_candidates (healthy-only filter) still
        // returns it; declared_capacity/inflight values come from the record.
        let candidate = candidates.into_iter().find(|c| c.processor_id == "p1").unwrap();

        let result = dispatcher.dispatch(&sample_envelope(), &candidate, 1).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausting_retries_marks_processor_unhealthy() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", HashSet::new(), 4, "t".into());
        assert!(registry.try_reserve("p1", 4));

        let log_client: Arc<dyn LogClient> = Arc::new(FlakyLogClient { failures_remaining: AtomicU32::new(99) });
        let dispatcher = Dispatcher::new(log_client, registry.clone(), 2, 2, Arc::new(NoopMetricsSink));

        let candidate = registry.select_candidates(&HashSet::new()).remove(0);
        let result = dispatcher.dispatch(&sample_envelope(), &candidate, 1).await;

        assert!(matches!(result, Err(DispatchError::Failed(_))));
        assert!(registry.select_candidates(&HashSet::new()).is_empty());
    }
}
