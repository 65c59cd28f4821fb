//! Consumption Loop (spec §4.7): the orchestrator's one consumer identity
//! against the upstream log. Owns the startup sequence (group creation,
//! claiming anything left stale by a crashed prior instance), the steady
//! state batch read/decode/route/dispatch/ack cycle, and periodic
//! housekeeping (re-claiming stale entries, retrying parked frames).

use std::collections::HashSet;
use std::sync::Arc;

use frame_helpers::metrics::MetricsSink;
use frame_proto::{DlqReason, FrameEnvelope, RoutingReason};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dispatcher::{DispatchError, Dispatcher};
use super::log_client::{LogClient, LogEntry};
use super::retry_park::{self, ParkedFrame, RetryPark};
use super::router::Router;

/// Fixed cadence for checking the retry park for frames whose per-frame
/// backoff has elapsed (spec §4.7 step 4: base 50 ms, cap 5 s) — independent
/// of the slower `housekeeping_interval`, which only covers `claim_stale`.
const PARK_RETRY_TICK: Duration = Duration::from_millis(50);

/// Terminal means the frame has reached a state the upstream entry can be
/// acked for (dispatched, or dead-lettered); anything else leaves the entry
/// unacked so `claim_stale` can redeliver it if the orchestrator crashes
/// while the frame is only sitting in the in-memory retry park.
enum FrameOutcome {
    Terminal,
    Parked,
}

pub struct ConsumptionConfig {
    pub upstream_stream: String,
    pub consumer_group: String,
    pub consumer_id: String,
    pub dlq_stream: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub housekeeping_interval: Duration,
    pub max_routing_attempts: u32,
}

pub struct ConsumptionLoop {
    log_client: Arc<dyn LogClient>,
    router: Router,
    dispatcher: Dispatcher,
    retry_park: Arc<RetryPark>,
    metrics: Arc<dyn MetricsSink>,
    config: ConsumptionConfig,
    next_orchestrator_seq: std::sync::atomic::AtomicU64,
}

impl ConsumptionLoop {
    pub fn new(
        log_client: Arc<dyn LogClient>,
        router: Router,
        dispatcher: Dispatcher,
        retry_park: Arc<RetryPark>,
        metrics: Arc<dyn MetricsSink>,
        config: ConsumptionConfig,
    ) -> Self {
        Self {
            log_client,
            router,
            dispatcher,
            retry_park,
            metrics,
            config,
            next_orchestrator_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.log_client
            .ensure_group(&self.config.upstream_stream, &self.config.consumer_group)
            .await?;

        let stale = self
            .log_client
            .claim_stale(
                &self.config.upstream_stream,
                &self.config.consumer_group,
                &self.config.consumer_id,
                self.config.claim_idle_ms,
                self.config.batch_size,
            )
            .await?;
        if !stale.is_empty() {
            info!(count = stale.len(), "claimed stale entries on startup");
            self.handle_batch(stale).await;
        }

        let mut housekeeping = interval(self.config.housekeeping_interval);
        let mut park_retry = interval(PARK_RETRY_TICK);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("consumption loop stopping");
                    break;
                }
                _ = housekeeping.tick() => {
                    self.run_housekeeping().await;
                }
                _ = park_retry.tick() => {
                    self.retry_ready_parked().await;
                }
                batch = self.log_client.read_group(
                    &self.config.upstream_stream,
                    &self.config.consumer_group,
                    &self.config.consumer_id,
                    self.config.batch_size,
                    self.config.block_ms,
                ) => {
                    match batch {
                        Ok(entries) if !entries.is_empty() => self.handle_batch(entries).await,
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, "read_group failed, backing off");
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_batch(&self, entries: Vec<LogEntry>) {
        for (entry_id, fields) in entries {
            let outcome = match FrameEnvelope::decode(&fields) {
                Ok(envelope) => self.route_and_dispatch(&entry_id, envelope, 0).await,
                Err(err) => {
                    warn!(entry_id, error = %err, "malformed frame entry, routing to dead-letter stream");
                    self.send_to_dlq(&fields, DlqReason::Malformed, 0).await;
                    FrameOutcome::Terminal
                }
            };
            if matches!(outcome, FrameOutcome::Terminal) {
                self.ack(&entry_id).await;
            }
        }
    }

    /// Retries every parked frame whose per-frame backoff has elapsed.
    /// Frames that reach a terminal state here (routed or dead-lettered)
    /// are acked upstream now, since they were deliberately left unacked
    /// while parked (spec §4.7 invariant I2).
    async fn retry_ready_parked(&self) {
        let ready = self.retry_park.drain_ready(chrono::Utc::now());
        if ready.is_empty() {
            return;
        }
        info!(count = ready.len(), "retrying parked frames");

        for parked in ready {
            match FrameEnvelope::decode(&parked.fields) {
                Ok(envelope) => {
                    let outcome = self.route_and_dispatch(&parked.entry_id, envelope, parked.attempts).await;
                    if matches!(outcome, FrameOutcome::Terminal) {
                        self.ack(&parked.entry_id).await;
                    }
                }
                Err(err) => {
                    warn!(entry_id = %parked.entry_id, error = %err, "parked frame no longer decodes");
                    self.send_to_dlq(&parked.fields, DlqReason::Malformed, parked.attempts).await;
                    self.ack(&parked.entry_id).await;
                }
            }
        }
    }

    async fn route_and_dispatch(&self, entry_id: &str, envelope: FrameEnvelope, prior_attempts: u32) -> FrameOutcome {
        let required_capabilities: HashSet<String> = envelope
            .metadata
            .as_ref()
            .and_then(|m| m.get("required_capabilities"))
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let outcome = self.router.route(&required_capabilities);
        let attempts = prior_attempts + outcome.attempts;

        match (outcome.chosen, outcome.reason) {
            (Some(candidate), RoutingReason::Routed) => {
                let seq = self
                    .next_orchestrator_seq
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                match self.dispatcher.dispatch(&envelope, &candidate, seq).await {
                    Ok(_) => {
                        self.metrics.incr("frames_routed");
                        info!(
                            frame_id = %envelope.frame_id,
                            processor_id = %candidate.processor_id,
                            attempts,
                            "frame routed"
                        );
                        FrameOutcome::Terminal
                    }
                    Err(DispatchError::QueueFull) => self.park_or_dlq(entry_id, envelope, attempts),
                    Err(DispatchError::Failed(reason)) => {
                        warn!(frame_id = %envelope.frame_id, error = %reason, "dispatch exhausted retries");
                        self.send_to_dlq(&envelope.encode(), DlqReason::DispatchFailure, attempts).await;
                        FrameOutcome::Terminal
                    }
                }
            }
            (None, RoutingReason::NoCapabilityMatch) => {
                self.send_to_dlq(&envelope.encode(), DlqReason::NoCapabilityMatch, attempts).await;
                FrameOutcome::Terminal
            }
            (None, _) => self.park_or_dlq(entry_id, envelope, attempts),
        }
    }

    /// Parks a frame for another routing attempt after its per-frame backoff
    /// elapses, or dead-letters it outright once `max_routing_attempts` is
    /// exhausted. Either way the caller must not ack until this returns
    /// `FrameOutcome::Terminal` — parking alone is not terminal.
    fn park_or_dlq(&self, entry_id: &str, envelope: FrameEnvelope, attempts: u32) -> FrameOutcome {
        if attempts >= self.config.max_routing_attempts {
            let fields = envelope.encode();
            let dlq_stream = self.config.dlq_stream.clone();
            let log_client = self.log_client.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let mut fields = fields;
                fields.insert("dlq_reason".to_string(), DlqReason::ParkCapExceeded.to_string());
                fields.insert("dlq_attempts".to_string(), attempts.to_string());
                if log_client.append(&dlq_stream, &fields).await.is_ok() {
                    metrics.incr("frames_dlq");
                }
            });
            return FrameOutcome::Terminal;
        }

        let now = chrono::Utc::now();
        let parked = ParkedFrame {
            entry_id: entry_id.to_string(),
            fields: envelope.encode(),
            parked_at: now,
            attempts,
            next_retry_at: now + chrono::Duration::from_std(retry_park::backoff_delay(attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
        };
        if let Some(evicted) = self.retry_park.push(parked) {
            // The evicted frame is a different, previously-parked entry that
            // has now permanently left the park — it goes to the dead-letter
            // stream and must be acked here, or it is never redelivered.
            let dlq_stream = self.config.dlq_stream.clone();
            let upstream_stream = self.config.upstream_stream.clone();
            let consumer_group = self.config.consumer_group.clone();
            let log_client = self.log_client.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                let entry_id = evicted.entry_id.clone();
                let mut fields = evicted.fields;
                fields.insert("dlq_reason".to_string(), DlqReason::ParkCapExceeded.to_string());
                fields.insert("dlq_attempts".to_string(), evicted.attempts.to_string());
                if log_client.append(&dlq_stream, &fields).await.is_ok() {
                    metrics.incr("frames_dlq");
                }
                if let Err(err) = log_client.ack(&upstream_stream, &consumer_group, &entry_id).await {
                    warn!(entry_id, error = %err, "failed to ack park-cap-evicted entry");
                }
            });
        }

        FrameOutcome::Parked
    }

    async fn run_housekeeping(&self) {
        if let Err(err) = self
            .log_client
            .claim_stale(
                &self.config.upstream_stream,
                &self.config.consumer_group,
                &self.config.consumer_id,
                self.config.claim_idle_ms,
                self.config.batch_size,
            )
            .await
        {
            warn!(error = %err, "periodic claim_stale failed");
        }
    }

    async fn send_to_dlq(&self, fields: &frame_proto::WireFields, reason: DlqReason, attempts: u32) {
        let mut fields = fields.clone();
        fields.insert("dlq_reason".to_string(), reason.to_string());
        fields.insert("dlq_attempts".to_string(), attempts.to_string());
        if self.log_client.append(&self.config.dlq_stream, &fields).await.is_ok() {
            self.metrics.incr("frames_dlq");
        }
    }

    async fn ack(&self, entry_id: &str) {
        if let Err(err) = self
            .log_client
            .ack(&self.config.upstream_stream, &self.config.consumer_group, entry_id)
            .await
        {
            warn!(entry_id, error = %err, "failed to ack upstream entry");
        }
    }
}
