//! Health Monitor (spec §4.4): a periodic tick that drives heartbeat
//! timeouts, circuit-breaker transitions, and grace-period eviction on the
//! registry. The actual state machine lives on `Registry::run_health_tick`;
//! this module is just the ticking task.

use std::sync::Arc;

use frame_helpers::metrics::MetricsSink;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::registry::{HealthThresholds, Registry};

pub async fn run_health_monitor(
    registry: Arc<Registry>,
    thresholds: HealthThresholds,
    tick: Duration,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(tick.max(Duration::from_millis(1)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("health monitor stopping");
                break;
            }
            _ = ticker.tick() => {
                let evicted = registry.run_health_tick(&thresholds);
                for processor_id in &evicted {
                    warn!(processor_id, "processor evicted after unhealthy grace period");
                    metrics.incr("processors_evicted");
                }

                let total_inflight: u32 = registry
                    .snapshot_all()
                    .iter()
                    .map(|(snapshot, _)| snapshot.inflight)
                    .sum();
                metrics.set_gauge("registry_inflight_total", total_inflight as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration as StdDuration;

    use frame_helpers::metrics::RecordingMetricsSink;
    use tokio::time::timeout;

    use super::*;
    use crate::core::registry::ProcessorState;

    #[tokio::test]
    async fn evicts_unhealthy_processor_past_grace_period() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", HashSet::new(), 4, "t".into());
        registry.mark_unhealthy("p1", super::super::registry::UnhealthyReason::DispatchFailure);

        let thresholds = HealthThresholds {
            heartbeat_timeout: StdDuration::from_secs(60),
            failure_threshold: 99,
            circuit_cooldown: StdDuration::from_secs(60),
            circuit_cooldown_cap: StdDuration::from_secs(60),
            eviction_grace: StdDuration::from_millis(1),
        };

        let metrics: Arc<dyn MetricsSink> = Arc::new(RecordingMetricsSink::default());
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::time::sleep(StdDuration::from_millis(5)).await;

        let handle = tokio::spawn(run_health_monitor(
            registry.clone(),
            thresholds,
            StdDuration::from_millis(1),
            metrics,
            shutdown_clone,
        ));

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        shutdown.cancel();
        let _ = timeout(StdDuration::from_secs(1), handle).await;

        assert!(registry.snapshot_all().is_empty());
    }

    #[tokio::test]
    async fn leaves_healthy_processor_alone() {
        let registry = Arc::new(Registry::new());
        registry.register("p1", HashSet::new(), 4, "t".into());

        let thresholds = HealthThresholds {
            heartbeat_timeout: StdDuration::from_secs(60),
            failure_threshold: 5,
            circuit_cooldown: StdDuration::from_secs(30),
            circuit_cooldown_cap: StdDuration::from_secs(300),
            eviction_grace: StdDuration::from_secs(120),
        };

        let evicted = registry.run_health_tick(&thresholds);
        assert!(evicted.is_empty());
        let snapshot = registry.snapshot_all();
        assert_eq!(snapshot[0].1, ProcessorState::Healthy);
    }
}
